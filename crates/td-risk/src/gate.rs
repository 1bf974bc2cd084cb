//! The pre-trade risk gate.
//!
//! Pure over its inputs: the caller assembles a [`PortfolioSnapshot`], the
//! active limit records, and the order projection; the gate returns a
//! verdict and mutates nothing.

use td_config::{RiskDefaults, VarConfig, VarMethod};
use td_schemas::{Amount, LimitKind, LimitScope, RiskLimit};
use uuid::Uuid;

use crate::types::{OrderProjection, PortfolioSnapshot, RiskVerdict, Violation};
use crate::var::{historical_var_pct_e4, monte_carlo_var_pct_e4};

/// Resolve the winning limit per kind for this order.
///
/// A limit applies when its scope matches the order (Portfolio always,
/// Strategy on strategy_id, Instrument on the instrument key). Among
/// applicable limits of the same kind the narrowest scope wins:
/// Instrument > Strategy > Portfolio.
fn resolve_limits<'a>(
    limits: &'a [RiskLimit],
    order: &OrderProjection,
) -> Vec<&'a RiskLimit> {
    let mut winners: Vec<&RiskLimit> = Vec::new();

    for l in limits.iter().filter(|l| l.is_active) {
        let applies = match &l.scope {
            LimitScope::Portfolio => true,
            LimitScope::Strategy { strategy_id } => {
                order.strategy_id.as_deref() == Some(strategy_id.as_str())
            }
            LimitScope::Instrument { instrument } => *instrument == order.instrument,
        };
        if !applies {
            continue;
        }

        match winners.iter_mut().find(|w| w.kind == l.kind) {
            Some(slot) => {
                if l.scope.rank() > slot.scope.rank() {
                    *slot = l;
                }
            }
            None => winners.push(l),
        }
    }

    winners
}

/// Materialize baseline limits from config for kinds that have no explicit
/// record. Baselines are portfolio-scoped.
fn baseline_limits(defaults: &RiskDefaults, resolved: &[&RiskLimit]) -> Vec<RiskLimit> {
    let mut out = Vec::new();
    let has = |k: LimitKind| resolved.iter().any(|l| l.kind == k);

    let mut push = |kind: LimitKind, limit_value: i64| {
        out.push(RiskLimit {
            limit_id: Uuid::nil(),
            scope: LimitScope::Portfolio,
            kind,
            limit_value,
            current_value: 0,
            is_active: true,
        });
    };

    if !has(LimitKind::PositionSize) {
        if let Some(v) = defaults.max_position_size {
            push(LimitKind::PositionSize, v);
        }
    }
    if !has(LimitKind::Notional) {
        if let Some(v) = defaults.max_notional_rupees {
            push(LimitKind::Notional, v.saturating_mul(td_schemas::AMOUNT_SCALE));
        }
    }
    if !has(LimitKind::Drawdown) {
        // Prefer the drawdown baseline; fall back to the daily-loss one.
        if let Some(v) = defaults
            .max_drawdown_rupees
            .or(defaults.max_daily_loss_rupees)
        {
            push(LimitKind::Drawdown, v.saturating_mul(td_schemas::AMOUNT_SCALE));
        }
    }

    out
}

/// Run every check and collect violations. `approved` iff none failed.
pub fn evaluate(
    var_cfg: &VarConfig,
    defaults: &RiskDefaults,
    limits: &[RiskLimit],
    snapshot: &PortfolioSnapshot,
    order: &OrderProjection,
) -> RiskVerdict {
    let resolved = resolve_limits(limits, order);
    let baselines = baseline_limits(defaults, &resolved);

    let mut violations: Vec<Violation> = Vec::new();

    for limit in resolved.iter().copied().chain(baselines.iter()) {
        if let Some(v) = check_limit(var_cfg, limit, snapshot, order) {
            violations.push(v);
        }
    }

    RiskVerdict {
        approved: violations.is_empty(),
        violations,
    }
}

fn check_limit(
    var_cfg: &VarConfig,
    limit: &RiskLimit,
    snapshot: &PortfolioSnapshot,
    order: &OrderProjection,
) -> Option<Violation> {
    let exposure = snapshot
        .per_instrument
        .get(&order.instrument)
        .copied()
        .unwrap_or_default();
    let order_notional = order.notional();

    let violation = |observed: i64| Violation {
        metric: limit.kind,
        limit: limit.limit_value,
        observed,
        scope: limit.scope.clone(),
    };

    match limit.kind {
        LimitKind::PositionSize => {
            let post_qty = exposure.net_qty.saturating_add(order.signed_qty());
            let observed = post_qty.abs();
            (observed > limit.limit_value).then(|| violation(observed))
        }

        LimitKind::Notional => {
            let base = match &limit.scope {
                LimitScope::Instrument { .. } => exposure.notional,
                LimitScope::Strategy { strategy_id } => snapshot
                    .per_strategy_notional
                    .get(strategy_id)
                    .copied()
                    .unwrap_or(Amount::ZERO),
                LimitScope::Portfolio => snapshot.gross_notional,
            };
            let projected = base.saturating_add(order_notional);
            (projected.units() > limit.limit_value).then(|| violation(projected.units()))
        }

        LimitKind::Concentration => {
            let post_instrument = exposure.notional.saturating_add(order_notional);
            let post_gross = snapshot.gross_notional.saturating_add(order_notional);
            if post_gross == Amount::ZERO {
                return None;
            }
            let observed_pct_e4 = ((post_instrument.units() as i128) * 1_000_000
                / (post_gross.units() as i128)) as i64;
            (observed_pct_e4 > limit.limit_value).then(|| violation(observed_pct_e4))
        }

        LimitKind::Drawdown => {
            // Two trip wires share the record: realized loss today, and
            // equity drawdown from the session peak.
            let loss_today = (-snapshot.realized_pnl_today.units()).max(0);
            if loss_today >= limit.limit_value && limit.limit_value > 0 {
                return Some(violation(loss_today));
            }
            let dd = snapshot
                .day_peak_equity
                .saturating_sub(snapshot.equity)
                .units()
                .max(0);
            (dd >= limit.limit_value && limit.limit_value > 0).then(|| violation(dd))
        }

        LimitKind::Var => {
            let var_frac_e4 = match var_cfg.method {
                VarMethod::Historical => historical_var_pct_e4(
                    &snapshot.daily_returns_pct_e4,
                    var_cfg.confidence_pct,
                ),
                VarMethod::MonteCarlo => monte_carlo_var_pct_e4(
                    &snapshot.daily_returns_pct_e4,
                    var_cfg.confidence_pct,
                    var_cfg.monte_carlo_paths,
                    var_cfg.seed,
                ),
            };
            let projected_gross = snapshot.gross_notional.saturating_add(order_notional);
            let projected_var =
                ((projected_gross.units() as i128) * (var_frac_e4 as i128) / 1_000_000) as i64;
            (projected_var > limit.limit_value).then(|| violation(projected_var))
        }
    }
}
