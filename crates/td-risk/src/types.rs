use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use td_schemas::{Amount, InstrumentKey, LimitKind, LimitScope, Side};

/// Current exposure on one instrument.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentExposure {
    /// Signed net quantity: +long, -short.
    pub net_qty: i64,
    /// Gross notional currently deployed on the instrument.
    pub notional: Amount,
}

/// Point-in-time view of the account the gate evaluates against.
/// Assembled by the caller; the gate never reads stores itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub equity: Amount,
    /// Highest equity observed since the session opened.
    pub day_peak_equity: Amount,
    /// Realized P&L accumulated today (negative = loss).
    pub realized_pnl_today: Amount,
    /// Gross notional across all open positions.
    pub gross_notional: Amount,
    pub per_instrument: BTreeMap<InstrumentKey, InstrumentExposure>,
    pub per_strategy_notional: BTreeMap<String, Amount>,
    /// Daily portfolio returns history at 1e-4 percent scale, oldest first.
    /// Feeds the historical VaR estimator and calibrates Monte Carlo.
    pub daily_returns_pct_e4: Vec<i64>,
}

/// The order being evaluated, projected to the fields risk cares about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderProjection {
    pub strategy_id: Option<String>,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub qty: i64,
    pub price: Amount,
    pub lot_size: i64,
}

impl OrderProjection {
    pub fn notional(&self) -> Amount {
        self.price
            .checked_mul_qty(self.qty.saturating_mul(self.lot_size))
            .unwrap_or(Amount::MAX)
    }

    /// Signed quantity delta this order applies to net_qty.
    pub fn signed_qty(&self) -> i64 {
        match self.side {
            Side::Buy => self.qty.saturating_mul(self.lot_size),
            Side::Sell => -self.qty.saturating_mul(self.lot_size),
        }
    }
}

/// One failed check. Units of `limit`/`observed` follow the kind, same as
/// [`td_schemas::RiskLimit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub metric: LimitKind,
    pub limit: i64,
    pub observed: i64,
    pub scope: LimitScope,
}

/// Gate output: approved iff no check failed. All checks run; violations
/// accumulate rather than short-circuiting, so a rejection names everything
/// wrong with the intent at once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub approved: bool,
    pub violations: Vec<Violation>,
}

impl RiskVerdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            violations: Vec::new(),
        }
    }
}
