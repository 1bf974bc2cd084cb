//! td-margin — pre-trade margin requirement and availability checks.
//!
//! Margin is a percentage-of-notional model driven by versioned
//! [`MarginRule`] records: SPAN and exposure percentages for derivatives, a
//! delivery percentage for cash equity, and full premium for long option
//! positions. Stress testing applies multiplicative shocks to the
//! SPAN+exposure component and reports the stressed totals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use td_schemas::{Amount, Instrument, MarginRule, MarginType, ProductType, Side};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Breakdown of the margin required for one order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginRequired {
    pub span: Amount,
    pub exposure: Amount,
    /// Full premium for long option positions; zero otherwise.
    pub option_premium: Amount,
    pub total: Amount,
}

impl MarginRequired {
    pub const ZERO: MarginRequired = MarginRequired {
        span: Amount::ZERO,
        exposure: Amount::ZERO,
        option_premium: Amount::ZERO,
        total: Amount::ZERO,
    };
}

/// Availability verdict.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginVerdict {
    Ok,
    Shortfall {
        available: Amount,
        required: Amount,
        shortfall: Amount,
    },
}

impl MarginVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, MarginVerdict::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarginError {
    /// No SPAN/exposure rule active for a derivative order.
    NoActiveRule {
        broker_id: String,
        margin_type: MarginType,
    },
    ValueOverflow,
}

impl std::fmt::Display for MarginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarginError::NoActiveRule {
                broker_id,
                margin_type,
            } => write!(f, "no {margin_type:?} margin rule active for {broker_id}"),
            MarginError::ValueOverflow => write!(f, "order value overflow in margin computation"),
        }
    }
}

impl std::error::Error for MarginError {}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MarginInput<'a> {
    pub broker_id: &'a str,
    pub instrument: &'a Instrument,
    pub side: Side,
    pub product: ProductType,
    pub qty: i64,
    pub price: Amount,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MarginCalculator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct MarginCalculator {
    rules: Vec<MarginRule>,
}

impl MarginCalculator {
    pub fn new(rules: Vec<MarginRule>) -> Self {
        Self { rules }
    }

    fn active_pct(
        &self,
        broker_id: &str,
        instrument: &td_schemas::InstrumentKey,
        margin_type: MarginType,
        at: DateTime<Utc>,
    ) -> Option<i64> {
        // Latest effective_from wins on overlap, mirroring the fee rules.
        self.rules
            .iter()
            .filter(|r| {
                r.broker_id == broker_id
                    && &r.instrument == instrument
                    && r.margin_type == margin_type
                    && r.is_active_at(at)
            })
            .max_by_key(|r| r.effective_from)
            .map(|r| r.pct_e4)
    }

    /// Compute the margin required for one order.
    ///
    /// - Long options block the full premium and nothing else.
    /// - Non-derivative instruments use the delivery percentage of order
    ///   value (full value when no rule is configured).
    /// - Derivatives are SPAN % + exposure % of order value.
    pub fn required(&self, input: &MarginInput<'_>) -> Result<MarginRequired, MarginError> {
        let units = input
            .qty
            .checked_mul(input.instrument.lot_size)
            .ok_or(MarginError::ValueOverflow)?;
        let order_value = input
            .price
            .checked_mul_qty(units)
            .ok_or(MarginError::ValueOverflow)?;

        if input.instrument.is_long_option(input.side) {
            return Ok(MarginRequired {
                span: Amount::ZERO,
                exposure: Amount::ZERO,
                option_premium: order_value,
                total: order_value,
            });
        }

        if !input.instrument.is_derivative() {
            let pct = self
                .active_pct(
                    input.broker_id,
                    &input.instrument.key,
                    MarginType::Delivery,
                    input.at,
                )
                .unwrap_or(1_000_000); // no rule: full value blocked
            let delivery = order_value.mul_pct_e4(pct);
            return Ok(MarginRequired {
                span: delivery,
                exposure: Amount::ZERO,
                option_premium: Amount::ZERO,
                total: delivery,
            });
        }

        let span_pct = self
            .active_pct(
                input.broker_id,
                &input.instrument.key,
                MarginType::Span,
                input.at,
            )
            .ok_or(MarginError::NoActiveRule {
                broker_id: input.broker_id.to_string(),
                margin_type: MarginType::Span,
            })?;
        let exposure_pct = self
            .active_pct(
                input.broker_id,
                &input.instrument.key,
                MarginType::Exposure,
                input.at,
            )
            .ok_or(MarginError::NoActiveRule {
                broker_id: input.broker_id.to_string(),
                margin_type: MarginType::Exposure,
            })?;

        let span = order_value.mul_pct_e4(span_pct);
        let exposure = order_value.mul_pct_e4(exposure_pct);

        Ok(MarginRequired {
            span,
            exposure,
            option_premium: Amount::ZERO,
            total: span + exposure,
        })
    }

    /// Check availability against a computed requirement.
    pub fn validate(available: Amount, required: &MarginRequired) -> MarginVerdict {
        if available >= required.total {
            MarginVerdict::Ok
        } else {
            MarginVerdict::Shortfall {
                available,
                required: required.total,
                shortfall: required.total - available,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stress testing
// ---------------------------------------------------------------------------

/// One shock scenario; percentages at 1e-4 percent scale
/// (`100_000` = 10 %).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressScenario {
    pub price_change_pct_e4: i64,
    pub volatility_change_pct_e4: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressResult {
    pub scenario: StressScenario,
    pub stressed_total: Amount,
    /// Increase over the unstressed base, 1e-4 percent scale. Zero when the
    /// base requirement across positions is itself zero.
    pub increase_pct_e4: i64,
}

/// Apply each scenario's multiplicative shock to the SPAN+exposure component
/// of every position's requirement. Option premium is already fully paid and
/// does not scale.
///
/// Shock factor per scenario: `(1 + |Δprice|) · (1 + |Δvol|)` — both moves
/// widen the risk envelope regardless of direction.
pub fn stress_test(base: &[MarginRequired], scenarios: &[StressScenario]) -> Vec<StressResult> {
    let base_total: Amount = base.iter().map(|m| m.total).sum();

    scenarios
        .iter()
        .map(|sc| {
            let price_f = 1_000_000 + sc.price_change_pct_e4.abs();
            let vol_f = 1_000_000 + sc.volatility_change_pct_e4.abs();

            let mut stressed_total = Amount::ZERO;
            for m in base {
                let risk = m.span + m.exposure;
                let shocked = scale_e6(scale_e6(risk, price_f), vol_f);
                stressed_total += shocked + m.option_premium;
            }

            let increase_pct_e4 = if base_total == Amount::ZERO {
                0
            } else {
                let delta = stressed_total.saturating_sub(base_total);
                ((delta.units() as i128) * 1_000_000 / (base_total.units() as i128)) as i64
            };

            StressResult {
                scenario: *sc,
                stressed_total,
                increase_pct_e4,
            }
        })
        .collect()
}

/// Multiply an amount by a 1e6-scaled factor with i128 intermediates.
fn scale_e6(a: Amount, factor_e6: i64) -> Amount {
    let v = (a.units() as i128) * (factor_e6 as i128) / 1_000_000i128;
    let clamped = if v > i64::MAX as i128 {
        i64::MAX
    } else if v < i64::MIN as i128 {
        i64::MIN
    } else {
        v as i64
    };
    Amount::from_units(clamped)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use td_schemas::{InstrumentKey, InstrumentType, OptionKind};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
    }

    fn rule(margin_type: MarginType, pct_e4: i64) -> MarginRule {
        MarginRule {
            rule_id: Uuid::new_v4(),
            broker_id: "zerodha".into(),
            instrument: InstrumentKey::new("NSE", "NIFTYFUT"),
            margin_type,
            pct_e4,
            effective_from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            effective_to: None,
        }
    }

    fn future() -> Instrument {
        Instrument {
            key: InstrumentKey::new("NSE", "NIFTYFUT"),
            instrument_type: InstrumentType::Future,
            lot_size: 1,
            tick_size: Amount::from_paise(5),
            expiry: None,
            strike: None,
            option_kind: None,
            tradable: true,
        }
    }

    fn calc() -> MarginCalculator {
        MarginCalculator::new(vec![
            rule(MarginType::Span, 120_000),     // 12 %
            rule(MarginType::Exposure, 40_000),  // 4 %
        ])
    }

    #[test]
    fn futures_margin_is_span_plus_exposure() {
        let instrument = future();
        let input = MarginInput {
            broker_id: "zerodha",
            instrument: &instrument,
            side: Side::Buy,
            product: ProductType::Nrml,
            qty: 100,
            price: Amount::from_rupees(1000),
            at: t0(),
        };
        let req = calc().required(&input).unwrap();
        // Order value 100_000 → span 12_000, exposure 4_000.
        assert_eq!(req.span, Amount::from_rupees(12_000));
        assert_eq!(req.exposure, Amount::from_rupees(4_000));
        assert_eq!(req.option_premium, Amount::ZERO);
        assert_eq!(req.total, Amount::from_rupees(16_000));
    }

    #[test]
    fn shortfall_reports_exact_gap() {
        let instrument = future();
        let input = MarginInput {
            broker_id: "zerodha",
            instrument: &instrument,
            side: Side::Buy,
            product: ProductType::Nrml,
            qty: 100,
            price: Amount::from_rupees(10_000),
            at: t0(),
        };
        // Required: 16% of 1_000_000 = 160_000; available 50_000.
        let req = calc().required(&input).unwrap();
        let verdict = MarginCalculator::validate(Amount::from_rupees(50_000), &req);
        assert_eq!(
            verdict,
            MarginVerdict::Shortfall {
                available: Amount::from_rupees(50_000),
                required: Amount::from_rupees(160_000),
                shortfall: Amount::from_rupees(110_000),
            }
        );
    }

    #[test]
    fn long_option_blocks_full_premium_only() {
        let mut instrument = future();
        instrument.instrument_type = InstrumentType::Option;
        instrument.option_kind = Some(OptionKind::Call);
        instrument.lot_size = 50;
        let input = MarginInput {
            broker_id: "zerodha",
            instrument: &instrument,
            side: Side::Buy,
            product: ProductType::Nrml,
            qty: 2,
            price: Amount::from_rupees(150),
            at: t0(),
        };
        let req = calc().required(&input).unwrap();
        assert_eq!(req.option_premium, Amount::from_rupees(15_000));
        assert_eq!(req.span, Amount::ZERO);
        assert_eq!(req.total, Amount::from_rupees(15_000));
    }

    #[test]
    fn short_option_margined_like_futures() {
        let mut instrument = future();
        instrument.instrument_type = InstrumentType::Option;
        instrument.option_kind = Some(OptionKind::Put);
        let input = MarginInput {
            broker_id: "zerodha",
            instrument: &instrument,
            side: Side::Sell,
            product: ProductType::Nrml,
            qty: 100,
            price: Amount::from_rupees(1000),
            at: t0(),
        };
        let req = calc().required(&input).unwrap();
        assert_eq!(req.total, Amount::from_rupees(16_000));
        assert_eq!(req.option_premium, Amount::ZERO);
    }

    #[test]
    fn delivery_without_rule_blocks_full_value() {
        let mut instrument = future();
        instrument.instrument_type = InstrumentType::Equity;
        let input = MarginInput {
            broker_id: "zerodha",
            instrument: &instrument,
            side: Side::Buy,
            product: ProductType::Cnc,
            qty: 10,
            price: Amount::from_rupees(500),
            at: t0(),
        };
        let req = calc().required(&input).unwrap();
        assert_eq!(req.total, Amount::from_rupees(5_000));
    }

    #[test]
    fn missing_span_rule_is_an_error() {
        let instrument = future();
        let input = MarginInput {
            broker_id: "unknown-broker",
            instrument: &instrument,
            side: Side::Buy,
            product: ProductType::Nrml,
            qty: 1,
            price: Amount::from_rupees(100),
            at: t0(),
        };
        let err = calc().required(&input).unwrap_err();
        assert!(matches!(
            err,
            MarginError::NoActiveRule {
                margin_type: MarginType::Span,
                ..
            }
        ));
    }

    #[test]
    fn stress_scales_span_exposure_not_premium() {
        let base = vec![
            MarginRequired {
                span: Amount::from_rupees(1_000),
                exposure: Amount::from_rupees(500),
                option_premium: Amount::ZERO,
                total: Amount::from_rupees(1_500),
            },
            MarginRequired {
                span: Amount::ZERO,
                exposure: Amount::ZERO,
                option_premium: Amount::from_rupees(400),
                total: Amount::from_rupees(400),
            },
        ];
        let scenarios = vec![StressScenario {
            price_change_pct_e4: 100_000, // +10 %
            volatility_change_pct_e4: 0,
        }];
        let out = stress_test(&base, &scenarios);
        assert_eq!(out.len(), 1);
        // 1500 · 1.1 + 400 = 2050.
        assert_eq!(out[0].stressed_total, Amount::from_rupees(2_050));
        // Increase: 150 / 1900 ≈ 7.8947 % → 78_947 at e4-pct scale.
        assert_eq!(out[0].increase_pct_e4, 78_947);
    }

    #[test]
    fn stress_with_zero_base_reports_zero_increase() {
        let out = stress_test(
            &[],
            &[StressScenario {
                price_change_pct_e4: 200_000,
                volatility_change_pct_e4: 100_000,
            }],
        );
        assert_eq!(out[0].stressed_total, Amount::ZERO);
        assert_eq!(out[0].increase_pct_e4, 0);
    }

    #[test]
    fn negative_price_shock_still_widens_margin() {
        let base = vec![MarginRequired {
            span: Amount::from_rupees(100),
            exposure: Amount::ZERO,
            option_premium: Amount::ZERO,
            total: Amount::from_rupees(100),
        }];
        let out = stress_test(
            &base,
            &[StressScenario {
                price_change_pct_e4: -100_000,
                volatility_change_pct_e4: 0,
            }],
        );
        assert_eq!(out[0].stressed_total, Amount::from_rupees(110));
    }
}
