//! td-fees — deterministic fee computation from versioned rule sets.
//!
//! Given an executed order and a trade time, the calculator looks up the
//! fee rule active at that instant and produces an immutable
//! [`FeeBreakdown`]. Every component is rounded half-up to two decimals
//! before summing, so `total_fees` always equals the sum of the recorded
//! components — the invariant contract notes are audited against.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use td_schemas::{Amount, AssetClass, Brokerage, FeeBreakdown, FeeRule, Segment, Side};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeError {
    /// No rule covers `(broker, asset_class, segment)` at the trade time.
    NoActiveRule {
        broker_id: String,
        asset_class: AssetClass,
        segment: Segment,
        at: DateTime<Utc>,
    },
    /// price × qty × lot_size exceeded the representable range.
    ValueOverflow,
}

impl std::fmt::Display for FeeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeError::NoActiveRule {
                broker_id,
                asset_class,
                segment,
                at,
            } => write!(
                f,
                "no fee rule active for {broker_id}/{asset_class:?}/{segment:?} at {at}"
            ),
            FeeError::ValueOverflow => write!(f, "order value overflow in fee computation"),
        }
    }
}

impl std::error::Error for FeeError {}

// ---------------------------------------------------------------------------
// TradeFeeInput
// ---------------------------------------------------------------------------

/// Everything the calculator needs about one executed order.
#[derive(Clone, Debug)]
pub struct TradeFeeInput {
    pub order_id: Uuid,
    pub broker_id: String,
    pub asset_class: AssetClass,
    pub segment: Segment,
    pub side: Side,
    pub price: Amount,
    pub qty: i64,
    pub lot_size: i64,
    pub trade_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FeeCalculator
// ---------------------------------------------------------------------------

/// Holds the loaded rule set and answers fee queries. Rules are immutable
/// once loaded; refreshing means constructing a new calculator.
#[derive(Clone, Debug, Default)]
pub struct FeeCalculator {
    rules: Vec<FeeRule>,
}

impl FeeCalculator {
    pub fn new(rules: Vec<FeeRule>) -> Self {
        Self { rules }
    }

    /// Find the rule active at `at` for the key.
    ///
    /// Overlapping active rules are a configuration bug: the rule with the
    /// latest `effective_from` wins and a warning is recorded.
    pub fn active_rule(
        &self,
        broker_id: &str,
        asset_class: AssetClass,
        segment: Segment,
        at: DateTime<Utc>,
    ) -> Result<&FeeRule, FeeError> {
        let mut active: Vec<&FeeRule> = self
            .rules
            .iter()
            .filter(|r| {
                r.broker_id == broker_id
                    && r.asset_class == asset_class
                    && r.segment == segment
                    && r.is_active_at(at)
            })
            .collect();

        if active.len() > 1 {
            tracing::warn!(
                broker_id,
                ?asset_class,
                ?segment,
                count = active.len(),
                "overlapping fee rules active; selecting latest effective_from"
            );
        }

        active.sort_by_key(|r| r.effective_from);
        active.pop().ok_or_else(|| FeeError::NoActiveRule {
            broker_id: broker_id.to_string(),
            asset_class,
            segment,
            at,
        })
    }

    /// Compute the full breakdown for one executed order.
    ///
    /// Component order: order value → brokerage → statutory percentages of
    /// order value (STT/CTT, exchange transaction, SEBI, stamp duty on buys
    /// only) → GST on (brokerage + exchange transaction + SEBI). Each
    /// component is rounded half-up to two decimals; the total is the sum of
    /// the rounded components.
    pub fn compute(&self, input: &TradeFeeInput) -> Result<FeeBreakdown, FeeError> {
        let rule = self.active_rule(
            &input.broker_id,
            input.asset_class,
            input.segment,
            input.trade_time,
        )?;

        let units = input
            .qty
            .checked_mul(input.lot_size)
            .ok_or(FeeError::ValueOverflow)?;
        let order_value = input
            .price
            .checked_mul_qty(units)
            .ok_or(FeeError::ValueOverflow)?;

        let brokerage = match &rule.brokerage {
            Brokerage::Flat { amount } => *amount,
            Brokerage::Percent { pct_e4, cap } => {
                let pct = order_value.mul_pct_e4(*pct_e4);
                pct.min(*cap)
            }
        }
        .round_half_up_2dp();

        let stt = order_value.mul_pct_e4(rule.stt_pct_e4).round_half_up_2dp();
        let exchange_txn = order_value
            .mul_pct_e4(rule.exchange_txn_pct_e4)
            .round_half_up_2dp();
        let sebi = order_value.mul_pct_e4(rule.sebi_pct_e4).round_half_up_2dp();
        let stamp_duty = match input.side {
            Side::Buy => order_value
                .mul_pct_e4(rule.stamp_duty_pct_e4)
                .round_half_up_2dp(),
            Side::Sell => Amount::ZERO,
        };

        // GST is levied on the service components, not on statutory taxes.
        let gst_base = brokerage + exchange_txn + sebi;
        let gst = gst_base.mul_pct_e4(rule.gst_pct_e4).round_half_up_2dp();

        let total_fees = brokerage + stt + exchange_txn + gst + sebi + stamp_duty;

        Ok(FeeBreakdown {
            order_id: input.order_id,
            rule_id: rule.rule_id,
            order_value,
            brokerage,
            stt,
            exchange_txn,
            gst,
            sebi,
            stamp_duty,
            total_fees,
            computed_at: input.trade_time,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    fn intraday_rule(from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> FeeRule {
        FeeRule {
            rule_id: Uuid::new_v4(),
            broker_id: "zerodha".into(),
            asset_class: AssetClass::Equity,
            segment: Segment::Intraday,
            effective_from: from,
            effective_to: to,
            brokerage: Brokerage::Percent {
                pct_e4: 300,                   // 0.03 %
                cap: Amount::from_rupees(20),
            },
            stt_pct_e4: 250,          // 0.025 %
            exchange_txn_pct_e4: 345, // 0.00345 %... kept at 1e-4 pct scale
            gst_pct_e4: 180_000,      // 18 %
            sebi_pct_e4: 10,          // 0.0001 %
            stamp_duty_pct_e4: 300,   // 0.003 %
        }
    }

    fn input(side: Side, price_rupees: i64, qty: i64) -> TradeFeeInput {
        TradeFeeInput {
            order_id: Uuid::new_v4(),
            broker_id: "zerodha".into(),
            asset_class: AssetClass::Equity,
            segment: Segment::Intraday,
            side,
            price: Amount::from_rupees(price_rupees),
            qty,
            lot_size: 1,
            trade_time: t(2024, 6, 3),
        }
    }

    #[test]
    fn breakdown_components_and_total() {
        let calc = FeeCalculator::new(vec![intraday_rule(t(2024, 1, 1), None)]);
        // 100 shares at 1000 → order value 100_000.
        let fb = calc.compute(&input(Side::Buy, 1000, 100)).unwrap();

        assert_eq!(fb.order_value, Amount::from_rupees(100_000));
        // brokerage: 0.03% of 100000 = 30 → capped at 20.
        assert_eq!(fb.brokerage, Amount::from_rupees(20));
        // stt: 0.025% of 100000 = 25.
        assert_eq!(fb.stt, Amount::from_rupees(25));
        // exchange: 0.00345%·10 scale → 345e-6·... = 100000·345/1e6 = 34.5
        assert_eq!(fb.exchange_txn, Amount::from_units(345_000));
        // sebi: 100000·10/1e6 = 1.
        assert_eq!(fb.sebi, Amount::from_rupees(1));
        // stamp (buy): 100000·300/1e6 = 30.
        assert_eq!(fb.stamp_duty, Amount::from_rupees(30));
        // gst: 18% of (20 + 34.5 + 1) = 9.99.
        assert_eq!(fb.gst, Amount::from_units(99_900));
        // total = sum of rounded components.
        assert_eq!(fb.total_fees, fb.component_sum());
    }

    #[test]
    fn stamp_duty_zero_on_sell() {
        let calc = FeeCalculator::new(vec![intraday_rule(t(2024, 1, 1), None)]);
        let fb = calc.compute(&input(Side::Sell, 1000, 100)).unwrap();
        assert_eq!(fb.stamp_duty, Amount::ZERO);
    }

    #[test]
    fn flat_brokerage_ignores_order_value() {
        let mut rule = intraday_rule(t(2024, 1, 1), None);
        rule.brokerage = Brokerage::Flat {
            amount: Amount::from_rupees(15),
        };
        let calc = FeeCalculator::new(vec![rule]);
        let small = calc.compute(&input(Side::Buy, 10, 1)).unwrap();
        let large = calc.compute(&input(Side::Buy, 1000, 1000)).unwrap();
        assert_eq!(small.brokerage, Amount::from_rupees(15));
        assert_eq!(large.brokerage, Amount::from_rupees(15));
    }

    #[test]
    fn lot_size_multiplies_order_value() {
        let calc = FeeCalculator::new(vec![intraday_rule(t(2024, 1, 1), None)]);
        let mut inp = input(Side::Buy, 100, 2);
        inp.lot_size = 50;
        let fb = calc.compute(&inp).unwrap();
        assert_eq!(fb.order_value, Amount::from_rupees(10_000));
    }

    #[test]
    fn no_active_rule_is_an_error() {
        let calc = FeeCalculator::new(vec![intraday_rule(
            t(2024, 1, 1),
            Some(t(2024, 2, 1)),
        )]);
        let err = calc.compute(&input(Side::Buy, 100, 1)).unwrap_err();
        assert!(matches!(err, FeeError::NoActiveRule { .. }));
    }

    #[test]
    fn overlap_resolves_to_latest_effective_from() {
        let old = intraday_rule(t(2024, 1, 1), None);
        let mut newer = intraday_rule(t(2024, 5, 1), None);
        newer.stt_pct_e4 = 500; // doubled, distinguishable
        let newer_id = newer.rule_id;
        let calc = FeeCalculator::new(vec![old, newer]);
        let fb = calc.compute(&input(Side::Buy, 1000, 100)).unwrap();
        assert_eq!(fb.rule_id, newer_id);
        assert_eq!(fb.stt, Amount::from_rupees(50));
    }

    #[test]
    fn rounding_half_up_on_components() {
        let mut rule = intraday_rule(t(2024, 1, 1), None);
        rule.brokerage = Brokerage::Flat { amount: Amount::ZERO };
        rule.stt_pct_e4 = 1;
        rule.exchange_txn_pct_e4 = 0;
        rule.sebi_pct_e4 = 0;
        rule.gst_pct_e4 = 0;
        rule.stamp_duty_pct_e4 = 0;
        let calc = FeeCalculator::new(vec![rule]);
        // order value 10_500 → stt raw = 10500·1/1e6 = 0.0105 → rounds to 0.01.
        let fb = calc.compute(&input(Side::Sell, 105, 100)).unwrap();
        assert_eq!(fb.stt, Amount::from_units(100));
        assert_eq!(fb.total_fees, Amount::from_units(100));
    }
}
