//! Versioned fee rule records and the post-trade fee breakdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Amount;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    Equity,
    Derivative,
    Currency,
    Commodity,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Segment {
    /// Cash delivery.
    Delivery,
    /// Intraday cash.
    Intraday,
    Futures,
    Options,
}

/// Brokerage pricing: flat per order or percent of order value with a cap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Brokerage {
    Flat { amount: Amount },
    /// `pct_e4` at 1e-4 percent scale; capped at `cap` per order.
    Percent { pct_e4: i64, cap: Amount },
}

/// One versioned fee rule. At most one rule is active per
/// `(broker, asset_class, segment)` at any instant; overlap is a
/// configuration bug resolved at lookup time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeeRule {
    pub rule_id: Uuid,
    pub broker_id: String,
    pub asset_class: AssetClass,
    pub segment: Segment,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub brokerage: Brokerage,
    /// Securities/commodities transaction tax, 1e-4 percent scale.
    pub stt_pct_e4: i64,
    pub exchange_txn_pct_e4: i64,
    pub gst_pct_e4: i64,
    pub sebi_pct_e4: i64,
    /// Charged on the buy side only.
    pub stamp_duty_pct_e4: i64,
}

impl FeeRule {
    /// Active at `t` iff `effective_from ≤ t ∧ (effective_to unset ∨ ≥ t)`.
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.effective_from <= t && self.effective_to.map_or(true, |to| to >= t)
    }
}

/// Immutable post-trade record linking an order to its computed fees.
/// Every component is already rounded half-up to two decimals; `total_fees`
/// is the sum of the rounded components.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub order_id: Uuid,
    pub rule_id: Uuid,
    pub order_value: Amount,
    pub brokerage: Amount,
    pub stt: Amount,
    pub exchange_txn: Amount,
    pub gst: Amount,
    pub sebi: Amount,
    pub stamp_duty: Amount,
    pub total_fees: Amount,
    pub computed_at: DateTime<Utc>,
}

impl FeeBreakdown {
    pub fn component_sum(&self) -> Amount {
        self.brokerage + self.stt + self.exchange_txn + self.gst + self.sebi + self.stamp_duty
    }
}
