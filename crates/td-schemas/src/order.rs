//! Order record and the canonical order vocabulary.
//!
//! Every broker adapter normalizes its wire enums into the types here; the
//! rest of the system never sees broker-specific strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instrument::InstrumentKey;
use crate::money::Amount;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side whose fill reduces a position opened on `self`.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopLoss,
    StopLossMarket,
}

impl OrderType {
    /// Stop variants require a trigger price.
    pub fn requires_trigger(self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::StopLossMarket)
    }

    /// Market variants carry no limit price.
    pub fn requires_price(self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLoss)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Day,
    Ioc,
}

/// Product type decides margin treatment and settlement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    /// Intraday (auto square-off).
    Mis,
    /// Delivery; fills settle into holdings.
    Cnc,
    /// Overnight derivatives.
    Nrml,
}

impl ProductType {
    pub fn is_delivery(self) -> bool {
        matches!(self, ProductType::Cnc)
    }
}

/// Lifecycle states. The legal transition table lives in `td-oms`; this enum
/// is the persisted vocabulary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Queued,
    Submitted,
    PartiallyFilled,
    ModifyRequested,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    /// Live at the broker: a cancel or modify can still be issued.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            OrderState::Submitted | OrderState::PartiallyFilled | OrderState::ModifyRequested
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Pending => "PENDING",
            OrderState::Queued => "QUEUED",
            OrderState::Submitted => "SUBMITTED",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::ModifyRequested => "MODIFY_REQUESTED",
            OrderState::Filled => "FILLED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Rejected => "REJECTED",
            OrderState::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// A client submission before the engine has accepted it.
///
/// `idempotency_key` is the client-supplied at-most-once token; submissions
/// without one are never deduplicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub idempotency_key: Option<String>,
    pub strategy_id: Option<String>,
    /// Explicit broker override; router falls back to rules/default when None.
    pub broker_id: Option<String>,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub order_type: OrderType,
    pub validity: Validity,
    pub product: ProductType,
    pub qty: i64,
    pub price: Option<Amount>,
    pub trigger_price: Option<Amount>,
    /// Iceberg: maximum visible child quantity. None = no slicing.
    pub iceberg_visible_qty: Option<i64>,
    /// Bracket exits, priced relative to nothing — absolute prices.
    pub bracket: Option<BracketSpec>,
}

/// Target and stop legs attached to a bracket entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub target_price: Amount,
    pub stop_trigger: Amount,
}

/// The persisted order row. Single-writer: only the coordinator mutates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub idempotency_key: Option<String>,
    pub strategy_id: Option<String>,
    pub broker_id: String,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub order_type: OrderType,
    pub validity: Validity,
    pub product: ProductType,
    pub qty: i64,
    pub price: Option<Amount>,
    pub trigger_price: Option<Amount>,
    /// OCO/bracket group; a fill on one member cancels the others.
    pub group_id: Option<Uuid>,
    /// Iceberg children and bracket exits point at their parent entry.
    pub parent_id: Option<Uuid>,
    pub broker_order_id: Option<String>,
    pub state: OrderState,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Amount>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_qty(&self) -> i64 {
        self.qty - self.filled_qty
    }
}

/// One execution against an order, as reported by the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: Uuid,
    pub broker_id: String,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub product: ProductType,
    pub qty: i64,
    pub price: Amount,
    pub ts: DateTime<Utc>,
}

/// Audit row written with every state change, inside the same transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderTransition {
    pub order_id: Uuid,
    pub from: OrderState,
    pub to: OrderState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
    }

    #[test]
    fn working_states() {
        assert!(OrderState::Submitted.is_working());
        assert!(OrderState::PartiallyFilled.is_working());
        assert!(!OrderState::Queued.is_working());
        assert!(!OrderState::Filled.is_working());
    }

    #[test]
    fn order_type_field_requirements() {
        assert!(OrderType::Limit.requires_price());
        assert!(OrderType::StopLoss.requires_price());
        assert!(!OrderType::Market.requires_price());
        assert!(OrderType::StopLoss.requires_trigger());
        assert!(OrderType::StopLossMarket.requires_trigger());
        assert!(!OrderType::Limit.requires_trigger());
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let s = serde_json::to_string(&OrderState::PartiallyFilled).unwrap();
        assert_eq!(s, "\"PARTIALLY_FILLED\"");
    }
}
