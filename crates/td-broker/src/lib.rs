//! td-broker — the uniform broker adapter port.
//!
//! One adapter per broker identifier. Adapters own authentication renewal,
//! per-broker rate limiting, retry of idempotent reads, and normalization of
//! broker wire enums into the core vocabulary; the engine above this trait
//! never sees a broker-specific string.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use td_schemas::{Amount, InstrumentKey, Order, OrderState, ProductType, Side};

mod rate_limit;
mod retry;

pub use rate_limit::TokenBucket;
pub use retry::{retry_idempotent, with_deadline, RetryPolicy};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker refused the request; terminal for the order.
    Reject { reason: String },
    /// Network / rate-limit / 5xx class failure; safe to retry reads.
    Transient { reason: String },
    /// Retries exhausted; the order stays in its current live state and is
    /// flagged for reconciliation.
    Unreachable { attempts: u32, last: String },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient { .. })
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Reject { reason } => write!(f, "broker reject: {reason}"),
            BrokerError::Transient { reason } => write!(f, "broker transient: {reason}"),
            BrokerError::Unreachable { attempts, last } => {
                write!(f, "broker unreachable after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for BrokerError {}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle payloads carried on the event stream, already normalized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEventKind {
    Ack,
    PartialFill {
        fill_id: String,
        qty: i64,
        price: Amount,
    },
    Fill {
        fill_id: String,
        qty: i64,
        price: Amount,
    },
    Reject {
        reason: String,
    },
    Cancelled,
    Expired,
}

/// One message on a broker's event stream.
///
/// `seq` increases monotonically per `broker_order_id`; the dispatcher
/// relies on per-order arrival order, not on cross-order ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub broker_id: String,
    pub broker_order_id: String,
    pub seq: u64,
    pub kind: BrokerEventKind,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Snapshots (reconciliation reads)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderSnapshot {
    pub broker_order_id: String,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub state: OrderState,
    pub qty: i64,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Amount>,
    pub price: Option<Amount>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerPositionSnapshot {
    pub instrument: InstrumentKey,
    pub product: ProductType,
    pub net_qty: i64,
    pub avg_price: Amount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerHoldingSnapshot {
    pub instrument: InstrumentKey,
    pub qty: i64,
    pub avg_cost: Amount,
}

/// Modify request: only price/trigger/qty may change on a working order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub qty: Option<i64>,
    pub price: Option<Amount>,
    pub trigger_price: Option<Amount>,
}

// ---------------------------------------------------------------------------
// BrokerAdapter
// ---------------------------------------------------------------------------

/// The capability set every broker adapter implements.
///
/// `place`/`modify`/`cancel` are NOT retried by callers — a timeout on a
/// non-idempotent verb surfaces as a failure and reconciliation converges
/// the truth later. `fetch_*` are idempotent and may be retried freely.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker_id(&self) -> &str;

    /// Submit; returns the broker-assigned order id on acceptance.
    async fn place(&self, order: &Order) -> Result<String, BrokerError>;

    async fn modify(
        &self,
        broker_order_id: &str,
        change: &ModifyRequest,
    ) -> Result<(), BrokerError>;

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn fetch_open_orders(&self) -> Result<Vec<BrokerOrderSnapshot>, BrokerError>;

    async fn fetch_positions(&self) -> Result<Vec<BrokerPositionSnapshot>, BrokerError>;

    async fn fetch_holdings(&self) -> Result<Vec<BrokerHoldingSnapshot>, BrokerError>;

    /// Subscribe to the lifecycle event stream. Events for one order arrive
    /// in `seq` order.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError>;
}
