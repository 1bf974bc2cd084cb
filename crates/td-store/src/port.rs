use async_trait::async_trait;
use uuid::Uuid;

use td_schemas::{
    Fill, FeeBreakdown, Holding, InstrumentKey, Order, OrderState, OrderTransition, Position,
    ReconItem, ReconRun, RiskLimit,
};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// OrderFilter
// ---------------------------------------------------------------------------

/// Cross-order query shape. All fields conjunctive; `None` = don't care.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderFilter {
    pub broker_id: Option<String>,
    pub states: Option<Vec<OrderState>>,
    pub instrument: Option<InstrumentKey>,
    pub group_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        if let Some(b) = &self.broker_id {
            if &order.broker_id != b {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&order.state) {
                return false;
            }
        }
        if let Some(i) = &self.instrument {
            if &order.instrument != i {
                return false;
            }
        }
        if let Some(g) = self.group_id {
            if order.group_id != Some(g) {
                return false;
            }
        }
        if let Some(p) = self.parent_id {
            if order.parent_id != Some(p) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Local snapshots (reconciliation reads)
// ---------------------------------------------------------------------------

/// What the engine believes to be true for one broker, read in one shot by
/// the reconciliation engine.
#[derive(Clone, Debug, Default)]
pub struct LocalSnapshots {
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub holdings: Vec<Holding>,
}

// ---------------------------------------------------------------------------
// StoreTx
// ---------------------------------------------------------------------------

/// A transaction. Mutations are invisible to other readers until
/// [`StoreTx::commit`]; [`StoreTx::load_order`] observes the transaction's
/// own pending writes.
#[async_trait]
pub trait StoreTx: Send {
    async fn upsert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Strong read-after-write within this transaction.
    async fn load_order(&mut self, order_id: Uuid) -> Result<Order, StoreError>;

    /// Audit row recorded atomically with the state change it describes.
    async fn record_transition(&mut self, transition: &OrderTransition) -> Result<(), StoreError>;

    async fn append_fill(&mut self, fill: &Fill) -> Result<(), StoreError>;

    async fn write_fee_breakdown(&mut self, fees: &FeeBreakdown) -> Result<(), StoreError>;

    /// Upsert the positions/holdings affected by a fill.
    async fn apply_portfolio_delta(
        &mut self,
        positions: &[Position],
        holdings: &[Holding],
    ) -> Result<(), StoreError>;

    async fn write_recon_run(&mut self, run: &ReconRun) -> Result<(), StoreError>;

    async fn write_recon_items(&mut self, items: &[ReconItem]) -> Result<(), StoreError>;

    /// Reserve an idempotency key for an order inside this transaction, so
    /// the reservation becomes durable exactly when the order row does.
    async fn reserve_idempotency(
        &mut self,
        key: &str,
        order_id: Uuid,
    ) -> Result<Reservation, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The persistence port. Implementations are `Send + Sync` and internally
/// pooled; cross-order reads outside a transaction may be eventually
/// consistent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn load_order(&self, order_id: Uuid) -> Result<Order, StoreError>;

    async fn load_order_by_broker_id(
        &self,
        broker_id: &str,
        broker_order_id: &str,
    ) -> Result<Order, StoreError>;

    async fn load_orders_by_filter(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;

    async fn load_transitions(&self, order_id: Uuid) -> Result<Vec<OrderTransition>, StoreError>;

    async fn load_fills(&self, order_id: Uuid) -> Result<Vec<Fill>, StoreError>;

    async fn load_fee_breakdown(&self, order_id: Uuid)
        -> Result<Option<FeeBreakdown>, StoreError>;

    async fn load_risk_limits(&self) -> Result<Vec<RiskLimit>, StoreError>;

    /// Everything reconciliation needs about one broker, in one read.
    async fn load_local_snapshots(&self, broker_id: &str) -> Result<LocalSnapshots, StoreError>;

    async fn load_recon_run(&self, run_id: Uuid) -> Result<ReconRun, StoreError>;

    async fn load_recon_items(&self, run_id: Uuid) -> Result<Vec<ReconItem>, StoreError>;

    /// Advisory lock used to serialize work per key (reconciliation runs).
    /// Returns `true` if the lock was acquired.
    async fn try_acquire_lock(&self, key: &str) -> Result<bool, StoreError>;

    async fn release_lock(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// IdempotencyStore
// ---------------------------------------------------------------------------

/// Outcome of an idempotency reservation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// The key was unclaimed; it is now bound to the caller's order id.
    Fresh,
    /// The key is already bound; the original order id is returned and no
    /// new work may be performed.
    Existing(Uuid),
}

/// Deduplicates client order intents by idempotency key.
///
/// `reserve` is compare-and-set: under concurrent callers exactly one
/// receives [`Reservation::Fresh`]. `release` undoes a reservation whose
/// transaction failed before commit.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn reserve(&self, key: &str, order_id: Uuid) -> Result<Reservation, StoreError>;

    async fn release(&self, key: &str) -> Result<(), StoreError>;
}
