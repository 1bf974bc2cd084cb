//! Deterministic in-memory store.
//!
//! Used by tests and the paper stack. Transactions buffer their writes and
//! apply them on commit under one lock; idempotency reservation CASes
//! against the shared state immediately (and is rolled back on abort) so
//! that concurrent reservations of the same key resolve to one winner even
//! before either transaction commits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use td_schemas::{
    FeeBreakdown, Fill, Holding, InstrumentKey, Order, OrderTransition, Position, PositionKey,
    ReconItem, ReconRun, RiskLimit,
};

use crate::error::StoreError;
use crate::port::{
    IdempotencyStore, LocalSnapshots, OrderFilter, Reservation, Store, StoreTx,
};

#[derive(Default)]
struct Inner {
    orders: BTreeMap<Uuid, Order>,
    /// (broker_id, broker_order_id) → order_id.
    broker_index: BTreeMap<(String, String), Uuid>,
    transitions: BTreeMap<Uuid, Vec<OrderTransition>>,
    fills: BTreeMap<Uuid, Vec<Fill>>,
    fees: BTreeMap<Uuid, FeeBreakdown>,
    positions: BTreeMap<PositionKey, Position>,
    holdings: BTreeMap<(String, InstrumentKey), Holding>,
    risk_limits: Vec<RiskLimit>,
    recon_runs: BTreeMap<Uuid, ReconRun>,
    recon_items: BTreeMap<Uuid, Vec<ReconItem>>,
    idempotency: BTreeMap<String, Uuid>,
    locks: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::backend("memory store mutex poisoned"))
    }

    /// Seed risk limits (test setup; the Postgres store loads them from its
    /// own table).
    pub fn seed_risk_limits(&self, limits: Vec<RiskLimit>) {
        if let Ok(mut g) = self.inner.lock() {
            g.risk_limits = limits;
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryTx
// ---------------------------------------------------------------------------

struct MemoryTx {
    store: MemoryStore,
    pending_orders: BTreeMap<Uuid, Order>,
    pending_transitions: Vec<OrderTransition>,
    pending_fills: Vec<Fill>,
    pending_fees: Vec<FeeBreakdown>,
    pending_positions: Vec<Position>,
    pending_holdings: Vec<Holding>,
    pending_runs: Vec<ReconRun>,
    pending_items: Vec<ReconItem>,
    /// Keys CASed into shared state at reserve time; released on rollback.
    reserved_keys: Vec<String>,
    finished: bool,
}

impl MemoryTx {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            pending_orders: BTreeMap::new(),
            pending_transitions: Vec::new(),
            pending_fills: Vec::new(),
            pending_fees: Vec::new(),
            pending_positions: Vec::new(),
            pending_holdings: Vec::new(),
            pending_runs: Vec::new(),
            pending_items: Vec::new(),
            reserved_keys: Vec::new(),
            finished: false,
        }
    }

    fn release_reservations(&mut self) {
        if self.reserved_keys.is_empty() {
            return;
        }
        if let Ok(mut g) = self.store.inner.lock() {
            for k in self.reserved_keys.drain(..) {
                g.idempotency.remove(&k);
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // A dropped, unfinished transaction behaves like rollback.
        if !self.finished {
            self.release_reservations();
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn upsert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.pending_orders.insert(order.order_id, order.clone());
        Ok(())
    }

    async fn load_order(&mut self, order_id: Uuid) -> Result<Order, StoreError> {
        if let Some(o) = self.pending_orders.get(&order_id) {
            return Ok(o.clone());
        }
        let g = self.store.lock()?;
        g.orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("order {order_id}")))
    }

    async fn record_transition(&mut self, transition: &OrderTransition) -> Result<(), StoreError> {
        self.pending_transitions.push(transition.clone());
        Ok(())
    }

    async fn append_fill(&mut self, fill: &Fill) -> Result<(), StoreError> {
        self.pending_fills.push(fill.clone());
        Ok(())
    }

    async fn write_fee_breakdown(&mut self, fees: &FeeBreakdown) -> Result<(), StoreError> {
        self.pending_fees.push(fees.clone());
        Ok(())
    }

    async fn apply_portfolio_delta(
        &mut self,
        positions: &[Position],
        holdings: &[Holding],
    ) -> Result<(), StoreError> {
        self.pending_positions.extend_from_slice(positions);
        self.pending_holdings.extend_from_slice(holdings);
        Ok(())
    }

    async fn write_recon_run(&mut self, run: &ReconRun) -> Result<(), StoreError> {
        self.pending_runs.push(run.clone());
        Ok(())
    }

    async fn write_recon_items(&mut self, items: &[ReconItem]) -> Result<(), StoreError> {
        self.pending_items.extend_from_slice(items);
        Ok(())
    }

    async fn reserve_idempotency(
        &mut self,
        key: &str,
        order_id: Uuid,
    ) -> Result<Reservation, StoreError> {
        let mut g = self.store.lock()?;
        match g.idempotency.get(key) {
            Some(existing) => Ok(Reservation::Existing(*existing)),
            None => {
                g.idempotency.insert(key.to_string(), order_id);
                self.reserved_keys.push(key.to_string());
                Ok(Reservation::Fresh)
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let store = self.store.clone();
        let mut g = store.lock()?;

        for (id, order) in std::mem::take(&mut self.pending_orders) {
            if let Some(bid) = &order.broker_order_id {
                g.broker_index
                    .insert((order.broker_id.clone(), bid.clone()), id);
            }
            g.orders.insert(id, order);
        }
        for t in self.pending_transitions.drain(..) {
            g.transitions.entry(t.order_id).or_default().push(t);
        }
        for f in self.pending_fills.drain(..) {
            g.fills.entry(f.order_id).or_default().push(f);
        }
        for fee in self.pending_fees.drain(..) {
            g.fees.insert(fee.order_id, fee);
        }
        for p in self.pending_positions.drain(..) {
            g.positions.insert(p.key.clone(), p);
        }
        for h in self.pending_holdings.drain(..) {
            g.holdings
                .insert((h.broker_id.clone(), h.instrument.clone()), h);
        }
        for r in self.pending_runs.drain(..) {
            g.recon_runs.insert(r.run_id, r);
        }
        for i in self.pending_items.drain(..) {
            g.recon_items.entry(i.run_id).or_default().push(i);
        }

        // Reservations become permanent with the commit.
        self.reserved_keys.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.release_reservations();
        self.finished = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx::new(self.clone())))
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
        let g = self.lock()?;
        g.orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("order {order_id}")))
    }

    async fn load_order_by_broker_id(
        &self,
        broker_id: &str,
        broker_order_id: &str,
    ) -> Result<Order, StoreError> {
        let g = self.lock()?;
        let id = g
            .broker_index
            .get(&(broker_id.to_string(), broker_order_id.to_string()))
            .ok_or_else(|| {
                StoreError::not_found(format!("broker order {broker_id}/{broker_order_id}"))
            })?;
        g.orders
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("order {id}")))
    }

    async fn load_orders_by_filter(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let g = self.lock()?;
        Ok(g.orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect())
    }

    async fn load_transitions(&self, order_id: Uuid) -> Result<Vec<OrderTransition>, StoreError> {
        let g = self.lock()?;
        Ok(g.transitions.get(&order_id).cloned().unwrap_or_default())
    }

    async fn load_fills(&self, order_id: Uuid) -> Result<Vec<Fill>, StoreError> {
        let g = self.lock()?;
        Ok(g.fills.get(&order_id).cloned().unwrap_or_default())
    }

    async fn load_fee_breakdown(
        &self,
        order_id: Uuid,
    ) -> Result<Option<FeeBreakdown>, StoreError> {
        let g = self.lock()?;
        Ok(g.fees.get(&order_id).cloned())
    }

    async fn load_risk_limits(&self) -> Result<Vec<RiskLimit>, StoreError> {
        let g = self.lock()?;
        Ok(g.risk_limits.clone())
    }

    async fn load_local_snapshots(&self, broker_id: &str) -> Result<LocalSnapshots, StoreError> {
        let g = self.lock()?;
        Ok(LocalSnapshots {
            orders: g
                .orders
                .values()
                .filter(|o| o.broker_id == broker_id)
                .cloned()
                .collect(),
            positions: g
                .positions
                .values()
                .filter(|p| p.key.broker_id == broker_id)
                .cloned()
                .collect(),
            holdings: g
                .holdings
                .values()
                .filter(|h| h.broker_id == broker_id)
                .cloned()
                .collect(),
        })
    }

    async fn load_recon_run(&self, run_id: Uuid) -> Result<ReconRun, StoreError> {
        let g = self.lock()?;
        g.recon_runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("recon run {run_id}")))
    }

    async fn load_recon_items(&self, run_id: Uuid) -> Result<Vec<ReconItem>, StoreError> {
        let g = self.lock()?;
        Ok(g.recon_items.get(&run_id).cloned().unwrap_or_default())
    }

    async fn try_acquire_lock(&self, key: &str) -> Result<bool, StoreError> {
        let mut g = self.lock()?;
        Ok(g.locks.insert(key.to_string()))
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        g.locks.remove(key);
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn reserve(&self, key: &str, order_id: Uuid) -> Result<Reservation, StoreError> {
        let mut g = self.lock()?;
        match g.idempotency.get(key) {
            Some(existing) => Ok(Reservation::Existing(*existing)),
            None => {
                g.idempotency.insert(key.to_string(), order_id);
                Ok(Reservation::Fresh)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        g.idempotency.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use td_schemas::{
        Amount, OrderState, OrderType, ProductType, Side, Validity,
    };

    fn order(id: Uuid) -> Order {
        let now = Utc::now();
        Order {
            order_id: id,
            idempotency_key: Some(format!("k-{id}")),
            strategy_id: None,
            broker_id: "paper".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            validity: Validity::Day,
            product: ProductType::Mis,
            qty: 10,
            price: Some(Amount::from_rupees(100)),
            trigger_price: None,
            group_id: None,
            parent_id: None,
            broker_order_id: None,
            state: OrderState::Pending,
            filled_qty: 0,
            avg_fill_price: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn tx_sees_its_own_writes_before_commit() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_order(&order(id)).await.unwrap();

        // Inside the tx: visible.
        assert_eq!(tx.load_order(id).await.unwrap().order_id, id);
        // Outside the tx: not yet.
        assert!(store.load_order(id).await.is_err());

        tx.commit().await.unwrap();
        assert_eq!(store.load_order(id).await.unwrap().order_id, id);
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_reservations() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_order(&order(id)).await.unwrap();
        assert_eq!(
            tx.reserve_idempotency("k1", id).await.unwrap(),
            Reservation::Fresh
        );
        tx.rollback().await.unwrap();

        assert!(store.load_order(id).await.is_err());
        // Key is free again.
        let id2 = Uuid::new_v4();
        assert_eq!(
            store.reserve("k1", id2).await.unwrap(),
            Reservation::Fresh
        );
    }

    #[tokio::test]
    async fn reservation_cas_one_writer_wins() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut tx_a = store.begin().await.unwrap();
        let mut tx_b = store.begin().await.unwrap();

        assert_eq!(
            tx_a.reserve_idempotency("k", a).await.unwrap(),
            Reservation::Fresh
        );
        // Second caller sees the reservation even before tx_a commits.
        assert_eq!(
            tx_b.reserve_idempotency("k", b).await.unwrap(),
            Reservation::Existing(a)
        );

        tx_a.upsert_order(&order(a)).await.unwrap();
        tx_a.commit().await.unwrap();
        tx_b.rollback().await.unwrap();

        // Reservation survives the losing rollback.
        assert_eq!(
            store.reserve("k", Uuid::new_v4()).await.unwrap(),
            Reservation::Existing(a)
        );
    }

    #[tokio::test]
    async fn dropped_tx_releases_reservation() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            let _ = tx.reserve_idempotency("k", Uuid::new_v4()).await.unwrap();
            // tx dropped without commit or rollback.
        }
        assert_eq!(
            store.reserve("k", Uuid::new_v4()).await.unwrap(),
            Reservation::Fresh
        );
    }

    #[tokio::test]
    async fn broker_index_lookup_after_commit() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut o = order(id);
        o.broker_order_id = Some("B1".into());
        let mut tx = store.begin().await.unwrap();
        tx.upsert_order(&o).await.unwrap();
        tx.commit().await.unwrap();

        let found = store.load_order_by_broker_id("paper", "B1").await.unwrap();
        assert_eq!(found.order_id, id);
        assert!(store.load_order_by_broker_id("paper", "B2").await.is_err());
    }

    #[tokio::test]
    async fn filter_matches_states_and_group() {
        let store = MemoryStore::new();
        let gid = Uuid::new_v4();
        let mut a = order(Uuid::new_v4());
        a.state = OrderState::Submitted;
        a.group_id = Some(gid);
        let mut b = order(Uuid::new_v4());
        b.state = OrderState::Filled;

        let mut tx = store.begin().await.unwrap();
        tx.upsert_order(&a).await.unwrap();
        tx.upsert_order(&b).await.unwrap();
        tx.commit().await.unwrap();

        let filter = OrderFilter {
            states: Some(vec![OrderState::Submitted]),
            group_id: Some(gid),
            ..Default::default()
        };
        let found = store.load_orders_by_filter(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].order_id, a.order_id);
    }

    #[tokio::test]
    async fn recon_lock_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_lock("recon:paper:orders").await.unwrap());
        assert!(!store.try_acquire_lock("recon:paper:orders").await.unwrap());
        store.release_lock("recon:paper:orders").await.unwrap();
        assert!(store.try_acquire_lock("recon:paper:orders").await.unwrap());
    }

    #[tokio::test]
    async fn transitions_accumulate_in_order() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_order(&order(id)).await.unwrap();
        for (from, to) in [
            (OrderState::Pending, OrderState::Queued),
            (OrderState::Queued, OrderState::Submitted),
        ] {
            tx.record_transition(&OrderTransition {
                order_id: id,
                from,
                to,
                at: Utc::now(),
                reason: "test".into(),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let ts = store.load_transitions(id).await.unwrap();
        assert_eq!(ts.len(), 2);
        assert_eq!(ts[0].to, OrderState::Queued);
        assert_eq!(ts[1].to, OrderState::Submitted);
    }
}
