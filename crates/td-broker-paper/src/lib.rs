//! Deterministic in-memory "paper" broker adapter.
//!
//! Design decisions (kept intentionally simple and deterministic):
//! - `broker_order_id` is `"P-{n}"` with `n` assigned in submission order.
//! - No randomness, no wall-clock scheduling: fills and cancel
//!   confirmations happen only when the test (or paper loop) drives them via
//!   the `emit_*` methods.
//! - Acks are emitted synchronously on `place` (the paper venue accepts
//!   everything unless a reject is scripted).
//! - Events are buffered until `subscribe_events` is called, so wiring
//!   order does not matter in tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use td_broker::{
    BrokerAdapter, BrokerError, BrokerEvent, BrokerEventKind, BrokerHoldingSnapshot,
    BrokerOrderSnapshot, BrokerPositionSnapshot, ModifyRequest,
};
use td_schemas::{Amount, Order, OrderState};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct PaperState {
    orders: BTreeMap<String, BrokerOrderSnapshot>,
    positions: Vec<BrokerPositionSnapshot>,
    holdings: Vec<BrokerHoldingSnapshot>,
    next_id: u64,
    seq: BTreeMap<String, u64>,
    place_count: u64,
    cancel_count: u64,
    reject_next: Option<String>,
    fail_next_place: Option<String>,
    sender: Option<mpsc::Sender<BrokerEvent>>,
    buffered: Vec<BrokerEvent>,
}

pub struct PaperBroker {
    broker_id: String,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(broker_id: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            state: Mutex::new(PaperState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Transient {
            reason: "paper broker state poisoned".into(),
        })
    }

    fn push_event(
        st: &mut PaperState,
        broker_id: &str,
        broker_order_id: &str,
        kind: BrokerEventKind,
    ) {
        let seq = st.seq.entry(broker_order_id.to_string()).or_insert(0);
        *seq += 1;
        let ev = BrokerEvent {
            broker_id: broker_id.to_string(),
            broker_order_id: broker_order_id.to_string(),
            seq: *seq,
            kind,
            ts: Utc::now(),
        };
        match &st.sender {
            Some(tx) => {
                // A full or closed channel drops the event; tests size the
                // channel well above anything they emit.
                let _ = tx.try_send(ev);
            }
            None => st.buffered.push(ev),
        }
    }

    // -- scripting hooks (tests and the paper loop) -------------------------

    /// The next `place` call returns a broker reject with this reason.
    pub fn script_reject_next(&self, reason: impl Into<String>) {
        if let Ok(mut st) = self.state.lock() {
            st.reject_next = Some(reason.into());
        }
    }

    /// The next `place` call fails transiently (network-style) WITHOUT
    /// registering the order.
    pub fn script_fail_next_place(&self, reason: impl Into<String>) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_next_place = Some(reason.into());
        }
    }

    /// Drive a partial fill for a working order.
    pub fn emit_partial_fill(&self, broker_order_id: &str, qty: i64, price: Amount) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(o) = st.orders.get_mut(broker_order_id) {
                o.filled_qty += qty;
                o.state = OrderState::PartiallyFilled;
            }
            let fill_id = format!("{broker_order_id}-f{}", st.seq.get(broker_order_id).copied().unwrap_or(0) + 1);
            Self::push_event(
                &mut st,
                &self.broker_id,
                broker_order_id,
                BrokerEventKind::PartialFill { fill_id, qty, price },
            );
        }
    }

    /// Drive the final fill for a working order.
    pub fn emit_fill(&self, broker_order_id: &str, qty: i64, price: Amount) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(o) = st.orders.get_mut(broker_order_id) {
                o.filled_qty += qty;
                o.state = OrderState::Filled;
            }
            let fill_id = format!("{broker_order_id}-f{}", st.seq.get(broker_order_id).copied().unwrap_or(0) + 1);
            Self::push_event(
                &mut st,
                &self.broker_id,
                broker_order_id,
                BrokerEventKind::Fill { fill_id, qty, price },
            );
        }
    }

    /// Broker-side confirmation of a previously requested cancel.
    pub fn confirm_cancel(&self, broker_order_id: &str) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(o) = st.orders.get_mut(broker_order_id) {
                o.state = OrderState::Cancelled;
            }
            Self::push_event(
                &mut st,
                &self.broker_id,
                broker_order_id,
                BrokerEventKind::Cancelled,
            );
        }
    }

    /// Validity expiry (DAY close / IOC remainder).
    pub fn emit_expired(&self, broker_order_id: &str) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(o) = st.orders.get_mut(broker_order_id) {
                o.state = OrderState::Expired;
            }
            Self::push_event(
                &mut st,
                &self.broker_id,
                broker_order_id,
                BrokerEventKind::Expired,
            );
        }
    }

    // -- snapshot fabrication (reconciliation tests) ------------------------

    /// Overwrite the broker-side view of one order (drift injection).
    pub fn set_order_snapshot(&self, snapshot: BrokerOrderSnapshot) {
        if let Ok(mut st) = self.state.lock() {
            st.orders
                .insert(snapshot.broker_order_id.clone(), snapshot);
        }
    }

    pub fn set_positions(&self, positions: Vec<BrokerPositionSnapshot>) {
        if let Ok(mut st) = self.state.lock() {
            st.positions = positions;
        }
    }

    pub fn set_holdings(&self, holdings: Vec<BrokerHoldingSnapshot>) {
        if let Ok(mut st) = self.state.lock() {
            st.holdings = holdings;
        }
    }

    // -- counters (idempotency assertions) ----------------------------------

    /// Number of `place` RPCs that reached this venue.
    pub fn place_count(&self) -> u64 {
        self.state.lock().map(|st| st.place_count).unwrap_or(0)
    }

    pub fn cancel_count(&self) -> u64 {
        self.state.lock().map(|st| st.cancel_count).unwrap_or(0)
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn place(&self, order: &Order) -> Result<String, BrokerError> {
        let mut st = self.lock()?;
        st.place_count += 1;

        if let Some(reason) = st.fail_next_place.take() {
            return Err(BrokerError::Transient { reason });
        }
        if let Some(reason) = st.reject_next.take() {
            return Err(BrokerError::Reject { reason });
        }

        st.next_id += 1;
        let broker_order_id = format!("P-{}", st.next_id);

        st.orders.insert(
            broker_order_id.clone(),
            BrokerOrderSnapshot {
                broker_order_id: broker_order_id.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                state: OrderState::Submitted,
                qty: order.qty,
                filled_qty: 0,
                avg_fill_price: None,
                price: order.price,
            },
        );

        Self::push_event(&mut st, &self.broker_id, &broker_order_id, BrokerEventKind::Ack);

        Ok(broker_order_id)
    }

    async fn modify(
        &self,
        broker_order_id: &str,
        change: &ModifyRequest,
    ) -> Result<(), BrokerError> {
        let mut st = self.lock()?;
        let order = st.orders.get_mut(broker_order_id).ok_or_else(|| {
            BrokerError::Reject {
                reason: format!("unknown order {broker_order_id}"),
            }
        })?;
        if let Some(qty) = change.qty {
            order.qty = qty;
        }
        if let Some(price) = change.price {
            order.price = Some(price);
        }
        // Modify is confirmed by a fresh ack on the stream.
        Self::push_event(&mut st, &self.broker_id, broker_order_id, BrokerEventKind::Ack);
        Ok(())
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut st = self.lock()?;
        if !st.orders.contains_key(broker_order_id) {
            return Err(BrokerError::Reject {
                reason: format!("unknown order {broker_order_id}"),
            });
        }
        st.cancel_count += 1;
        // Acceptance of the request only; confirmation arrives on the
        // stream via `confirm_cancel`.
        Ok(())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<BrokerOrderSnapshot>, BrokerError> {
        let st = self.lock()?;
        Ok(st.orders.values().cloned().collect())
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPositionSnapshot>, BrokerError> {
        let st = self.lock()?;
        Ok(st.positions.clone())
    }

    async fn fetch_holdings(&self) -> Result<Vec<BrokerHoldingSnapshot>, BrokerError> {
        let st = self.lock()?;
        Ok(st.holdings.clone())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<BrokerEvent>, BrokerError> {
        let mut st = self.lock()?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        for ev in st.buffered.drain(..) {
            let _ = tx.try_send(ev);
        }
        st.sender = Some(tx);
        Ok(rx)
    }
}
