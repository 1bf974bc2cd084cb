//! The order coordinator: intake → gates → routing → submission → events.
//!
//! Single-writer discipline: all mutations of an order row flow through
//! this engine, and broker events for one order are applied in arrival
//! order by the dispatcher's per-order routing. Every state change is
//! persisted in a transaction together with its transition row.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use td_broker::{with_deadline, BrokerAdapter, BrokerError, BrokerEvent, BrokerEventKind, ModifyRequest};
use td_config::CoreConfig;
use td_fees::{FeeCalculator, TradeFeeInput};
use td_margin::{MarginCalculator, MarginInput, MarginVerdict};
use td_oms::{apply_event, transition, OrderEvent};
use td_portfolio::{vwap_merge, PortfolioBook};
use td_risk::{InstrumentExposure, OrderProjection, PortfolioSnapshot};
use td_router::{expand_bracket, route, split_iceberg};
use td_schemas::{
    Amount, AssetClass, Fill, Instrument, InstrumentKey, InstrumentType, Order, OrderIntent,
    OrderState, OrderTransition, Segment,
};
use td_store::{Reservation, Store, StoreError, StoreTx};

use crate::error::{OrderOpError, SubmitError, SubmitResponse};
use crate::normalize::validate_intent;

/// Account-level inputs the engine cannot derive itself (funds and equity
/// come from the ledger/market-data collaborators outside this core).
#[derive(Clone, Debug)]
struct AccountState {
    available_margin: Amount,
    equity: Amount,
    day_peak_equity: Amount,
    daily_returns_pct_e4: Vec<i64>,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            available_margin: Amount::ZERO,
            equity: Amount::ZERO,
            day_peak_equity: Amount::ZERO,
            daily_returns_pct_e4: Vec::new(),
        }
    }
}

pub struct OrderCoordinator {
    cfg: CoreConfig,
    store: Arc<dyn Store>,
    brokers: BTreeMap<String, Arc<dyn BrokerAdapter>>,
    fees: FeeCalculator,
    margin: MarginCalculator,
    instruments: RwLock<BTreeMap<InstrumentKey, Instrument>>,
    portfolio: Mutex<PortfolioBook>,
    account: Mutex<AccountState>,
    /// Orders frozen after an illegal transition; nothing touches them
    /// again until an operator intervenes.
    quarantined: Mutex<BTreeSet<Uuid>>,
}

impl OrderCoordinator {
    pub fn new(
        cfg: CoreConfig,
        store: Arc<dyn Store>,
        brokers: BTreeMap<String, Arc<dyn BrokerAdapter>>,
        fees: FeeCalculator,
        margin: MarginCalculator,
    ) -> Self {
        Self {
            cfg,
            store,
            brokers,
            fees,
            margin,
            instruments: RwLock::new(BTreeMap::new()),
            portfolio: Mutex::new(PortfolioBook::new()),
            account: Mutex::new(AccountState::default()),
            quarantined: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    // -- collaborator inputs -------------------------------------------------

    /// Load or refresh instrument master rows.
    pub fn register_instruments(&self, instruments: Vec<Instrument>) {
        if let Ok(mut map) = self.instruments.write() {
            for i in instruments {
                map.insert(i.key.clone(), i);
            }
        }
    }

    pub fn set_available_margin(&self, available: Amount) {
        if let Ok(mut a) = self.account.lock() {
            a.available_margin = available;
        }
    }

    pub fn set_equity(&self, equity: Amount, day_peak: Amount) {
        if let Ok(mut a) = self.account.lock() {
            a.equity = equity;
            a.day_peak_equity = day_peak;
        }
    }

    pub fn set_returns_history(&self, returns_pct_e4: Vec<i64>) {
        if let Ok(mut a) = self.account.lock() {
            a.daily_returns_pct_e4 = returns_pct_e4;
        }
    }

    pub fn is_quarantined(&self, order_id: Uuid) -> bool {
        self.quarantined
            .lock()
            .map(|q| q.contains(&order_id))
            .unwrap_or(false)
    }

    /// Snapshot of the in-memory book (tests, CLI position listing).
    pub fn portfolio_snapshot(&self) -> PortfolioBook {
        self.portfolio
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn lookup_instrument(&self, key: &InstrumentKey) -> Option<Instrument> {
        self.instruments.read().ok()?.get(key).cloned()
    }

    // -----------------------------------------------------------------------
    // submit
    // -----------------------------------------------------------------------

    /// Accept one intent: idempotency, normalization, margin, risk, routing,
    /// persistence, then dispatch. Steps through the first persistence
    /// commit run inside one transaction; dispatch happens after commit so
    /// a broker outage can never roll back an accepted order.
    pub async fn submit(&self, intent: OrderIntent) -> Result<SubmitResponse, SubmitError> {
        let order_id = Uuid::new_v4();
        let mut tx = self.store.begin().await?;

        // 1. Idempotency: at most one order per key, CAS inside the tx.
        if let Some(key) = &intent.idempotency_key {
            if let Reservation::Existing(existing) = tx.reserve_idempotency(key, order_id).await? {
                tx.rollback().await?;
                let state = self
                    .store
                    .load_order(existing)
                    .await
                    .map(|o| o.state)
                    .unwrap_or(OrderState::Pending);
                tracing::debug!(%existing, key, "idempotent replay, returning prior order");
                return Ok(SubmitResponse {
                    order_id: existing,
                    existing: true,
                    state,
                    child_ids: Vec::new(),
                });
            }
        }

        // 2. Normalize against the instrument master.
        let instrument = match self.lookup_instrument(&intent.instrument) {
            Some(i) => i,
            None => {
                let reasons = vec![format!("unknown instrument {}", intent.instrument)];
                self.persist_rejection(tx, order_id, &intent, reasons.join("; "))
                    .await?;
                return Err(SubmitError::Validation { order_id, reasons });
            }
        };
        if let Err(reasons) = validate_intent(&intent, &instrument) {
            self.persist_rejection(tx, order_id, &intent, reasons.join("; "))
                .await?;
            return Err(SubmitError::Validation { order_id, reasons });
        }

        // 3a. Margin gate.
        let margin_price = intent.price.or(intent.trigger_price).unwrap_or(Amount::ZERO);
        let margin_input = MarginInput {
            broker_id: intent.broker_id.as_deref().unwrap_or(&self.cfg.default_broker),
            instrument: &instrument,
            side: intent.side,
            product: intent.product,
            qty: intent.qty / instrument.lot_size.max(1),
            price: margin_price,
            at: Utc::now(),
        };
        let required = match self.margin.required(&margin_input) {
            Ok(r) => r,
            Err(e) => {
                let reasons = vec![e.to_string()];
                self.persist_rejection(tx, order_id, &intent, reasons.join("; "))
                    .await?;
                return Err(SubmitError::Validation { order_id, reasons });
            }
        };
        let available = self
            .account
            .lock()
            .map(|a| a.available_margin)
            .unwrap_or(Amount::ZERO);
        if let MarginVerdict::Shortfall {
            available,
            required,
            shortfall,
        } = MarginCalculator::validate(available, &required)
        {
            self.persist_rejection(
                tx,
                order_id,
                &intent,
                format!("MARGIN_SHORTFALL: required {required}, available {available}"),
            )
            .await?;
            return Err(SubmitError::MarginShortfall {
                order_id,
                available,
                required,
                shortfall,
            });
        }

        // 3b. Risk gate.
        let limits = self.store.load_risk_limits().await?;
        let snapshot = self.risk_snapshot();
        let projection = OrderProjection {
            strategy_id: intent.strategy_id.clone(),
            instrument: intent.instrument.clone(),
            side: intent.side,
            qty: intent.qty / instrument.lot_size.max(1),
            price: margin_price,
            lot_size: instrument.lot_size,
        };
        let verdict = td_risk::evaluate(
            &self.cfg.var,
            &self.cfg.risk_defaults,
            &limits,
            &snapshot,
            &projection,
        );
        if !verdict.approved {
            self.persist_rejection(
                tx,
                order_id,
                &intent,
                format!(
                    "RISK_VIOLATION: {}",
                    serde_json::to_string(&verdict.violations).unwrap_or_default()
                ),
            )
            .await?;
            return Err(SubmitError::RiskViolation {
                order_id,
                violations: verdict.violations,
            });
        }

        // 4. Route and expand.
        let broker_id = route(&self.cfg, intent.broker_id.as_deref(), instrument.instrument_type);
        let now = Utc::now();
        let mut parent = order_from_intent(order_id, &intent, broker_id, now);

        let mut children: Vec<Order> = Vec::new();
        let mut dispatch_ids: Vec<Uuid> = Vec::new();

        if let Some(visible) = intent.iceberg_visible_qty {
            let mut kids = split_iceberg(&parent, visible, now).map_err(|e| {
                SubmitError::Validation {
                    order_id,
                    reasons: vec![e.to_string()],
                }
            })?;
            // First slice goes out now; the rest are released as their
            // predecessors start filling.
            if let Some(first) = kids.first_mut() {
                first.state = OrderState::Queued;
                dispatch_ids.push(first.order_id);
            }
            children.extend(kids);
        } else {
            dispatch_ids.push(parent.order_id);
        }

        if let Some(bracket) = &intent.bracket {
            let exits = expand_bracket(&parent, bracket, now);
            // Exits stay PENDING until the entry fills (OCO armed then).
            children.push(exits.target);
            children.push(exits.stop);
        }

        // 5. Persist PENDING → QUEUED and commit.
        parent.state = OrderState::Queued;
        tx.upsert_order(&parent).await?;
        tx.record_transition(&transition_row(
            parent.order_id,
            OrderState::Pending,
            OrderState::Queued,
            "accepted",
        ))
        .await?;

        for child in &children {
            tx.upsert_order(child).await?;
            if child.state == OrderState::Queued {
                tx.record_transition(&transition_row(
                    child.order_id,
                    OrderState::Pending,
                    OrderState::Queued,
                    "iceberg slice released",
                ))
                .await?;
            }
        }
        tx.commit().await?;

        // 6. Dispatch outside the transaction.
        for id in &dispatch_ids {
            self.dispatch_order(*id).await?;
        }

        let state = self.store.load_order(order_id).await?.state;
        Ok(SubmitResponse {
            order_id,
            existing: false,
            state,
            child_ids: children.iter().map(|c| c.order_id).collect(),
        })
    }

    /// Persist a terminal rejection inside the open transaction. The
    /// idempotency reservation (if any) commits with it: a retry of the
    /// same key returns the rejected order instead of re-running the gates.
    async fn persist_rejection(
        &self,
        mut tx: Box<dyn StoreTx>,
        order_id: Uuid,
        intent: &OrderIntent,
        reason: String,
    ) -> Result<(), SubmitError> {
        let broker_id = intent
            .broker_id
            .clone()
            .unwrap_or_else(|| self.cfg.default_broker.clone());
        let mut order = order_from_intent(order_id, intent, broker_id, Utc::now());
        order.state = OrderState::Rejected;
        order.reject_reason = Some(reason.clone());

        tx.upsert_order(&order).await?;
        tx.record_transition(&transition_row(
            order_id,
            OrderState::Pending,
            OrderState::Rejected,
            &reason,
        ))
        .await?;
        tx.commit().await?;

        tracing::info!(%order_id, reason, "submission rejected");
        Ok(())
    }

    /// Place one QUEUED order at its broker.
    ///
    /// ACK → SUBMITTED with the broker id; REJECT → REJECTED; transient
    /// failures leave the order QUEUED and flagged for reconciliation.
    async fn dispatch_order(&self, order_id: Uuid) -> Result<(), StoreError> {
        let order = self.store.load_order(order_id).await?;
        let adapter = match self.brokers.get(&order.broker_id) {
            Some(a) => a.clone(),
            None => {
                tracing::error!(%order_id, broker_id = %order.broker_id, "no adapter for broker");
                self.apply_local_transition(&order, OrderState::Rejected, "no adapter for broker")
                    .await?;
                return Ok(());
            }
        };

        let deadline = Duration::from_millis(self.cfg.rpc_deadline_ms);
        match with_deadline(deadline, adapter.place(&order)).await {
            Ok(broker_order_id) => {
                let mut updated = order.clone();
                updated.broker_order_id = Some(broker_order_id);
                updated.state = OrderState::Submitted;
                updated.updated_at = Utc::now();

                let mut tx = self.store.begin().await?;
                tx.upsert_order(&updated).await?;
                tx.record_transition(&transition_row(
                    order_id,
                    OrderState::Queued,
                    OrderState::Submitted,
                    "broker ack",
                ))
                .await?;
                tx.commit().await?;

                // An iceberg container goes live with its first child.
                self.promote_parent_on_first_submit(&updated).await?;
            }
            Err(BrokerError::Reject { reason }) => {
                self.apply_local_transition(&order, OrderState::Rejected, &reason)
                    .await?;
            }
            Err(e) => {
                // BROKER_TRANSIENT / BROKER_UNREACHABLE: order stays QUEUED;
                // reconciliation converges it later.
                tracing::warn!(%order_id, error = %e, "dispatch failed; order flagged for reconciliation");
            }
        }
        Ok(())
    }

    async fn promote_parent_on_first_submit(&self, child: &Order) -> Result<(), StoreError> {
        let parent_id = match child.parent_id {
            // Only iceberg slices promote their container (bracket exits
            // carry a group_id and never do).
            Some(p) if child.group_id.is_none() => p,
            _ => return Ok(()),
        };
        let parent = self.store.load_order(parent_id).await?;
        if parent.state == OrderState::Queued {
            self.apply_local_transition(&parent, OrderState::Submitted, "first slice live")
                .await?;
        }
        Ok(())
    }

    /// Validate and persist a locally-driven transition.
    async fn apply_local_transition(
        &self,
        order: &Order,
        to: OrderState,
        reason: &str,
    ) -> Result<(), StoreError> {
        let next = match transition(order.state, to) {
            Ok(s) => s,
            Err(e) => {
                self.quarantine(order.order_id, &e.to_string());
                return Ok(());
            }
        };
        let mut updated = order.clone();
        updated.state = next;
        updated.updated_at = Utc::now();
        if next == OrderState::Rejected && updated.reject_reason.is_none() {
            updated.reject_reason = Some(reason.to_string());
        }

        let mut tx = self.store.begin().await?;
        tx.upsert_order(&updated).await?;
        tx.record_transition(&transition_row(order.order_id, order.state, next, reason))
            .await?;
        tx.commit().await
    }

    fn quarantine(&self, order_id: Uuid, context: &str) {
        tracing::error!(%order_id, context, "INVALID_TRANSITION: order quarantined");
        if let Ok(mut q) = self.quarantined.lock() {
            q.insert(order_id);
        }
    }

    fn risk_snapshot(&self) -> PortfolioSnapshot {
        let mut snapshot = PortfolioSnapshot::default();

        if let Ok(book) = self.portfolio.lock() {
            snapshot.gross_notional = book.gross_notional();
            snapshot.realized_pnl_today = book.realized_pnl();
            for (key, pos) in &book.positions {
                let entry = snapshot
                    .per_instrument
                    .entry(key.instrument.clone())
                    .or_insert_with(InstrumentExposure::default);
                entry.net_qty += pos.net_qty();
                let avg = if pos.net_qty() >= 0 {
                    pos.buy_avg
                } else {
                    pos.sell_avg
                };
                entry.notional = entry.notional.saturating_add(
                    avg.checked_mul_qty(pos.net_qty().abs()).unwrap_or(Amount::MAX),
                );
            }
        }

        if let Ok(account) = self.account.lock() {
            snapshot.equity = account.equity;
            snapshot.day_peak_equity = account.day_peak_equity;
            snapshot.daily_returns_pct_e4 = account.daily_returns_pct_e4.clone();
        }

        snapshot
    }

    // -----------------------------------------------------------------------
    // cancel / modify
    // -----------------------------------------------------------------------

    /// User-initiated cancel. A live order keeps its current state until the
    /// broker confirms; an order that never reached the venue cancels
    /// locally at once.
    pub async fn cancel(&self, order_id: Uuid) -> Result<(), OrderOpError> {
        let order = self
            .store
            .load_order(order_id)
            .await
            .map_err(|_| OrderOpError::NotFound(order_id))?;

        match order.state {
            OrderState::Pending => {
                // Unreleased child: walk it through QUEUED so the audit
                // trail stays a legal path.
                self.apply_local_transition(&order, OrderState::Queued, "cancel requested")
                    .await?;
                let queued = self.store.load_order(order_id).await?;
                self.apply_local_transition(&queued, OrderState::Cancelled, "cancelled before release")
                    .await?;
                Ok(())
            }
            OrderState::Queued => {
                self.apply_local_transition(&order, OrderState::Cancelled, "cancelled before submit")
                    .await?;
                Ok(())
            }
            // A pending modify must resolve first: CANCELLED is not a legal
            // edge out of MODIFY_REQUESTED.
            s if s.is_working() && s != OrderState::ModifyRequested => {
                let adapter = self.adapter_for(&order)?;
                let broker_order_id = order
                    .broker_order_id
                    .clone()
                    .ok_or_else(|| OrderOpError::Broker("working order has no broker id".into()))?;
                let deadline = Duration::from_millis(self.cfg.rpc_deadline_ms);
                with_deadline(deadline, adapter.cancel(&broker_order_id))
                    .await
                    .map_err(|e| OrderOpError::Broker(e.to_string()))?;
                // State unchanged here; CANCELLED lands with the broker event.
                Ok(())
            }
            s => Err(OrderOpError::NotWorking { order_id, state: s }),
        }
    }

    /// User-initiated modify of price/qty/trigger on a working order.
    pub async fn modify(&self, order_id: Uuid, change: ModifyRequest) -> Result<(), OrderOpError> {
        let order = self
            .store
            .load_order(order_id)
            .await
            .map_err(|_| OrderOpError::NotFound(order_id))?;

        if !order.state.is_working() || order.state == OrderState::ModifyRequested {
            return Err(OrderOpError::NotWorking {
                order_id,
                state: order.state,
            });
        }
        let adapter = self.adapter_for(&order)?;
        let broker_order_id = order
            .broker_order_id
            .clone()
            .ok_or_else(|| OrderOpError::Broker("working order has no broker id".into()))?;

        // Optimistically record the new terms with the MODIFY_REQUESTED
        // state; the broker's ack restores SUBMITTED via the event stream.
        let mut updated = order.clone();
        if let Some(q) = change.qty {
            updated.qty = q;
        }
        if let Some(p) = change.price {
            updated.price = Some(p);
        }
        if let Some(t) = change.trigger_price {
            updated.trigger_price = Some(t);
        }
        updated.state = OrderState::ModifyRequested;
        updated.updated_at = Utc::now();

        let mut tx = self.store.begin().await.map_err(OrderOpError::Store)?;
        tx.upsert_order(&updated).await.map_err(OrderOpError::Store)?;
        tx.record_transition(&transition_row(
            order_id,
            order.state,
            OrderState::ModifyRequested,
            "modify requested",
        ))
        .await
        .map_err(OrderOpError::Store)?;
        tx.commit().await.map_err(OrderOpError::Store)?;

        let deadline = Duration::from_millis(self.cfg.rpc_deadline_ms);
        match with_deadline(deadline, adapter.modify(&broker_order_id, &change)).await {
            Ok(()) => Ok(()),
            Err(BrokerError::Reject { reason }) => {
                let current = self.store.load_order(order_id).await?;
                self.apply_local_transition(&current, OrderState::Rejected, &reason)
                    .await?;
                Err(OrderOpError::Broker(reason))
            }
            Err(e) => {
                tracing::warn!(%order_id, error = %e, "modify RPC failed; awaiting reconciliation");
                Err(OrderOpError::Broker(e.to_string()))
            }
        }
    }

    fn adapter_for(&self, order: &Order) -> Result<Arc<dyn BrokerAdapter>, OrderOpError> {
        self.brokers
            .get(&order.broker_id)
            .cloned()
            .ok_or_else(|| OrderOpError::Broker(format!("no adapter for {}", order.broker_id)))
    }

    // -----------------------------------------------------------------------
    // broker events
    // -----------------------------------------------------------------------

    /// Apply one broker event. Called by the dispatcher on the worker that
    /// owns this order, so per-order serialization holds.
    pub async fn handle_event(&self, ev: &BrokerEvent) -> Result<(), StoreError> {
        let order = match self
            .store
            .load_order_by_broker_id(&ev.broker_id, &ev.broker_order_id)
            .await
        {
            Ok(o) => o,
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(
                    broker_id = %ev.broker_id,
                    broker_order_id = %ev.broker_order_id,
                    "event for unknown order; reconciliation will record the orphan"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.is_quarantined(order.order_id) {
            tracing::error!(order_id = %order.order_id, "event dropped: order is quarantined");
            return Ok(());
        }

        let oms_event = match &ev.kind {
            BrokerEventKind::Ack => OrderEvent::Ack,
            BrokerEventKind::PartialFill { .. } => OrderEvent::PartialFill,
            BrokerEventKind::Fill { .. } => OrderEvent::Fill,
            BrokerEventKind::Reject { .. } => OrderEvent::Reject,
            BrokerEventKind::Cancelled => OrderEvent::Cancelled,
            BrokerEventKind::Expired => OrderEvent::Expired,
        };

        let next = match apply_event(order.state, oms_event) {
            Ok(s) => s,
            Err(e) => {
                self.quarantine(order.order_id, &format!("{e} (event {:?})", ev.kind));
                return Ok(());
            }
        };

        // Fill payload, if any.
        let fill_payload = match &ev.kind {
            BrokerEventKind::PartialFill { fill_id, qty, price }
            | BrokerEventKind::Fill { fill_id, qty, price } => {
                Some((fill_id.clone(), *qty, *price))
            }
            _ => None,
        };

        // Duplicate-fill replay: the fill_id has been applied already.
        if let Some((fill_id, _, _)) = &fill_payload {
            let prior = self.store.load_fills(order.order_id).await?;
            if prior.iter().any(|f| &f.fill_id == fill_id) {
                tracing::debug!(order_id = %order.order_id, fill_id, "duplicate fill replayed; no-op");
                return Ok(());
            }
        }

        // Pure no-op (duplicate ack, repeated terminal event).
        if next == order.state && fill_payload.is_none() {
            return Ok(());
        }

        let mut updated = order.clone();
        updated.state = next;
        updated.updated_at = ev.ts;

        let mut fill_record: Option<Fill> = None;
        if let Some((fill_id, qty, price)) = &fill_payload {
            let new_filled = updated.filled_qty + qty;
            if new_filled > updated.qty {
                self.quarantine(
                    order.order_id,
                    &format!("fill overflow: {new_filled} > {}", updated.qty),
                );
                return Ok(());
            }
            updated.avg_fill_price = Some(vwap_merge(
                order.avg_fill_price.unwrap_or(Amount::ZERO),
                order.filled_qty,
                *price,
                *qty,
            ));
            updated.filled_qty = new_filled;

            fill_record = Some(Fill {
                fill_id: fill_id.clone(),
                order_id: order.order_id,
                broker_id: order.broker_id.clone(),
                instrument: order.instrument.clone(),
                side: order.side,
                product: order.product,
                qty: *qty,
                price: *price,
                ts: ev.ts,
            });
        }
        if let BrokerEventKind::Reject { reason } = &ev.kind {
            updated.reject_reason = Some(reason.clone());
        }

        // Persist state + transition + fill + fees + portfolio atomically.
        let mut tx = self.store.begin().await?;
        tx.upsert_order(&updated).await?;
        if next != order.state {
            tx.record_transition(&transition_row(
                order.order_id,
                order.state,
                next,
                &format!("broker event seq {}", ev.seq),
            ))
            .await?;
        }

        if let Some(fill) = &fill_record {
            tx.append_fill(fill).await?;

            let (positions, holdings) = {
                let mut book = self
                    .portfolio
                    .lock()
                    .map_err(|_| StoreError::backend("portfolio book poisoned"))?;
                book.apply_fill(fill);
                let key = td_schemas::PositionKey::new(
                    fill.broker_id.clone(),
                    fill.instrument.clone(),
                    fill.product,
                );

                if fill.product.is_delivery() {
                    // Delivery fills settle straight through: quantity and
                    // cost basis move into the holding, the intraday row
                    // flattens. Realized P&L stays on the flattened row so
                    // its accumulation remains monotone.
                    let pre = book.positions.get(&key).cloned();
                    book.settle_delivery();
                    let mut flat = td_schemas::Position::flat(key.clone());
                    if let Some(p) = pre {
                        flat.realized_pnl = p.realized_pnl;
                    }
                    book.positions.insert(key, flat.clone());

                    let hkey = (fill.broker_id.clone(), fill.instrument.clone());
                    let holding = book.holdings.get(&hkey).cloned();
                    (vec![flat], holding.into_iter().collect::<Vec<_>>())
                } else {
                    let pos = book.positions.get(&key).cloned();
                    (pos.into_iter().collect::<Vec<_>>(), Vec::new())
                }
            };
            tx.apply_portfolio_delta(&positions, &holdings).await?;

            // Fees are attributed once, on the terminal fill.
            if next == OrderState::Filled {
                if let Some(fees) = self.compute_fees(&updated, ev) {
                    tx.write_fee_breakdown(&fees).await?;
                }
            }
        }
        tx.commit().await?;

        // Post-commit coordination driven by fills.
        if fill_record.is_some() {
            self.enforce_oco(&updated).await?;
            self.release_next_iceberg_slice(&updated).await?;
            self.propagate_to_parent(&updated, &fill_record).await?;
        }
        if next == OrderState::Filled {
            self.release_bracket_exits(&updated).await?;
        }

        Ok(())
    }

    fn compute_fees(&self, order: &Order, ev: &BrokerEvent) -> Option<td_schemas::FeeBreakdown> {
        let instrument = self.lookup_instrument(&order.instrument)?;
        let (asset_class, segment) = fee_key(&instrument, order.product);
        let input = TradeFeeInput {
            order_id: order.order_id,
            broker_id: order.broker_id.clone(),
            asset_class,
            segment,
            side: order.side,
            price: order.avg_fill_price.or(order.price)?,
            qty: order.filled_qty / instrument.lot_size.max(1),
            lot_size: instrument.lot_size,
            trade_time: ev.ts,
        };
        match self.fees.compute(&input) {
            Ok(fb) => Some(fb),
            Err(e) => {
                tracing::warn!(order_id = %order.order_id, error = %e, "fee computation skipped");
                None
            }
        }
    }

    /// OCO: any fill in a group cancels the sibling legs. The resulting
    /// cancels are expected outcomes, not user-visible failures.
    async fn enforce_oco(&self, filled: &Order) -> Result<(), StoreError> {
        let group_id = match filled.group_id {
            Some(g) => g,
            None => return Ok(()),
        };
        let siblings = self
            .store
            .load_orders_by_filter(&td_store::OrderFilter {
                group_id: Some(group_id),
                ..Default::default()
            })
            .await?;

        for sib in siblings {
            if sib.order_id == filled.order_id || sib.state.is_terminal() {
                continue;
            }
            tracing::info!(
                group_id = %group_id,
                filled = %filled.order_id,
                cancelling = %sib.order_id,
                "OCO sibling cancel"
            );
            match sib.state {
                OrderState::Pending => {
                    self.apply_local_transition(&sib, OrderState::Queued, "oco cancel")
                        .await?;
                    let queued = self.store.load_order(sib.order_id).await?;
                    self.apply_local_transition(&queued, OrderState::Cancelled, "oco sibling filled")
                        .await?;
                }
                OrderState::Queued => {
                    self.apply_local_transition(&sib, OrderState::Cancelled, "oco sibling filled")
                        .await?;
                }
                s if s.is_working() => {
                    if let (Ok(adapter), Some(bid)) =
                        (self.adapter_for(&sib), sib.broker_order_id.clone())
                    {
                        let deadline = Duration::from_millis(self.cfg.rpc_deadline_ms);
                        if let Err(e) = with_deadline(deadline, adapter.cancel(&bid)).await {
                            tracing::warn!(
                                order_id = %sib.order_id,
                                error = %e,
                                "OCO cancel RPC failed; reconciliation will converge"
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Iceberg sequencing: when a slice starts filling and no other slice
    /// is live, queue and dispatch the next PENDING slice.
    async fn release_next_iceberg_slice(&self, child: &Order) -> Result<(), StoreError> {
        let parent_id = match (child.parent_id, child.group_id) {
            (Some(p), None) => p,
            _ => return Ok(()),
        };
        if !matches!(
            child.state,
            OrderState::PartiallyFilled | OrderState::Filled
        ) {
            return Ok(());
        }

        let mut siblings = self
            .store
            .load_orders_by_filter(&td_store::OrderFilter {
                parent_id: Some(parent_id),
                ..Default::default()
            })
            .await?;
        siblings.retain(|s| s.group_id.is_none());
        siblings.sort_by_key(|s| s.created_at);

        // Another slice already live → nothing to release yet.
        let other_live = siblings.iter().any(|s| {
            s.order_id != child.order_id
                && matches!(s.state, OrderState::Queued | OrderState::Submitted | OrderState::ModifyRequested)
        });
        if other_live {
            return Ok(());
        }

        if let Some(next) = siblings.iter().find(|s| s.state == OrderState::Pending) {
            self.apply_local_transition(next, OrderState::Queued, "iceberg slice released")
                .await?;
            self.dispatch_order(next.order_id).await?;
        }
        Ok(())
    }

    /// Roll a slice's fill up into the iceberg container so the parent row
    /// reflects total progress.
    async fn propagate_to_parent(
        &self,
        child: &Order,
        fill: &Option<Fill>,
    ) -> Result<(), StoreError> {
        let (parent_id, fill) = match (child.parent_id, fill) {
            (Some(p), Some(f)) if child.group_id.is_none() => (p, f),
            _ => return Ok(()),
        };
        let parent = self.store.load_order(parent_id).await?;
        if parent.state.is_terminal() {
            return Ok(());
        }

        let mut updated = parent.clone();
        updated.avg_fill_price = Some(vwap_merge(
            parent.avg_fill_price.unwrap_or(Amount::ZERO),
            parent.filled_qty,
            fill.price,
            fill.qty,
        ));
        updated.filled_qty = parent.filled_qty + fill.qty;

        let target = if updated.filled_qty >= updated.qty {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        let next = match transition(parent.state, target) {
            Ok(s) => s,
            Err(e) => {
                self.quarantine(parent_id, &e.to_string());
                return Ok(());
            }
        };
        updated.state = next;
        updated.updated_at = fill.ts;

        let mut tx = self.store.begin().await?;
        tx.upsert_order(&updated).await?;
        if next != parent.state {
            tx.record_transition(&transition_row(
                parent_id,
                parent.state,
                next,
                "slice fill rollup",
            ))
            .await?;
        }
        tx.commit().await?;

        // A completed container arms its bracket exits, same as a plain fill.
        if next == OrderState::Filled {
            self.release_bracket_exits(&updated).await?;
        }
        Ok(())
    }

    /// A filled bracket entry arms its OCO exits.
    async fn release_bracket_exits(&self, entry: &Order) -> Result<(), StoreError> {
        if entry.parent_id.is_some() {
            return Ok(());
        }
        let exits = self
            .store
            .load_orders_by_filter(&td_store::OrderFilter {
                parent_id: Some(entry.order_id),
                ..Default::default()
            })
            .await?;

        for exit in exits.iter().filter(|e| e.group_id.is_some()) {
            if exit.state != OrderState::Pending {
                continue;
            }
            self.apply_local_transition(exit, OrderState::Queued, "bracket exit armed")
                .await?;
            self.dispatch_order(exit.order_id).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn order_from_intent(
    order_id: Uuid,
    intent: &OrderIntent,
    broker_id: String,
    now: chrono::DateTime<Utc>,
) -> Order {
    Order {
        order_id,
        idempotency_key: intent.idempotency_key.clone(),
        strategy_id: intent.strategy_id.clone(),
        broker_id,
        instrument: intent.instrument.clone(),
        side: intent.side,
        order_type: intent.order_type,
        validity: intent.validity,
        product: intent.product,
        qty: intent.qty,
        price: intent.price,
        trigger_price: intent.trigger_price,
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

fn transition_row(
    order_id: Uuid,
    from: OrderState,
    to: OrderState,
    reason: &str,
) -> OrderTransition {
    OrderTransition {
        order_id,
        from,
        to,
        at: Utc::now(),
        reason: reason.to_string(),
    }
}

fn fee_key(instrument: &Instrument, product: td_schemas::ProductType) -> (AssetClass, Segment) {
    match instrument.instrument_type {
        InstrumentType::Future => (AssetClass::Derivative, Segment::Futures),
        InstrumentType::Option => (AssetClass::Derivative, Segment::Options),
        InstrumentType::Currency => (AssetClass::Currency, Segment::Futures),
        InstrumentType::Commodity => (AssetClass::Commodity, Segment::Futures),
        InstrumentType::Equity => (
            AssetClass::Equity,
            if product.is_delivery() {
                Segment::Delivery
            } else {
                Segment::Intraday
            },
        ),
    }
}
