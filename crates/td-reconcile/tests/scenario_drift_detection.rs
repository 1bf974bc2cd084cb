//! Scenario: reconciliation detects order-state drift against the venue.
//!
//! Local store believes order O is SUBMITTED at broker id B2; the broker
//! reports it fully filled at an average of 101. The run must record a
//! mismatch item carrying a JSON diff for state and avg_price and finish
//! `completed_with_errors`. A clean venue finishes `completed`, and the
//! per-(broker, scope) lock refuses a second concurrent run.

use chrono::Utc;
use uuid::Uuid;

use td_broker::BrokerOrderSnapshot;
use td_broker_paper::PaperBroker;
use td_reconcile::{run_reconciliation, ReconError};
use td_schemas::{
    recon_lock_key, Amount, InstrumentKey, Order, OrderState, OrderType, ProductType,
    ReconRunStatus, ReconScope, Side, Validity,
};
use td_store::{MemoryStore, Store, StoreTx as _};

fn submitted_order(broker_order_id: &str) -> Order {
    let now = Utc::now();
    Order {
        order_id: Uuid::new_v4(),
        idempotency_key: None,
        strategy_id: None,
        broker_id: "paper".into(),
        instrument: InstrumentKey::new("NSE", "SBIN"),
        side: Side::Buy,
        order_type: OrderType::Limit,
        validity: Validity::Day,
        product: ProductType::Mis,
        qty: 100,
        price: Some(Amount::from_rupees(100)),
        trigger_price: None,
        group_id: None,
        parent_id: None,
        broker_order_id: Some(broker_order_id.into()),
        state: OrderState::Submitted,
        filled_qty: 0,
        avg_fill_price: None,
        reject_reason: None,
        created_at: now,
        updated_at: now,
    }
}

async fn seed_order(store: &MemoryStore, order: &Order) {
    let mut tx = store.begin().await.unwrap();
    tx.upsert_order(order).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn drift_records_mismatch_and_completed_with_errors() {
    let store = MemoryStore::new();
    let broker = PaperBroker::new("paper");

    seed_order(&store, &submitted_order("B2")).await;
    broker.set_order_snapshot(BrokerOrderSnapshot {
        broker_order_id: "B2".into(),
        instrument: InstrumentKey::new("NSE", "SBIN"),
        side: Side::Buy,
        state: OrderState::Filled,
        qty: 100,
        filled_qty: 100,
        avg_fill_price: Some(Amount::from_rupees(101)),
        price: Some(Amount::from_rupees(100)),
    });

    let run = run_reconciliation(&store, &broker, ReconScope::Orders, Utc::now())
        .await
        .unwrap();

    assert_eq!(run.status, ReconRunStatus::CompletedWithErrors);
    assert_eq!(run.mismatches_found, 1);

    let items = store.load_recon_items(run.run_id).await.unwrap();
    assert_eq!(items.len(), 1);
    let disc = &items[0].discrepancy;
    assert_eq!(disc["state"]["local"], "SUBMITTED");
    assert_eq!(disc["state"]["broker"], "FILLED");
    assert!(disc.get("avg_price").is_some());

    // The run row is persisted and loadable.
    let stored = store.load_recon_run(run.run_id).await.unwrap();
    assert_eq!(stored.status, ReconRunStatus::CompletedWithErrors);
}

#[tokio::test]
async fn clean_state_completes_without_items() {
    let store = MemoryStore::new();
    let broker = PaperBroker::new("paper");

    let order = submitted_order("B1");
    seed_order(&store, &order).await;
    broker.set_order_snapshot(BrokerOrderSnapshot {
        broker_order_id: "B1".into(),
        instrument: order.instrument.clone(),
        side: order.side,
        state: OrderState::Submitted,
        qty: order.qty,
        filled_qty: 0,
        avg_fill_price: None,
        price: order.price,
    });

    let run = run_reconciliation(&store, &broker, ReconScope::Orders, Utc::now())
        .await
        .unwrap();

    assert_eq!(run.status, ReconRunStatus::Completed);
    assert_eq!(run.mismatches_found, 0);
    assert!(store.load_recon_items(run.run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn orphan_at_broker_is_flagged() {
    let store = MemoryStore::new();
    let broker = PaperBroker::new("paper");

    broker.set_order_snapshot(BrokerOrderSnapshot {
        broker_order_id: "GHOSTLY".into(),
        instrument: InstrumentKey::new("NSE", "SBIN"),
        side: Side::Sell,
        state: OrderState::Submitted,
        qty: 5,
        filled_qty: 0,
        avg_fill_price: None,
        price: Some(Amount::from_rupees(99)),
    });

    let run = run_reconciliation(&store, &broker, ReconScope::Orders, Utc::now())
        .await
        .unwrap();

    assert_eq!(run.status, ReconRunStatus::CompletedWithErrors);
    let items = store.load_recon_items(run.run_id).await.unwrap();
    assert_eq!(items[0].discrepancy["missing_at"], "local");
    assert_eq!(items[0].broker_ref_id.as_deref(), Some("GHOSTLY"));
}

#[tokio::test]
async fn second_concurrent_run_is_refused_by_lock() {
    let store = MemoryStore::new();
    let broker = PaperBroker::new("paper");

    // Hold the lock as if a run were in flight.
    assert!(store
        .try_acquire_lock(&recon_lock_key("paper", ReconScope::Orders))
        .await
        .unwrap());

    let err = run_reconciliation(&store, &broker, ReconScope::Orders, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::AlreadyRunning { .. }));

    // Released → runs again.
    store
        .release_lock(&recon_lock_key("paper", ReconScope::Orders))
        .await
        .unwrap();
    assert!(
        run_reconciliation(&store, &broker, ReconScope::Orders, Utc::now())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn all_scope_covers_positions_and_holdings() {
    let store = MemoryStore::new();
    let broker = PaperBroker::new("paper");

    broker.set_positions(vec![td_broker::BrokerPositionSnapshot {
        instrument: InstrumentKey::new("NSE", "SBIN"),
        product: ProductType::Mis,
        net_qty: 100,
        avg_price: Amount::from_rupees(500),
    }]);

    let run = run_reconciliation(&store, &broker, ReconScope::All, Utc::now())
        .await
        .unwrap();

    // The broker-side position has no local counterpart.
    assert_eq!(run.status, ReconRunStatus::CompletedWithErrors);
    let items = store.load_recon_items(run.run_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].discrepancy["missing_at"], "local");
}
