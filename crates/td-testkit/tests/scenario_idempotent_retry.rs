//! Scenario: submitting the same intent twice yields the same order and a
//! single broker RPC.

use td_schemas::OrderState;
use td_store::Store;
use td_testkit::{sbin, Harness};

#[tokio::test]
async fn idempotent_retry_returns_original_order_without_second_rpc() {
    let mut h = Harness::new().await;

    let mut intent = h.limit_buy(sbin(), 10, 100);
    intent.idempotency_key = Some("k1".into());

    let first = h.engine.submit(intent.clone()).await.unwrap();
    assert!(!first.existing);
    h.pump().await;

    let order = h.store.load_order(first.order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Submitted);
    assert_eq!(order.broker_order_id.as_deref(), Some("P-1"));
    assert_eq!(h.broker.place_count(), 1);

    // Retry with the same key: same order id, no new work at the venue.
    let second = h.engine.submit(intent).await.unwrap();
    assert!(second.existing);
    assert_eq!(second.order_id, first.order_id);
    assert_eq!(second.state, OrderState::Submitted);
    assert_eq!(h.broker.place_count(), 1, "no double-sent broker RPC");

    // Exactly one order row exists for the key.
    let all = h
        .store
        .load_orders_by_filter(&Default::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn different_keys_create_independent_orders() {
    let mut h = Harness::new().await;

    let mut a = h.limit_buy(sbin(), 10, 100);
    a.idempotency_key = Some("ka".into());
    let mut b = h.limit_buy(sbin(), 10, 100);
    b.idempotency_key = Some("kb".into());

    let ra = h.engine.submit(a).await.unwrap();
    let rb = h.engine.submit(b).await.unwrap();
    h.pump().await;

    assert_ne!(ra.order_id, rb.order_id);
    assert_eq!(h.broker.place_count(), 2);
}

#[tokio::test]
async fn keyless_submissions_are_never_deduplicated() {
    let mut h = Harness::new().await;

    let ra = h.engine.submit(h.limit_buy(sbin(), 10, 100)).await.unwrap();
    let rb = h.engine.submit(h.limit_buy(sbin(), 10, 100)).await.unwrap();
    h.pump().await;

    assert_ne!(ra.order_id, rb.order_id);
    assert_eq!(h.broker.place_count(), 2);
}

#[tokio::test]
async fn retry_of_a_rejected_key_returns_the_rejected_order() {
    let mut h = Harness::new().await;

    let mut bad = h.limit_buy(sbin(), 0, 100); // qty 0 → validation reject
    bad.idempotency_key = Some("kr".into());
    let err = h.engine.submit(bad.clone()).await.unwrap_err();
    let rejected_id = match err {
        td_coordinator::SubmitError::Validation { order_id, .. } => order_id,
        other => panic!("expected validation rejection, got {other:?}"),
    };

    let retry = h.engine.submit(bad).await.unwrap();
    assert!(retry.existing);
    assert_eq!(retry.order_id, rejected_id);
    assert_eq!(retry.state, OrderState::Rejected);
    assert_eq!(h.broker.place_count(), 0);
}
