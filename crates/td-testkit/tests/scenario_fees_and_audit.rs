//! Fee attribution on terminal fills, and the audit-trail invariants every
//! order must satisfy after a burst of mixed activity.

use td_schemas::{Amount, OrderState};
use td_store::Store;
use td_testkit::{sbin, Harness};

#[tokio::test]
async fn terminal_fill_writes_fee_breakdown_once() {
    let mut h = Harness::new().await;

    let resp = h.engine.submit(h.limit_buy(sbin(), 100, 1_000)).await.unwrap();
    h.pump().await;
    let bid = h
        .store
        .load_order(resp.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();

    // No fees while the order is only partially done.
    h.broker.emit_partial_fill(&bid, 60, Amount::from_rupees(1_000));
    h.pump().await;
    assert!(h
        .store
        .load_fee_breakdown(resp.order_id)
        .await
        .unwrap()
        .is_none());

    h.broker.emit_fill(&bid, 40, Amount::from_rupees(1_000));
    h.pump().await;

    let fees = h
        .store
        .load_fee_breakdown(resp.order_id)
        .await
        .unwrap()
        .expect("fees attributed on terminal fill");

    // Total is exactly the sum of the rounded components, and every
    // component is two-decimal aligned.
    assert_eq!(fees.total_fees, fees.component_sum());
    for c in [
        fees.brokerage,
        fees.stt,
        fees.exchange_txn,
        fees.gst,
        fees.sebi,
        fees.stamp_duty,
        fees.total_fees,
    ] {
        assert!(c.is_2dp_aligned(), "fee component {c} not 2dp-aligned");
    }
    assert_eq!(fees.order_value, Amount::from_rupees(100_000));
}

#[tokio::test]
async fn every_order_walks_a_legal_state_path() {
    let mut h = Harness::new().await;

    // A mixed batch: clean fill, partial+cancel, venue reject.
    let filled = h.engine.submit(h.limit_buy(sbin(), 10, 500)).await.unwrap();
    h.pump().await;
    let bid = h
        .store
        .load_order(filled.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();
    h.broker.emit_fill(&bid, 10, Amount::from_rupees(500));

    let cancelled = h.engine.submit(h.limit_buy(sbin(), 20, 490)).await.unwrap();
    h.pump().await;
    let bid2 = h
        .store
        .load_order(cancelled.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();
    h.broker.emit_partial_fill(&bid2, 5, Amount::from_rupees(490));
    h.pump().await;
    h.engine.cancel(cancelled.order_id).await.unwrap();
    h.broker.confirm_cancel(&bid2);

    h.broker.script_reject_next("price band");
    let rejected = h.engine.submit(h.limit_buy(sbin(), 5, 480)).await;
    assert!(rejected.is_ok(), "venue reject is terminal but submit itself accepted the order");
    h.pump().await;

    // Invariants over everything persisted.
    let all = h
        .store
        .load_orders_by_filter(&Default::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    for order in all {
        assert!(order.filled_qty <= order.qty);

        let ts = h.store.load_transitions(order.order_id).await.unwrap();
        assert!(!ts.is_empty(), "every order carries its audit trail");
        let mut path = vec![ts[0].from];
        path.extend(ts.iter().map(|t| t.to));
        assert!(
            td_oms::is_valid_state_path(&path),
            "illegal path {path:?} for order {}",
            order.order_id
        );
        assert_eq!(*path.last().unwrap(), order.state);
    }
}

#[tokio::test]
async fn venue_reject_lands_rejected_with_reason() {
    let mut h = Harness::new().await;

    h.broker.script_reject_next("instrument banned for intraday");
    let resp = h.engine.submit(h.limit_buy(sbin(), 10, 500)).await.unwrap();
    h.pump().await;

    let order = h.store.load_order(resp.order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Rejected);
    assert_eq!(
        order.reject_reason.as_deref(),
        Some("instrument banned for intraday")
    );
}
