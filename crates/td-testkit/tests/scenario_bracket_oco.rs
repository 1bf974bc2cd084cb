//! Scenario: bracket entry fills, the OCO exits arm, the target fills, and
//! the coordinator cancels the stop. At most one exit ever fills.

use td_schemas::{Amount, BracketSpec, Order, OrderState, OrderType, Side};
use td_store::{OrderFilter, Store};
use td_testkit::{sbin, Harness};

async fn exits(h: &Harness, entry_id: uuid::Uuid) -> (Order, Order) {
    let kids = h
        .store
        .load_orders_by_filter(&OrderFilter {
            parent_id: Some(entry_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let target = kids
        .iter()
        .find(|k| k.order_type == OrderType::Limit)
        .cloned()
        .unwrap();
    let stop = kids
        .iter()
        .find(|k| k.order_type == OrderType::StopLossMarket)
        .cloned()
        .unwrap();
    (target, stop)
}

#[tokio::test]
async fn target_fill_cancels_stop() {
    let mut h = Harness::new().await;

    let mut intent = h.limit_buy(sbin(), 10, 100);
    intent.bracket = Some(BracketSpec {
        target_price: Amount::from_rupees(110),
        stop_trigger: Amount::from_rupees(95),
    });
    let resp = h.engine.submit(intent).await.unwrap();
    h.pump().await;

    // Exits exist but stay dormant until the entry fills.
    let (target, stop) = exits(&h, resp.order_id).await;
    assert_eq!(target.state, OrderState::Pending);
    assert_eq!(stop.state, OrderState::Pending);
    assert_eq!(target.group_id, stop.group_id);
    assert_eq!(target.side, Side::Sell);
    assert_eq!(stop.side, Side::Sell);
    assert_eq!(h.broker.place_count(), 1);

    // Entry fills at 100 → both exits are armed and placed.
    let entry_bid = h
        .store
        .load_order(resp.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();
    h.broker.emit_fill(&entry_bid, 10, Amount::from_rupees(100));
    h.pump().await;

    let (target, stop) = exits(&h, resp.order_id).await;
    assert_eq!(target.state, OrderState::Submitted);
    assert_eq!(stop.state, OrderState::Submitted);
    assert_eq!(h.broker.place_count(), 3);

    // Target fills at 110 → the coordinator cancels the stop.
    let target_bid = target.broker_order_id.unwrap();
    h.broker.emit_fill(&target_bid, 10, Amount::from_rupees(110));
    h.pump().await;
    assert_eq!(h.broker.cancel_count(), 1);

    // Venue confirms the expected cancel.
    let stop_bid = stop.broker_order_id.unwrap();
    h.broker.confirm_cancel(&stop_bid);
    h.pump().await;

    let (target, stop) = exits(&h, resp.order_id).await;
    assert_eq!(target.state, OrderState::Filled);
    assert_eq!(stop.state, OrderState::Cancelled);

    // OCO exclusivity: never both exits filled.
    assert!(!(target.state == OrderState::Filled && stop.state == OrderState::Filled));

    // Realized P&L reflects only the entry/target round trip:
    // (110 − 100) · 10 = 100.
    let book = h.engine.portfolio_snapshot();
    assert_eq!(book.realized_pnl(), Amount::from_rupees(100));
}

#[tokio::test]
async fn stop_fill_cancels_target() {
    let mut h = Harness::new().await;

    let mut intent = h.limit_buy(sbin(), 10, 100);
    intent.bracket = Some(BracketSpec {
        target_price: Amount::from_rupees(110),
        stop_trigger: Amount::from_rupees(95),
    });
    let resp = h.engine.submit(intent).await.unwrap();
    h.pump().await;

    let entry_bid = h
        .store
        .load_order(resp.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();
    h.broker.emit_fill(&entry_bid, 10, Amount::from_rupees(100));
    h.pump().await;

    let (target, stop) = exits(&h, resp.order_id).await;
    let stop_bid = stop.broker_order_id.unwrap();

    // Market gaps down: the stop executes at 94.
    h.broker.emit_fill(&stop_bid, 10, Amount::from_rupees(94));
    h.pump().await;
    assert_eq!(h.broker.cancel_count(), 1);

    h.broker.confirm_cancel(&target.broker_order_id.unwrap());
    h.pump().await;

    let (target, stop) = exits(&h, resp.order_id).await;
    assert_eq!(stop.state, OrderState::Filled);
    assert_eq!(target.state, OrderState::Cancelled);

    // Loss realized: (94 − 100) · 10 = −60.
    let book = h.engine.portfolio_snapshot();
    assert_eq!(book.realized_pnl(), -Amount::from_rupees(60));
}
