//! Scenario: two partial fills, then a user cancel confirmed by the broker.
//! The order lands CANCELLED with the partial quantity retained and the
//! position increased by exactly the filled amount.

use td_portfolio::vwap_merge;
use td_schemas::{Amount, OrderState, PositionKey, ProductType};
use td_store::Store;
use td_testkit::{sbin, Harness, BROKER};

#[tokio::test]
async fn partial_fills_then_cancel_retains_fills() {
    let mut h = Harness::new().await;

    let resp = h.engine.submit(h.limit_buy(sbin(), 100, 500)).await.unwrap();
    h.pump().await;

    let order = h.store.load_order(resp.order_id).await.unwrap();
    let bid = order.broker_order_id.clone().unwrap();

    // Broker fills 40 @ 500, then 30 @ 510.
    h.broker.emit_partial_fill(&bid, 40, Amount::from_rupees(500));
    h.broker.emit_partial_fill(&bid, 30, Amount::from_rupees(510));
    h.pump().await;

    let order = h.store.load_order(resp.order_id).await.unwrap();
    assert_eq!(order.state, OrderState::PartiallyFilled);
    assert_eq!(order.filled_qty, 70);

    // User cancels; state holds until the venue confirms.
    h.engine.cancel(resp.order_id).await.unwrap();
    let order = h.store.load_order(resp.order_id).await.unwrap();
    assert_eq!(order.state, OrderState::PartiallyFilled);
    assert_eq!(h.broker.cancel_count(), 1);

    h.broker.confirm_cancel(&bid);
    h.pump().await;

    let order = h.store.load_order(resp.order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Cancelled);
    assert_eq!(order.filled_qty, 70);
    assert!(order.filled_qty < order.qty);

    // Average fill price is the volume-weighted mean of the two fills.
    let expected_avg = vwap_merge(Amount::from_rupees(500), 40, Amount::from_rupees(510), 30);
    assert_eq!(order.avg_fill_price, Some(expected_avg));

    // Position grew by exactly the filled quantity.
    let book = h.engine.portfolio_snapshot();
    let key = PositionKey::new(BROKER, sbin(), ProductType::Mis);
    assert_eq!(book.positions[&key].net_qty(), 70);

    // Fill rows were persisted and the state path is legal.
    let fills = h.store.load_fills(resp.order_id).await.unwrap();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills.iter().map(|f| f.qty).sum::<i64>(), 70);

    let path: Vec<OrderState> = {
        let ts = h.store.load_transitions(resp.order_id).await.unwrap();
        let mut p = vec![ts[0].from];
        p.extend(ts.iter().map(|t| t.to));
        p
    };
    assert!(td_oms::is_valid_state_path(&path));
    assert_eq!(*path.last().unwrap(), OrderState::Cancelled);
}

#[tokio::test]
async fn duplicate_fill_event_is_not_applied_twice() {
    let mut h = Harness::new().await;

    let resp = h.engine.submit(h.limit_buy(sbin(), 100, 500)).await.unwrap();
    h.pump().await;
    let bid = h
        .store
        .load_order(resp.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();

    h.broker.emit_partial_fill(&bid, 40, Amount::from_rupees(500));
    h.pump().await;

    // Venue re-delivers the same fill id (restart, at-least-once stream).
    let fills = h.store.load_fills(resp.order_id).await.unwrap();
    let replay = td_broker::BrokerEvent {
        broker_id: BROKER.into(),
        broker_order_id: bid,
        seq: 99,
        kind: td_broker::BrokerEventKind::PartialFill {
            fill_id: fills[0].fill_id.clone(),
            qty: 40,
            price: Amount::from_rupees(500),
        },
        ts: chrono::Utc::now(),
    };
    h.engine.handle_event(&replay).await.unwrap();

    let order = h.store.load_order(resp.order_id).await.unwrap();
    assert_eq!(order.filled_qty, 40, "replayed fill must not double-apply");
    assert_eq!(h.store.load_fills(resp.order_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_of_terminal_order_is_refused() {
    let mut h = Harness::new().await;

    let resp = h.engine.submit(h.limit_buy(sbin(), 10, 500)).await.unwrap();
    h.pump().await;
    let bid = h
        .store
        .load_order(resp.order_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();
    h.broker.emit_fill(&bid, 10, Amount::from_rupees(500));
    h.pump().await;

    let err = h.engine.cancel(resp.order_id).await.unwrap_err();
    assert!(matches!(
        err,
        td_coordinator::OrderOpError::NotWorking { .. }
    ));
}
