//! Scenario: a futures order larger than the funded margin is rejected
//! with the exact shortfall, and the rejection is persisted.

use td_coordinator::SubmitError;
use td_schemas::{Amount, OrderState};
use td_store::Store;
use td_testkit::{nifty_fut, Harness};

#[tokio::test]
async fn margin_shortfall_rejects_with_exact_gap() {
    let h = Harness::new().await;
    h.engine.set_available_margin(Amount::from_rupees(50_000));

    // qty 100 · price 10_000 · lot 1 → value 1_000_000; SPAN 12% +
    // exposure 4% → required 160_000 against 50_000 available.
    let intent = h.limit_buy(nifty_fut(), 100, 10_000);
    let err = h.engine.submit(intent).await.unwrap_err();

    let order_id = match err {
        SubmitError::MarginShortfall {
            order_id,
            available,
            required,
            shortfall,
        } => {
            assert_eq!(available, Amount::from_rupees(50_000));
            assert_eq!(required, Amount::from_rupees(160_000));
            assert_eq!(shortfall, Amount::from_rupees(110_000));
            order_id
        }
        other => panic!("expected margin shortfall, got {other:?}"),
    };

    // Terminal rejection is persisted with an audit transition.
    let order = h.store.load_order(order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Rejected);
    assert!(order
        .reject_reason
        .as_deref()
        .unwrap_or_default()
        .contains("MARGIN_SHORTFALL"));

    let transitions = h.store.load_transitions(order_id).await.unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from, OrderState::Pending);
    assert_eq!(transitions[0].to, OrderState::Rejected);

    // Nothing reached the venue.
    assert_eq!(h.broker.place_count(), 0);
}

#[tokio::test]
async fn funded_account_clears_the_same_order() {
    let h = Harness::new().await;
    h.engine.set_available_margin(Amount::from_rupees(500_000));

    let resp = h
        .engine
        .submit(h.limit_buy(nifty_fut(), 100, 10_000))
        .await
        .unwrap();
    assert_eq!(resp.state, OrderState::Submitted);
}

#[tokio::test]
async fn exact_margin_is_sufficient() {
    let h = Harness::new().await;
    h.engine.set_available_margin(Amount::from_rupees(160_000));

    let resp = h
        .engine
        .submit(h.limit_buy(nifty_fut(), 100, 10_000))
        .await
        .unwrap();
    assert_eq!(resp.state, OrderState::Submitted);
}
