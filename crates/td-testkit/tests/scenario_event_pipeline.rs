//! The hash-keyed event pipeline applies a stream of events end to end:
//! per-order ordering holds even with several workers running.

use std::time::Duration;

use td_coordinator::spawn_event_pipeline;
use td_schemas::{Amount, OrderState};
use td_store::Store;
use td_testkit::{sbin, Harness};

/// Poll until the predicate holds or the deadline passes.
async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_applies_fills_in_order_across_workers() {
    let h = Harness::new().await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Three orders, fills interleaved across them.
    let mut ids = Vec::new();
    for _ in 0..3 {
        let resp = h.engine.submit(h.limit_buy(sbin(), 90, 500)).await.unwrap();
        ids.push(resp.order_id);
    }

    let pipeline = spawn_event_pipeline(
        h.engine.clone(),
        h.broker.clone(),
        4,
        shutdown_rx,
    )
    .await
    .unwrap();

    let mut bids = Vec::new();
    for id in &ids {
        bids.push(h.store.load_order(*id).await.unwrap().broker_order_id.unwrap());
    }

    // 30 + 30 + 30 per order, round-robin across orders.
    for round in 0..3 {
        for bid in &bids {
            if round < 2 {
                h.broker.emit_partial_fill(bid, 30, Amount::from_rupees(500));
            } else {
                h.broker.emit_fill(bid, 30, Amount::from_rupees(500));
            }
        }
    }

    let store = h.store.clone();
    let ids_check = ids.clone();
    wait_for(move || {
        let store = store.clone();
        let ids = ids_check.clone();
        async move {
            for id in &ids {
                let o = store.load_order(*id).await.unwrap();
                if o.state != OrderState::Filled || o.filled_qty != 90 {
                    return false;
                }
            }
            true
        }
    })
    .await;

    // Every order saw the strict Submitted → PartiallyFilled → Filled walk,
    // never a fill overflow or out-of-order terminal.
    for id in &ids {
        let o = h.store.load_order(*id).await.unwrap();
        assert_eq!(o.filled_qty, 90);
        let ts = h.store.load_transitions(*id).await.unwrap();
        let mut path = vec![ts[0].from];
        path.extend(ts.iter().map(|t| t.to));
        assert!(td_oms::is_valid_state_path(&path));
    }

    let _ = shutdown_tx.send(true);
    let _ = pipeline.await;
}
