//! Hash-keyed broker-event fan-in.
//!
//! One long-lived consumer task drains a broker's event stream and routes
//! each event to a fixed worker by hashing its `broker_order_id`. Events
//! for one order therefore apply on one task, in arrival order; across
//! orders no ordering is promised (none is needed).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use td_broker::{BrokerAdapter, BrokerEvent};

use crate::engine::OrderCoordinator;

const WORKER_QUEUE_CAPACITY: usize = 256;

pub fn worker_index(broker_order_id: &str, workers: usize) -> usize {
    let mut h = DefaultHasher::new();
    broker_order_id.hash(&mut h);
    (h.finish() % workers.max(1) as u64) as usize
}

/// Subscribe to a broker's stream and pump events through `workers`
/// single-writer tasks until shutdown flips or the stream closes.
///
/// Returns the consumer's join handle; worker tasks end when the consumer
/// drops their queues.
pub async fn spawn_event_pipeline(
    engine: Arc<OrderCoordinator>,
    adapter: Arc<dyn BrokerAdapter>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, td_broker::BrokerError> {
    let mut stream = adapter.subscribe_events().await?;
    let broker_id = adapter.broker_id().to_string();
    let workers = workers.max(1);

    let mut senders: Vec<mpsc::Sender<BrokerEvent>> = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (tx, mut rx) = mpsc::channel::<BrokerEvent>(WORKER_QUEUE_CAPACITY);
        senders.push(tx);
        let engine = engine.clone();
        let broker_id = broker_id.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Err(e) = engine.handle_event(&ev).await {
                    tracing::error!(
                        broker_id,
                        worker_id,
                        broker_order_id = %ev.broker_order_id,
                        error = %e,
                        "event application failed"
                    );
                }
            }
        });
    }

    let mut shutdown = shutdown;
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_ev = stream.recv() => {
                    match maybe_ev {
                        Some(ev) => {
                            let idx = worker_index(&ev.broker_order_id, senders.len());
                            if senders[idx].send(ev).await.is_err() {
                                tracing::error!(broker_id, "event worker gone; stopping consumer");
                                break;
                            }
                        }
                        None => {
                            tracing::info!(broker_id, "broker event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(broker_id, "event consumer shutting down");
                        break;
                    }
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_order_always_hits_same_worker() {
        for workers in [1usize, 2, 4, 8] {
            let a = worker_index("P-1", workers);
            for _ in 0..32 {
                assert_eq!(worker_index("P-1", workers), a);
            }
            assert!(a < workers);
        }
    }

    #[test]
    fn zero_workers_clamped() {
        assert_eq!(worker_index("anything", 0), 0);
    }
}
