//! Bounded intake queue in front of the submit pipeline.
//!
//! Producers get synchronous backpressure: a full queue rejects with
//! `CAPACITY_EXCEEDED` instead of parking the caller. Each accepted job
//! runs on its own task (one producer task per submission).

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use td_schemas::OrderIntent;

use crate::engine::OrderCoordinator;
use crate::error::{SubmitError, SubmitResponse};

struct SubmitJob {
    intent: OrderIntent,
    respond: oneshot::Sender<Result<SubmitResponse, SubmitError>>,
}

/// Cheap handle cloned into every producer (CLI, daemon, strategies).
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<SubmitJob>,
}

impl CoordinatorHandle {
    /// Enqueue a submission.
    ///
    /// Returns `CAPACITY_EXCEEDED` synchronously when the intake queue is
    /// full; otherwise awaits the pipeline's verdict.
    pub async fn submit(&self, intent: OrderIntent) -> Result<SubmitResponse, SubmitError> {
        let (respond, rx) = oneshot::channel();
        match self.tx.try_send(SubmitJob { intent, respond }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(SubmitError::CapacityExceeded),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(SubmitError::Shutdown),
        }
        rx.await.unwrap_or(Err(SubmitError::Shutdown))
    }
}

/// Start the intake worker. Capacity comes from
/// `CoreConfig::intake_queue_capacity`.
pub fn spawn_intake(
    engine: Arc<OrderCoordinator>,
    shutdown: watch::Receiver<bool>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let capacity = engine.config().intake_queue_capacity;
    let (tx, mut rx) = mpsc::channel::<SubmitJob>(capacity);

    let mut shutdown = shutdown;
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                job = rx.recv() => {
                    match job {
                        Some(SubmitJob { intent, respond }) => {
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                let result = engine.submit(intent).await;
                                // Caller may have gone away; nothing to do.
                                let _ = respond.send(result);
                            });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    (CoordinatorHandle { tx }, handle)
}
