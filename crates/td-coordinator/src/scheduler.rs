//! Scheduled reconciliation ticker.
//!
//! One task per configured `(broker, scope)` entry. The store-level lock
//! inside `run_reconciliation` keeps overlapping fires (or a second engine
//! instance) down to a single active run per key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use td_broker::BrokerAdapter;
use td_config::ReconScheduleEntry;
use td_reconcile::{run_reconciliation, ReconError};
use td_store::Store;

pub fn spawn_reconciliation_schedule(
    store: Arc<dyn Store>,
    brokers: BTreeMap<String, Arc<dyn BrokerAdapter>>,
    schedule: Vec<ReconScheduleEntry>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for entry in schedule {
        let adapter = match brokers.get(&entry.broker_id) {
            Some(a) => a.clone(),
            None => {
                tracing::error!(
                    broker_id = %entry.broker_id,
                    "reconciliation schedule references unknown broker; entry skipped"
                );
                continue;
            }
        };
        let store = store.clone();
        let mut shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(entry.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup isn't a
            // reconciliation stampede.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match run_reconciliation(store.as_ref(), adapter.as_ref(), entry.scope, Utc::now()).await {
                            Ok(run) => {
                                tracing::debug!(
                                    broker_id = %entry.broker_id,
                                    scope = %entry.scope,
                                    status = ?run.status,
                                    mismatches = run.mismatches_found,
                                    "scheduled reconciliation finished"
                                );
                            }
                            Err(ReconError::AlreadyRunning { lock_key }) => {
                                tracing::debug!(lock_key, "previous run still active; tick skipped");
                            }
                            Err(e) => {
                                tracing::warn!(
                                    broker_id = %entry.broker_id,
                                    scope = %entry.scope,
                                    error = %e,
                                    "scheduled reconciliation failed"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    handles
}
