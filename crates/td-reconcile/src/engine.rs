//! The reconciliation run workflow.
//!
//! A run fetches broker truth through the adapter, reads local truth from
//! the store, records the classified diff, and rolls the run status up:
//! `completed` with zero mismatches, else `completed_with_errors`; a fetch
//! failure records `failed`. Resolution is advisory — items stay `mismatch`
//! until an operator marks them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use td_broker::{BrokerAdapter, BrokerError};
use td_schemas::{recon_lock_key, ReconRun, ReconRunStatus, ReconScope};
use td_store::{Store, StoreError, StoreTx as _};

use crate::diff::diff_scope;

#[derive(Debug)]
pub enum ReconError {
    /// Another run for `(broker, scope)` is already active.
    AlreadyRunning { lock_key: String },
    Broker(BrokerError),
    Store(StoreError),
}

impl std::fmt::Display for ReconError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconError::AlreadyRunning { lock_key } => {
                write!(f, "reconciliation already running: {lock_key}")
            }
            ReconError::Broker(e) => write!(f, "reconciliation broker fetch failed: {e}"),
            ReconError::Store(e) => write!(f, "reconciliation store failure: {e}"),
        }
    }
}

impl std::error::Error for ReconError {}

impl From<StoreError> for ReconError {
    fn from(e: StoreError) -> Self {
        ReconError::Store(e)
    }
}

/// Execute one reconciliation run for `(broker, scope)`.
///
/// Only one run per key may be active; the store lock `recon:{broker}:{scope}`
/// enforces this across processes. The run row and its items are committed
/// in one transaction; the lock is released on every exit path.
pub async fn run_reconciliation(
    store: &dyn Store,
    adapter: &dyn BrokerAdapter,
    scope: ReconScope,
    started_at: DateTime<Utc>,
) -> Result<ReconRun, ReconError> {
    let broker_id = adapter.broker_id().to_string();
    let lock_key = recon_lock_key(&broker_id, scope);

    if !store.try_acquire_lock(&lock_key).await? {
        return Err(ReconError::AlreadyRunning { lock_key });
    }

    let result = run_locked(store, adapter, &broker_id, scope, started_at).await;

    // Release regardless of outcome; a stuck lock blocks the schedule.
    if let Err(e) = store.release_lock(&lock_key).await {
        tracing::error!(lock_key, error = %e, "failed to release reconciliation lock");
    }

    result
}

async fn run_locked(
    store: &dyn Store,
    adapter: &dyn BrokerAdapter,
    broker_id: &str,
    scope: ReconScope,
    started_at: DateTime<Utc>,
) -> Result<ReconRun, ReconError> {
    let run_id = Uuid::new_v4();

    let fetched = fetch_broker_truth(adapter, scope).await;
    let (orders, positions, holdings) = match fetched {
        Ok(t) => t,
        Err(e) => {
            // Record the failed run so the schedule's history is honest.
            let run = ReconRun {
                run_id,
                broker_id: broker_id.to_string(),
                scope,
                status: ReconRunStatus::Failed,
                started_at,
                finished_at: Some(Utc::now()),
                items_checked: 0,
                mismatches_found: 0,
            };
            persist(store, &run, &[]).await?;
            return Err(ReconError::Broker(e));
        }
    };

    let local = store.load_local_snapshots(broker_id).await?;
    let diff = diff_scope(run_id, scope, &local, &orders, &positions, &holdings);

    let status = if diff.mismatches.is_empty() {
        ReconRunStatus::Completed
    } else {
        ReconRunStatus::CompletedWithErrors
    };

    let run = ReconRun {
        run_id,
        broker_id: broker_id.to_string(),
        scope,
        status,
        started_at,
        finished_at: Some(Utc::now()),
        items_checked: diff.items_checked,
        mismatches_found: diff.mismatches.len() as u64,
    };

    tracing::info!(
        broker_id,
        %scope,
        items_checked = run.items_checked,
        mismatches = run.mismatches_found,
        "reconciliation run finished"
    );

    persist(store, &run, &diff.mismatches).await?;
    Ok(run)
}

async fn fetch_broker_truth(
    adapter: &dyn BrokerAdapter,
    scope: ReconScope,
) -> Result<
    (
        Vec<td_broker::BrokerOrderSnapshot>,
        Vec<td_broker::BrokerPositionSnapshot>,
        Vec<td_broker::BrokerHoldingSnapshot>,
    ),
    BrokerError,
> {
    let scopes = scope.expand();
    let mut orders = Vec::new();
    let mut positions = Vec::new();
    let mut holdings = Vec::new();

    for s in scopes {
        match s {
            ReconScope::Orders => orders = adapter.fetch_open_orders().await?,
            ReconScope::Positions => positions = adapter.fetch_positions().await?,
            ReconScope::Holdings => holdings = adapter.fetch_holdings().await?,
            ReconScope::All => unreachable!("expand() returns concrete scopes"),
        }
    }

    Ok((orders, positions, holdings))
}

async fn persist(
    store: &dyn Store,
    run: &ReconRun,
    items: &[td_schemas::ReconItem],
) -> Result<(), StoreError> {
    let mut tx = store.begin().await?;
    tx.write_recon_run(run).await?;
    tx.write_recon_items(items).await?;
    tx.commit().await
}
