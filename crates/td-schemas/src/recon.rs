//! Reconciliation run and item records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconScope {
    Orders,
    Positions,
    Holdings,
    All,
}

impl ReconScope {
    /// Concrete scopes covered by this value (`All` expands).
    pub fn expand(self) -> Vec<ReconScope> {
        match self {
            ReconScope::All => vec![
                ReconScope::Orders,
                ReconScope::Positions,
                ReconScope::Holdings,
            ],
            other => vec![other],
        }
    }
}

impl std::fmt::Display for ReconScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconScope::Orders => "orders",
            ReconScope::Positions => "positions",
            ReconScope::Holdings => "holdings",
            ReconScope::All => "all",
        };
        write!(f, "{s}")
    }
}

/// `recon:{broker}:{scope}` — the store-level lock key that serializes runs.
pub fn recon_lock_key(broker_id: &str, scope: ReconScope) -> String {
    format!("recon:{broker_id}:{scope}")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconRunStatus {
    Running,
    Completed,
    Failed,
    CompletedWithErrors,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconRun {
    pub run_id: Uuid,
    pub broker_id: String,
    pub scope: ReconScope,
    pub status: ReconRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items_checked: u64,
    pub mismatches_found: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconItemType {
    Order,
    Position,
    Holding,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconItemStatus {
    Mismatch,
    Resolved,
    Ignored,
    ManualIntervention,
}

/// One detail row of a reconciliation run. `discrepancy` is a JSON object
/// keyed by field name with `{local, broker}` values; absent sides are null
/// (ghost/orphan records).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconItem {
    pub run_id: Uuid,
    pub item_type: ReconItemType,
    pub item_id: Option<String>,
    pub broker_ref_id: Option<String>,
    pub system_snapshot: Option<Value>,
    pub broker_snapshot: Option<Value>,
    pub discrepancy: Value,
    pub status: ReconItemStatus,
}
