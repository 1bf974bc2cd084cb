//! Typed view of the merged configuration document.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use td_schemas::{InstrumentType, ReconScope};

/// Engine configuration read once at start. Unknown keys are tolerated (the
/// layered document also carries collaborator sections the core ignores).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Broker used by the router when no rule matches.
    pub default_broker: String,

    /// instrument_type → broker_id.
    #[serde(default)]
    pub routing_rules: BTreeMap<InstrumentType, String>,

    #[serde(default)]
    pub reconciliation_schedule: Vec<ReconScheduleEntry>,

    #[serde(default)]
    pub risk_defaults: RiskDefaults,

    #[serde(default = "default_intake_capacity")]
    pub intake_queue_capacity: usize,

    #[serde(default = "default_rpc_deadline_ms")]
    pub rpc_deadline_ms: u64,

    /// Per-broker token bucket parameters.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, BrokerRateLimit>,

    #[serde(default)]
    pub var: VarConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_broker.is_empty() {
            bail!("default_broker must not be empty");
        }
        if self.intake_queue_capacity == 0 {
            bail!("intake_queue_capacity must be > 0");
        }
        if self.rpc_deadline_ms == 0 {
            bail!("rpc_deadline_ms must be > 0");
        }
        for e in &self.reconciliation_schedule {
            if e.interval_secs == 0 {
                bail!(
                    "reconciliation interval must be > 0 for {}:{}",
                    e.broker_id,
                    e.scope
                );
            }
        }
        Ok(())
    }
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_rpc_deadline_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconScheduleEntry {
    pub broker_id: String,
    pub scope: ReconScope,
    pub interval_secs: u64,
}

/// Token bucket shape for one broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerRateLimit {
    pub capacity: u32,
    pub refill_per_sec: u32,
}

/// Baseline limits applied when no explicit risk-limit record exists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RiskDefaults {
    #[serde(default)]
    pub max_position_size: Option<i64>,
    #[serde(default)]
    pub max_notional_rupees: Option<i64>,
    #[serde(default)]
    pub max_daily_loss_rupees: Option<i64>,
    #[serde(default)]
    pub max_drawdown_rupees: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
    Historical,
    MonteCarlo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VarConfig {
    #[serde(default = "default_var_method")]
    pub method: VarMethod,
    #[serde(default = "default_var_confidence")]
    pub confidence_pct: u8,
    #[serde(default = "default_var_paths")]
    pub monte_carlo_paths: u32,
    /// RNG seed for the Monte Carlo method; fixed so runs are reproducible.
    #[serde(default)]
    pub seed: u64,
}

fn default_var_method() -> VarMethod {
    VarMethod::Historical
}

fn default_var_confidence() -> u8 {
    99
}

fn default_var_paths() -> u32 {
    10_000
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            method: default_var_method(),
            confidence_pct: default_var_confidence(),
            monte_carlo_paths: default_var_paths(),
            seed: 0,
        }
    }
}
