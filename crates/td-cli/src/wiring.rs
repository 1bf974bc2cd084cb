//! Engine assembly for one CLI invocation.
//!
//! The rule file is the operator-maintained side input holding what the
//! exchange/broker masters would feed in production: instruments, fee and
//! margin rule sets, and the funded margin figure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use td_broker::{BrokerAdapter, RetryPolicy};
use td_broker_paper::PaperBroker;
use td_broker_rest::{RestBroker, RestBrokerConfig};
use td_config::CoreConfig;
use td_coordinator::OrderCoordinator;
use td_fees::FeeCalculator;
use td_margin::MarginCalculator;
use td_schemas::{Amount, FeeRule, Instrument, MarginRule};
use td_store::Store;

#[derive(Debug, Default, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub instruments: Vec<Instrument>,
    #[serde(default)]
    pub fee_rules: Vec<FeeRule>,
    #[serde(default)]
    pub margin_rules: Vec<MarginRule>,
    #[serde(default)]
    pub available_margin_rupees: i64,
    /// REST venues keyed by broker id: base URL + credentials env names.
    #[serde(default)]
    pub rest_brokers: BTreeMap<String, RestVenue>,
}

#[derive(Debug, Deserialize)]
pub struct RestVenue {
    pub base_url: String,
    pub api_key_env: String,
    pub api_secret_env: String,
}

pub fn load_rule_file(path: &str) -> Result<RuleFile> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read rule file: {path}"))?;
    serde_yaml::from_str(&s).with_context(|| format!("parse rule file: {path}"))
}

/// Build the adapter set: the default broker is always available as the
/// deterministic paper venue unless a REST venue claims the id.
pub fn build_brokers(
    cfg: &CoreConfig,
    rules: &RuleFile,
) -> Result<BTreeMap<String, Arc<dyn BrokerAdapter>>> {
    let mut brokers: BTreeMap<String, Arc<dyn BrokerAdapter>> = BTreeMap::new();

    for (broker_id, venue) in &rules.rest_brokers {
        let api_key = std::env::var(&venue.api_key_env)
            .with_context(|| format!("missing env var {}", venue.api_key_env))?;
        let api_secret = std::env::var(&venue.api_secret_env)
            .with_context(|| format!("missing env var {}", venue.api_secret_env))?;
        let limits = cfg.rate_limits.get(broker_id);
        brokers.insert(
            broker_id.clone(),
            Arc::new(RestBroker::new(RestBrokerConfig {
                broker_id: broker_id.clone(),
                base_url: venue.base_url.clone(),
                api_key,
                api_secret,
                rpc_deadline: Duration::from_millis(cfg.rpc_deadline_ms),
                retry: RetryPolicy::default(),
                rate_limit_capacity: limits.map(|l| l.capacity).unwrap_or(10),
                rate_limit_refill_per_sec: limits.map(|l| l.refill_per_sec).unwrap_or(5),
                event_poll_interval: Duration::from_secs(1),
            })),
        );
    }

    brokers
        .entry(cfg.default_broker.clone())
        .or_insert_with(|| Arc::new(PaperBroker::new(cfg.default_broker.clone())));

    for target in cfg.routing_rules.values() {
        brokers
            .entry(target.clone())
            .or_insert_with(|| Arc::new(PaperBroker::new(target.clone())));
    }

    Ok(brokers)
}

pub fn build_engine(
    cfg: CoreConfig,
    store: Arc<dyn Store>,
    brokers: BTreeMap<String, Arc<dyn BrokerAdapter>>,
    rules: &RuleFile,
) -> Arc<OrderCoordinator> {
    let engine = OrderCoordinator::new(
        cfg,
        store,
        brokers,
        FeeCalculator::new(rules.fee_rules.clone()),
        MarginCalculator::new(rules.margin_rules.clone()),
    );
    engine.register_instruments(rules.instruments.clone());
    engine.set_available_margin(Amount::from_rupees(rules.available_margin_rupees));
    Arc::new(engine)
}
