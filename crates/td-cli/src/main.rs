use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use td_coordinator::{spawn_event_pipeline, SubmitError};
use td_schemas::{
    Amount, BracketSpec, InstrumentKey, OrderIntent, OrderType, ProductType, ReconScope, Side,
    Validity,
};
use td_store::Store;

mod wiring;

use wiring::{build_brokers, build_engine, load_rule_file};

#[derive(Parser)]
#[command(name = "td")]
#[command(about = "Trade-Desk core CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> overrides).
    #[arg(long = "config", global = true, default_value = "config/base.yaml")]
    config_paths: Vec<String>,

    /// Instrument/fee/margin rule file.
    #[arg(long, global = true, default_value = "config/rules.yaml")]
    rules: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash,

    /// Order operations
    Order {
        #[command(subcommand)]
        cmd: OrderCmd,
    },

    /// List positions known to the store for one broker
    Positions {
        #[arg(long)]
        broker: String,
    },

    /// Reload the instrument master from the rule file and print a summary
    RefreshInstruments,

    /// Run one reconciliation pass
    Recon {
        #[arg(long)]
        broker: String,
        #[arg(long, default_value = "all")]
        scope: String,
    },

    /// Start the broker event consumer until Ctrl-C
    Consume {
        #[arg(long)]
        broker: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OrderCmd {
    /// Submit one order intent
    Submit {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        side: String,
        #[arg(long = "type", default_value = "limit")]
        order_type: String,
        #[arg(long, default_value = "day")]
        validity: String,
        #[arg(long, default_value = "mis")]
        product: String,
        #[arg(long)]
        qty: i64,
        /// Price in paise (two-decimal money).
        #[arg(long)]
        price_paise: Option<i64>,
        #[arg(long)]
        trigger_paise: Option<i64>,
        #[arg(long)]
        broker: Option<String>,
        #[arg(long)]
        strategy: Option<String>,
        /// Idempotency key; retries with the same key return the same order.
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        iceberg_visible: Option<i64>,
        #[arg(long)]
        bracket_target_paise: Option<i64>,
        #[arg(long)]
        bracket_stop_paise: Option<i64>,
    },

    /// Request cancellation of an order
    Cancel {
        order_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev-time .env bootstrap; ignored when absent.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_refs: Vec<&str> = cli.config_paths.iter().map(|s| s.as_str()).collect();

    match cli.cmd {
        Commands::Db { cmd } => {
            let store = td_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    // Connectivity is proven by the connect itself; probe a
                    // known table for schema presence.
                    let ok = store.load_risk_limits().await.is_ok();
                    println!("db_ok=true schema_ok={ok}");
                }
                DbCmd::Migrate => {
                    store.migrate().await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash => {
            let loaded = td_config::load_layered_yaml(&config_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Order { cmd } => {
            let (cfg, _) = td_config::load_core_config(&config_refs)?;
            let rules = load_rule_file(&cli.rules)?;
            let store: Arc<dyn Store> = Arc::new(td_db::connect_from_env().await?);
            let brokers = build_brokers(&cfg, &rules)?;
            let engine = build_engine(cfg, store, brokers, &rules);

            match cmd {
                OrderCmd::Submit {
                    exchange,
                    symbol,
                    side,
                    order_type,
                    validity,
                    product,
                    qty,
                    price_paise,
                    trigger_paise,
                    broker,
                    strategy,
                    key,
                    iceberg_visible,
                    bracket_target_paise,
                    bracket_stop_paise,
                } => {
                    let bracket = match (bracket_target_paise, bracket_stop_paise) {
                        (Some(t), Some(s)) => Some(BracketSpec {
                            target_price: Amount::from_paise(t),
                            stop_trigger: Amount::from_paise(s),
                        }),
                        (None, None) => None,
                        _ => bail!("bracket requires both --bracket-target-paise and --bracket-stop-paise"),
                    };

                    let intent = OrderIntent {
                        idempotency_key: key,
                        strategy_id: strategy,
                        broker_id: broker,
                        instrument: InstrumentKey::new(exchange, symbol),
                        side: parse_side(&side)?,
                        order_type: parse_order_type(&order_type)?,
                        validity: parse_validity(&validity)?,
                        product: parse_product(&product)?,
                        qty,
                        price: price_paise.map(Amount::from_paise),
                        trigger_price: trigger_paise.map(Amount::from_paise),
                        iceberg_visible_qty: iceberg_visible,
                        bracket,
                    };

                    match engine.submit(intent).await {
                        Ok(resp) => {
                            println!("order_id={}", resp.order_id);
                            println!("existing={}", resp.existing);
                            println!("state={}", resp.state);
                            for c in resp.child_ids {
                                println!("child_id={c}");
                            }
                        }
                        Err(SubmitError::Validation { order_id, reasons }) => {
                            println!("order_id={order_id}");
                            println!("rejected=VALIDATION");
                            for r in reasons {
                                println!("reason={r}");
                            }
                        }
                        Err(SubmitError::MarginShortfall {
                            order_id,
                            shortfall,
                            ..
                        }) => {
                            println!("order_id={order_id}");
                            println!("rejected=MARGIN_SHORTFALL shortfall={shortfall}");
                        }
                        Err(SubmitError::RiskViolation {
                            order_id,
                            violations,
                        }) => {
                            println!("order_id={order_id}");
                            println!(
                                "rejected=RISK_VIOLATION violations={}",
                                serde_json::to_string(&violations)?
                            );
                        }
                        Err(e) => return Err(e).context("submit failed"),
                    }
                }

                OrderCmd::Cancel { order_id } => {
                    engine.cancel(order_id).await?;
                    println!("cancel_requested={order_id}");
                }
            }
        }

        Commands::Positions { broker } => {
            let store = td_db::connect_from_env().await?;
            let snaps = store.load_local_snapshots(&broker).await?;
            for p in snaps.positions {
                println!(
                    "{} {} net_qty={} buy_avg={} sell_avg={} realized={}",
                    p.key.instrument,
                    format!("{:?}", p.key.product).to_uppercase(),
                    p.net_qty(),
                    p.buy_avg,
                    p.sell_avg,
                    p.realized_pnl
                );
            }
            for h in snaps.holdings {
                println!(
                    "{} HOLDING qty={} avg_cost={} value={}",
                    h.instrument,
                    h.qty,
                    h.avg_cost,
                    h.current_value()
                );
            }
        }

        Commands::RefreshInstruments => {
            let rules = load_rule_file(&cli.rules)?;
            println!("instruments_loaded={}", rules.instruments.len());
            for i in &rules.instruments {
                println!(
                    "{} type={:?} lot={} tick={}",
                    i.key, i.instrument_type, i.lot_size, i.tick_size
                );
            }
        }

        Commands::Recon { broker, scope } => {
            let (cfg, _) = td_config::load_core_config(&config_refs)?;
            let rules = load_rule_file(&cli.rules)?;
            let store = td_db::connect_from_env().await?;
            let brokers = build_brokers(&cfg, &rules)?;
            let adapter = brokers
                .get(&broker)
                .with_context(|| format!("unknown broker {broker}"))?;

            let scope = parse_scope(&scope)?;
            let run =
                td_reconcile::run_reconciliation(&store, adapter.as_ref(), scope, Utc::now())
                    .await?;
            println!("run_id={}", run.run_id);
            println!("status={:?}", run.status);
            println!(
                "items_checked={} mismatches_found={}",
                run.items_checked, run.mismatches_found
            );
        }

        Commands::Consume { broker, workers } => {
            let (cfg, _) = td_config::load_core_config(&config_refs)?;
            let rules = load_rule_file(&cli.rules)?;
            let store: Arc<dyn Store> = Arc::new(td_db::connect_from_env().await?);
            let brokers = build_brokers(&cfg, &rules)?;
            let adapter = brokers
                .get(&broker)
                .with_context(|| format!("unknown broker {broker}"))?
                .clone();
            let engine = build_engine(cfg, store, brokers, &rules);

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let pipeline = spawn_event_pipeline(engine, adapter, workers, shutdown_rx)
                .await
                .map_err(|e| anyhow::anyhow!("subscribe failed: {e}"))?;

            println!("consuming events for {broker}; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            let _ = pipeline.await;
        }
    }

    Ok(())
}

fn parse_side(s: &str) -> Result<Side> {
    match s.to_uppercase().as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => bail!("invalid side {other} (BUY|SELL)"),
    }
}

fn parse_order_type(s: &str) -> Result<OrderType> {
    match s.to_uppercase().as_str() {
        "LIMIT" => Ok(OrderType::Limit),
        "MARKET" => Ok(OrderType::Market),
        "STOP_LOSS" | "SL" => Ok(OrderType::StopLoss),
        "STOP_LOSS_MARKET" | "SLM" => Ok(OrderType::StopLossMarket),
        other => bail!("invalid order type {other}"),
    }
}

fn parse_validity(s: &str) -> Result<Validity> {
    match s.to_uppercase().as_str() {
        "DAY" => Ok(Validity::Day),
        "IOC" => Ok(Validity::Ioc),
        other => bail!("invalid validity {other} (DAY|IOC)"),
    }
}

fn parse_product(s: &str) -> Result<ProductType> {
    match s.to_uppercase().as_str() {
        "MIS" => Ok(ProductType::Mis),
        "CNC" => Ok(ProductType::Cnc),
        "NRML" => Ok(ProductType::Nrml),
        other => bail!("invalid product {other} (MIS|CNC|NRML)"),
    }
}

fn parse_scope(s: &str) -> Result<ReconScope> {
    match s.to_lowercase().as_str() {
        "orders" => Ok(ReconScope::Orders),
        "positions" => Ok(ReconScope::Positions),
        "holdings" => Ok(ReconScope::Holdings),
        "all" => Ok(ReconScope::All),
        other => bail!("invalid scope {other} (orders|positions|holdings|all)"),
    }
}
