//! td-testkit — deterministic end-to-end harness.
//!
//! Bundles the memory store, the paper broker, and a fully wired
//! coordinator. Tests drive broker behavior through the paper venue's
//! scripting hooks and apply the resulting events synchronously via
//! [`Harness::pump`], so scenarios run without sleeps or timing races.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use td_broker::{BrokerAdapter, BrokerEvent};
use td_broker_paper::PaperBroker;
use td_config::CoreConfig;
use td_coordinator::OrderCoordinator;
use td_fees::FeeCalculator;
use td_margin::MarginCalculator;
use td_schemas::{
    Amount, AssetClass, Brokerage, FeeRule, Instrument, InstrumentKey, InstrumentType,
    MarginRule, MarginType, OrderIntent, OrderType, ProductType, Segment, Side, Validity,
};
use td_store::MemoryStore;

pub const BROKER: &str = "paper";

pub fn sbin() -> InstrumentKey {
    InstrumentKey::new("NSE", "SBIN")
}

pub fn nifty_fut() -> InstrumentKey {
    InstrumentKey::new("NSE", "NIFTYFUT")
}

fn instruments() -> Vec<Instrument> {
    vec![
        Instrument::equity("NSE", "SBIN"),
        Instrument {
            key: nifty_fut(),
            instrument_type: InstrumentType::Future,
            lot_size: 1,
            tick_size: Amount::from_paise(5),
            expiry: None,
            strike: None,
            option_kind: None,
            tradable: true,
        },
    ]
}

fn fee_rules() -> Vec<FeeRule> {
    let from = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let mut base = FeeRule {
        rule_id: Uuid::new_v4(),
        broker_id: BROKER.into(),
        asset_class: AssetClass::Equity,
        segment: Segment::Intraday,
        effective_from: from,
        effective_to: None,
        brokerage: Brokerage::Percent {
            pct_e4: 300, // 0.03 %
            cap: Amount::from_rupees(20),
        },
        stt_pct_e4: 250,
        exchange_txn_pct_e4: 345,
        gst_pct_e4: 180_000,
        sebi_pct_e4: 10,
        stamp_duty_pct_e4: 300,
    };
    let equity = base.clone();
    let mut delivery = base.clone();
    delivery.rule_id = Uuid::new_v4();
    delivery.segment = Segment::Delivery;
    delivery.stt_pct_e4 = 1_000;
    base.rule_id = Uuid::new_v4();
    base.asset_class = AssetClass::Derivative;
    base.segment = Segment::Futures;
    vec![equity, delivery, base]
}

fn margin_rules() -> Vec<MarginRule> {
    let from = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let rule = |margin_type, pct_e4| MarginRule {
        rule_id: Uuid::new_v4(),
        broker_id: BROKER.into(),
        instrument: nifty_fut(),
        margin_type,
        pct_e4,
        effective_from: from,
        effective_to: None,
    };
    vec![
        rule(MarginType::Span, 120_000),    // 12 %
        rule(MarginType::Exposure, 40_000), // 4 %
    ]
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        default_broker: BROKER.into(),
        routing_rules: BTreeMap::new(),
        reconciliation_schedule: Vec::new(),
        risk_defaults: Default::default(),
        intake_queue_capacity: 64,
        rpc_deadline_ms: 1_000,
        rate_limits: BTreeMap::new(),
        var: Default::default(),
    }
}

pub struct Harness {
    pub store: MemoryStore,
    pub broker: Arc<PaperBroker>,
    pub engine: Arc<OrderCoordinator>,
    events: mpsc::Receiver<BrokerEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let broker = Arc::new(PaperBroker::new(BROKER));
        let events = broker
            .subscribe_events()
            .await
            .expect("paper broker subscribe");

        let mut brokers: BTreeMap<String, Arc<dyn BrokerAdapter>> = BTreeMap::new();
        brokers.insert(BROKER.to_string(), broker.clone());

        let engine = Arc::new(OrderCoordinator::new(
            test_config(),
            Arc::new(store.clone()),
            brokers,
            FeeCalculator::new(fee_rules()),
            MarginCalculator::new(margin_rules()),
        ));
        engine.register_instruments(instruments());
        // Generous funding by default; margin scenarios override this.
        engine.set_available_margin(Amount::from_rupees(10_000_000));
        engine.set_equity(
            Amount::from_rupees(10_000_000),
            Amount::from_rupees(10_000_000),
        );

        Self {
            store,
            broker,
            engine,
            events,
        }
    }

    /// Apply every event the paper venue has emitted so far, in order.
    pub async fn pump(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            self.engine
                .handle_event(&ev)
                .await
                .expect("event application");
        }
    }

    pub fn limit_buy(&self, instrument: InstrumentKey, qty: i64, price_rupees: i64) -> OrderIntent {
        OrderIntent {
            idempotency_key: None,
            strategy_id: None,
            broker_id: None,
            instrument,
            side: Side::Buy,
            order_type: OrderType::Limit,
            validity: Validity::Day,
            product: ProductType::Mis,
            qty,
            price: Some(Amount::from_rupees(price_rupees)),
            trigger_price: None,
            iceberg_visible_qty: None,
            bracket: None,
        }
    }
}
