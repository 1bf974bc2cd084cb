//! Pure snapshot comparison.
//!
//! Local truth comes from the store, broker truth from the adapter's fetch
//! endpoints. The diff is keyed `(item_type, broker_ref_id | item_id)` and
//! classified:
//! - present in both, attributes equal → skip
//! - present in both, attributes differ → mismatch with a JSON field diff
//! - present locally, missing at broker → mismatch (ghost)
//! - missing locally, present at broker → mismatch (orphan)

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use td_broker::{BrokerHoldingSnapshot, BrokerOrderSnapshot, BrokerPositionSnapshot};
use td_schemas::{
    Holding, Order, Position, ReconItem, ReconItemStatus, ReconItemType,
};
use td_store::LocalSnapshots;

/// Output of one scope's comparison.
#[derive(Clone, Debug, Default)]
pub struct ScopeDiff {
    pub items_checked: u64,
    pub mismatches: Vec<ReconItem>,
}

fn mismatch(
    run_id: Uuid,
    item_type: ReconItemType,
    item_id: Option<String>,
    broker_ref_id: Option<String>,
    system: Option<Value>,
    broker: Option<Value>,
    discrepancy: Value,
) -> ReconItem {
    ReconItem {
        run_id,
        item_type,
        item_id,
        broker_ref_id,
        system_snapshot: system,
        broker_snapshot: broker,
        discrepancy,
        status: ReconItemStatus::Mismatch,
    }
}

fn field_diff(fields: &[(&str, Value, Value)]) -> Value {
    let mut out = Map::new();
    for (name, local, broker) in fields {
        if local != broker {
            out.insert(
                (*name).to_string(),
                json!({ "local": local, "broker": broker }),
            );
        }
    }
    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Only orders the broker should know about participate: local rows that
/// never reached the venue (PENDING/QUEUED or no broker id) are not ghosts.
fn broker_visible(order: &Order) -> bool {
    order.broker_order_id.is_some() && (order.state.is_working() || order.state.is_terminal())
}

pub fn diff_orders(
    run_id: Uuid,
    local: &[Order],
    broker: &[BrokerOrderSnapshot],
) -> ScopeDiff {
    let broker_by_id: BTreeMap<&str, &BrokerOrderSnapshot> = broker
        .iter()
        .map(|b| (b.broker_order_id.as_str(), b))
        .collect();

    let mut seen: Vec<&str> = Vec::new();
    let mut out = ScopeDiff::default();

    for o in local.iter().filter(|o| broker_visible(o)) {
        out.items_checked += 1;
        let bid = match &o.broker_order_id {
            Some(b) => b.as_str(),
            None => continue,
        };
        match broker_by_id.get(bid) {
            Some(b) => {
                seen.push(bid);
                let diff = field_diff(&[
                    ("state", json!(o.state), json!(b.state)),
                    ("side", json!(o.side), json!(b.side)),
                    ("qty", json!(o.qty), json!(b.qty)),
                    ("filled_qty", json!(o.filled_qty), json!(b.filled_qty)),
                    (
                        "avg_price",
                        json!(o.avg_fill_price),
                        json!(b.avg_fill_price),
                    ),
                ]);
                if !diff.as_object().map(|m| m.is_empty()).unwrap_or(true) {
                    out.mismatches.push(mismatch(
                        run_id,
                        ReconItemType::Order,
                        Some(o.order_id.to_string()),
                        Some(bid.to_string()),
                        Some(json!(o)),
                        Some(json!(b)),
                        diff,
                    ));
                }
            }
            // Ghost: we think it lives at the broker, broker has no row.
            // Terminal local rows are allowed to age out of the venue's
            // order book; only working orders count as ghosts.
            None if o.state.is_working() => {
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Order,
                    Some(o.order_id.to_string()),
                    Some(bid.to_string()),
                    Some(json!(o)),
                    None,
                    json!({ "missing_at": "broker" }),
                ));
            }
            None => {}
        }
    }

    // Orphans: broker rows with no local counterpart.
    for b in broker {
        if !seen.contains(&b.broker_order_id.as_str()) {
            let known_locally = local
                .iter()
                .any(|o| o.broker_order_id.as_deref() == Some(b.broker_order_id.as_str()));
            if !known_locally {
                out.items_checked += 1;
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Order,
                    None,
                    Some(b.broker_order_id.clone()),
                    None,
                    Some(json!(b)),
                    json!({ "missing_at": "local" }),
                ));
            }
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

pub fn diff_positions(
    run_id: Uuid,
    local: &[Position],
    broker: &[BrokerPositionSnapshot],
) -> ScopeDiff {
    let mut out = ScopeDiff::default();

    let local_by_key: BTreeMap<String, &Position> = local
        .iter()
        .map(|p| (format!("{}|{:?}", p.key.instrument, p.key.product), p))
        .collect();
    let broker_by_key: BTreeMap<String, &BrokerPositionSnapshot> = broker
        .iter()
        .map(|b| (format!("{}|{:?}", b.instrument, b.product), b))
        .collect();

    let mut keys: Vec<&String> = local_by_key.keys().chain(broker_by_key.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        out.items_checked += 1;
        match (local_by_key.get(key), broker_by_key.get(key)) {
            (Some(l), Some(b)) => {
                let diff = field_diff(&[
                    ("net_qty", json!(l.net_qty()), json!(b.net_qty)),
                ]);
                if !diff.as_object().map(|m| m.is_empty()).unwrap_or(true) {
                    out.mismatches.push(mismatch(
                        run_id,
                        ReconItemType::Position,
                        Some(key.clone()),
                        None,
                        Some(json!(l)),
                        Some(json!(b)),
                        diff,
                    ));
                }
            }
            (Some(l), None) if !l.is_flat() => {
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Position,
                    Some(key.clone()),
                    None,
                    Some(json!(l)),
                    None,
                    json!({ "missing_at": "broker" }),
                ));
            }
            (None, Some(b)) if b.net_qty != 0 => {
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Position,
                    Some(key.clone()),
                    None,
                    None,
                    Some(json!(b)),
                    json!({ "missing_at": "local" }),
                ));
            }
            _ => {}
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

pub fn diff_holdings(
    run_id: Uuid,
    local: &[Holding],
    broker: &[BrokerHoldingSnapshot],
) -> ScopeDiff {
    let mut out = ScopeDiff::default();

    let local_by_key: BTreeMap<String, &Holding> = local
        .iter()
        .map(|h| (h.instrument.to_string(), h))
        .collect();
    let broker_by_key: BTreeMap<String, &BrokerHoldingSnapshot> = broker
        .iter()
        .map(|b| (b.instrument.to_string(), b))
        .collect();

    let mut keys: Vec<&String> = local_by_key.keys().chain(broker_by_key.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        out.items_checked += 1;
        match (local_by_key.get(key), broker_by_key.get(key)) {
            (Some(l), Some(b)) => {
                let diff = field_diff(&[
                    ("qty", json!(l.qty), json!(b.qty)),
                    ("avg_cost", json!(l.avg_cost), json!(b.avg_cost)),
                ]);
                if !diff.as_object().map(|m| m.is_empty()).unwrap_or(true) {
                    out.mismatches.push(mismatch(
                        run_id,
                        ReconItemType::Holding,
                        Some(key.clone()),
                        None,
                        Some(json!(l)),
                        Some(json!(b)),
                        diff,
                    ));
                }
            }
            (Some(l), None) if l.qty > 0 => {
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Holding,
                    Some(key.clone()),
                    None,
                    Some(json!(l)),
                    None,
                    json!({ "missing_at": "broker" }),
                ));
            }
            (None, Some(b)) if b.qty > 0 => {
                out.mismatches.push(mismatch(
                    run_id,
                    ReconItemType::Holding,
                    Some(key.clone()),
                    None,
                    None,
                    Some(json!(b)),
                    json!({ "missing_at": "local" }),
                ));
            }
            _ => {}
        }
    }

    out
}

/// Diff one broker's full local view against the fetched broker snapshots
/// for the requested concrete scope.
pub fn diff_scope(
    run_id: Uuid,
    scope: td_schemas::ReconScope,
    local: &LocalSnapshots,
    broker_orders: &[BrokerOrderSnapshot],
    broker_positions: &[BrokerPositionSnapshot],
    broker_holdings: &[BrokerHoldingSnapshot],
) -> ScopeDiff {
    use td_schemas::ReconScope;
    match scope {
        ReconScope::Orders => diff_orders(run_id, &local.orders, broker_orders),
        ReconScope::Positions => diff_positions(run_id, &local.positions, broker_positions),
        ReconScope::Holdings => diff_holdings(run_id, &local.holdings, broker_holdings),
        ReconScope::All => {
            let mut out = diff_orders(run_id, &local.orders, broker_orders);
            let p = diff_positions(run_id, &local.positions, broker_positions);
            let h = diff_holdings(run_id, &local.holdings, broker_holdings);
            out.items_checked += p.items_checked + h.items_checked;
            out.mismatches.extend(p.mismatches);
            out.mismatches.extend(h.mismatches);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use td_schemas::{
        Amount, InstrumentKey, OrderState, OrderType, PositionKey, ProductType, Side, Validity,
    };

    fn local_order(state: OrderState, broker_id: Option<&str>) -> Order {
        let now = Utc::now();
        Order {
            order_id: Uuid::new_v4(),
            idempotency_key: None,
            strategy_id: None,
            broker_id: "paper".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            validity: Validity::Day,
            product: ProductType::Mis,
            qty: 100,
            price: Some(Amount::from_rupees(500)),
            trigger_price: None,
            group_id: None,
            parent_id: None,
            broker_order_id: broker_id.map(String::from),
            state,
            filled_qty: 0,
            avg_fill_price: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn broker_order(id: &str, state: OrderState, filled: i64) -> BrokerOrderSnapshot {
        BrokerOrderSnapshot {
            broker_order_id: id.into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            side: Side::Buy,
            state,
            qty: 100,
            filled_qty: filled,
            avg_fill_price: (filled > 0).then(|| Amount::from_rupees(101)),
            price: Some(Amount::from_rupees(500)),
        }
    }

    #[test]
    fn equal_rows_produce_no_items() {
        let run = Uuid::new_v4();
        let local = vec![local_order(OrderState::Submitted, Some("B1"))];
        let broker = vec![broker_order("B1", OrderState::Submitted, 0)];
        let d = diff_orders(run, &local, &broker);
        assert_eq!(d.items_checked, 1);
        assert!(d.mismatches.is_empty());
    }

    #[test]
    fn state_drift_records_json_field_diff() {
        let run = Uuid::new_v4();
        let local = vec![local_order(OrderState::Submitted, Some("B2"))];
        let broker = vec![broker_order("B2", OrderState::Filled, 100)];
        let d = diff_orders(run, &local, &broker);
        assert_eq!(d.mismatches.len(), 1);

        let disc = &d.mismatches[0].discrepancy;
        assert_eq!(disc["state"]["local"], "SUBMITTED");
        assert_eq!(disc["state"]["broker"], "FILLED");
        assert!(disc.get("avg_price").is_some());
        assert_eq!(d.mismatches[0].status, ReconItemStatus::Mismatch);
    }

    #[test]
    fn working_order_missing_at_broker_is_ghost() {
        let run = Uuid::new_v4();
        let local = vec![local_order(OrderState::Submitted, Some("B3"))];
        let d = diff_orders(run, &local, &[]);
        assert_eq!(d.mismatches.len(), 1);
        assert_eq!(d.mismatches[0].discrepancy["missing_at"], "broker");
    }

    #[test]
    fn terminal_order_aged_out_of_venue_book_is_fine() {
        let run = Uuid::new_v4();
        let local = vec![local_order(OrderState::Filled, Some("B4"))];
        let d = diff_orders(run, &local, &[]);
        assert!(d.mismatches.is_empty());
    }

    #[test]
    fn unknown_broker_order_is_orphan() {
        let run = Uuid::new_v4();
        let d = diff_orders(run, &[], &[broker_order("B9", OrderState::Submitted, 0)]);
        assert_eq!(d.mismatches.len(), 1);
        assert_eq!(d.mismatches[0].discrepancy["missing_at"], "local");
        assert!(d.mismatches[0].item_id.is_none());
    }

    #[test]
    fn local_only_pending_order_is_not_a_ghost() {
        let run = Uuid::new_v4();
        let local = vec![local_order(OrderState::Pending, None)];
        let d = diff_orders(run, &local, &[]);
        assert!(d.mismatches.is_empty());
        assert_eq!(d.items_checked, 0);
    }

    #[test]
    fn position_qty_drift_detected() {
        let run = Uuid::new_v4();
        let key = PositionKey::new("paper", InstrumentKey::new("NSE", "SBIN"), ProductType::Mis);
        let mut pos = Position::flat(key);
        pos.buy_qty = 70;
        let broker = vec![BrokerPositionSnapshot {
            instrument: InstrumentKey::new("NSE", "SBIN"),
            product: ProductType::Mis,
            net_qty: 100,
            avg_price: Amount::from_rupees(500),
        }];
        let d = diff_positions(run, &[pos], &broker);
        assert_eq!(d.mismatches.len(), 1);
        assert_eq!(d.mismatches[0].discrepancy["net_qty"]["local"], 70);
        assert_eq!(d.mismatches[0].discrepancy["net_qty"]["broker"], 100);
    }

    #[test]
    fn flat_local_position_missing_at_broker_is_fine() {
        let run = Uuid::new_v4();
        let key = PositionKey::new("paper", InstrumentKey::new("NSE", "SBIN"), ProductType::Mis);
        let pos = Position::flat(key);
        let d = diff_positions(run, &[pos], &[]);
        assert!(d.mismatches.is_empty());
    }

    #[test]
    fn holding_cost_drift_detected() {
        let run = Uuid::new_v4();
        let local = vec![Holding {
            broker_id: "paper".into(),
            instrument: InstrumentKey::new("NSE", "SBIN"),
            qty: 10,
            avg_cost: Amount::from_rupees(500),
            last_traded_price: Amount::from_rupees(510),
        }];
        let broker = vec![BrokerHoldingSnapshot {
            instrument: InstrumentKey::new("NSE", "SBIN"),
            qty: 10,
            avg_cost: Amount::from_rupees(490),
        }];
        let d = diff_holdings(run, &local, &broker);
        assert_eq!(d.mismatches.len(), 1);
        assert!(d.mismatches[0].discrepancy.get("avg_cost").is_some());
        assert!(d.mismatches[0].discrepancy.get("qty").is_none());
    }
}
