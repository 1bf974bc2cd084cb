//! Row ↔ record mapping.
//!
//! Enums cross the SQL boundary in their canonical serde spelling; the
//! round-trip goes through `serde_json::Value::String` so the table text
//! can never drift from the wire format.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use td_schemas::{
    Amount, FeeBreakdown, Fill, Holding, InstrumentKey, Order, OrderTransition, Position,
    PositionKey, ReconItem, ReconRun, RiskLimit,
};
use td_store::StoreError;

pub fn enum_to_str<T: Serialize>(v: &T) -> Result<String, StoreError> {
    match serde_json::to_value(v) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::backend(format!(
            "enum did not serialize to a string: {other}"
        ))),
        Err(e) => Err(StoreError::backend(e.to_string())),
    }
}

pub fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|e| StoreError::backend(format!("bad enum value {s:?}: {e}")))
}

pub fn sql_err(e: sqlx::Error) -> StoreError {
    StoreError::backend(e.to_string())
}

fn amount_opt(raw: Option<i64>) -> Option<Amount> {
    raw.map(Amount::from_units)
}

pub const ORDER_COLUMNS: &str = "order_id, idempotency_key, strategy_id, broker_id, exchange, \
     symbol, side, order_type, validity, product, qty, price, trigger_price, group_id, \
     parent_id, broker_order_id, state, filled_qty, avg_fill_price, reject_reason, \
     created_at, updated_at";

pub fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    Ok(Order {
        order_id: row.try_get("order_id").map_err(sql_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(sql_err)?,
        strategy_id: row.try_get("strategy_id").map_err(sql_err)?,
        broker_id: row.try_get("broker_id").map_err(sql_err)?,
        instrument: InstrumentKey::new(
            row.try_get::<String, _>("exchange").map_err(sql_err)?,
            row.try_get::<String, _>("symbol").map_err(sql_err)?,
        ),
        side: enum_from_str(&row.try_get::<String, _>("side").map_err(sql_err)?)?,
        order_type: enum_from_str(&row.try_get::<String, _>("order_type").map_err(sql_err)?)?,
        validity: enum_from_str(&row.try_get::<String, _>("validity").map_err(sql_err)?)?,
        product: enum_from_str(&row.try_get::<String, _>("product").map_err(sql_err)?)?,
        qty: row.try_get("qty").map_err(sql_err)?,
        price: amount_opt(row.try_get("price").map_err(sql_err)?),
        trigger_price: amount_opt(row.try_get("trigger_price").map_err(sql_err)?),
        group_id: row.try_get("group_id").map_err(sql_err)?,
        parent_id: row.try_get("parent_id").map_err(sql_err)?,
        broker_order_id: row.try_get("broker_order_id").map_err(sql_err)?,
        state: enum_from_str(&row.try_get::<String, _>("state").map_err(sql_err)?)?,
        filled_qty: row.try_get("filled_qty").map_err(sql_err)?,
        avg_fill_price: amount_opt(row.try_get("avg_fill_price").map_err(sql_err)?),
        reject_reason: row.try_get("reject_reason").map_err(sql_err)?,
        created_at: row.try_get("created_at").map_err(sql_err)?,
        updated_at: row.try_get("updated_at").map_err(sql_err)?,
    })
}

pub fn transition_from_row(row: &PgRow) -> Result<OrderTransition, StoreError> {
    Ok(OrderTransition {
        order_id: row.try_get("order_id").map_err(sql_err)?,
        from: enum_from_str(&row.try_get::<String, _>("from_state").map_err(sql_err)?)?,
        to: enum_from_str(&row.try_get::<String, _>("to_state").map_err(sql_err)?)?,
        at: row.try_get("at").map_err(sql_err)?,
        reason: row.try_get("reason").map_err(sql_err)?,
    })
}

pub fn fill_from_row(row: &PgRow) -> Result<Fill, StoreError> {
    Ok(Fill {
        fill_id: row.try_get("fill_id").map_err(sql_err)?,
        order_id: row.try_get("order_id").map_err(sql_err)?,
        broker_id: row.try_get("broker_id").map_err(sql_err)?,
        instrument: InstrumentKey::new(
            row.try_get::<String, _>("exchange").map_err(sql_err)?,
            row.try_get::<String, _>("symbol").map_err(sql_err)?,
        ),
        side: enum_from_str(&row.try_get::<String, _>("side").map_err(sql_err)?)?,
        product: enum_from_str(&row.try_get::<String, _>("product").map_err(sql_err)?)?,
        qty: row.try_get("qty").map_err(sql_err)?,
        price: Amount::from_units(row.try_get("price").map_err(sql_err)?),
        ts: row.try_get("ts").map_err(sql_err)?,
    })
}

pub fn fee_from_row(row: &PgRow) -> Result<FeeBreakdown, StoreError> {
    Ok(FeeBreakdown {
        order_id: row.try_get("order_id").map_err(sql_err)?,
        rule_id: row.try_get("rule_id").map_err(sql_err)?,
        order_value: Amount::from_units(row.try_get("order_value").map_err(sql_err)?),
        brokerage: Amount::from_units(row.try_get("brokerage").map_err(sql_err)?),
        stt: Amount::from_units(row.try_get("stt").map_err(sql_err)?),
        exchange_txn: Amount::from_units(row.try_get("exchange_txn").map_err(sql_err)?),
        gst: Amount::from_units(row.try_get("gst").map_err(sql_err)?),
        sebi: Amount::from_units(row.try_get("sebi").map_err(sql_err)?),
        stamp_duty: Amount::from_units(row.try_get("stamp_duty").map_err(sql_err)?),
        total_fees: Amount::from_units(row.try_get("total_fees").map_err(sql_err)?),
        computed_at: row.try_get("computed_at").map_err(sql_err)?,
    })
}

pub fn position_from_row(row: &PgRow) -> Result<Position, StoreError> {
    Ok(Position {
        key: PositionKey::new(
            row.try_get::<String, _>("broker_id").map_err(sql_err)?,
            InstrumentKey::new(
                row.try_get::<String, _>("exchange").map_err(sql_err)?,
                row.try_get::<String, _>("symbol").map_err(sql_err)?,
            ),
            enum_from_str(&row.try_get::<String, _>("product").map_err(sql_err)?)?,
        ),
        buy_qty: row.try_get("buy_qty").map_err(sql_err)?,
        buy_avg: Amount::from_units(row.try_get("buy_avg").map_err(sql_err)?),
        sell_qty: row.try_get("sell_qty").map_err(sql_err)?,
        sell_avg: Amount::from_units(row.try_get("sell_avg").map_err(sql_err)?),
        realized_pnl: Amount::from_units(row.try_get("realized_pnl").map_err(sql_err)?),
        unrealized_pnl: Amount::from_units(row.try_get("unrealized_pnl").map_err(sql_err)?),
    })
}

pub fn holding_from_row(row: &PgRow) -> Result<Holding, StoreError> {
    Ok(Holding {
        broker_id: row.try_get("broker_id").map_err(sql_err)?,
        instrument: InstrumentKey::new(
            row.try_get::<String, _>("exchange").map_err(sql_err)?,
            row.try_get::<String, _>("symbol").map_err(sql_err)?,
        ),
        qty: row.try_get("qty").map_err(sql_err)?,
        avg_cost: Amount::from_units(row.try_get("avg_cost").map_err(sql_err)?),
        last_traded_price: Amount::from_units(row.try_get("ltp").map_err(sql_err)?),
    })
}

pub fn risk_limit_from_row(row: &PgRow) -> Result<RiskLimit, StoreError> {
    let scope: Value = row.try_get("scope").map_err(sql_err)?;
    Ok(RiskLimit {
        limit_id: row.try_get("limit_id").map_err(sql_err)?,
        scope: serde_json::from_value(scope)
            .map_err(|e| StoreError::backend(format!("bad limit scope: {e}")))?,
        kind: enum_from_str(&row.try_get::<String, _>("kind").map_err(sql_err)?)?,
        limit_value: row.try_get("limit_value").map_err(sql_err)?,
        current_value: row.try_get("current_value").map_err(sql_err)?,
        is_active: row.try_get("is_active").map_err(sql_err)?,
    })
}

pub fn recon_run_from_row(row: &PgRow) -> Result<ReconRun, StoreError> {
    Ok(ReconRun {
        run_id: row.try_get("run_id").map_err(sql_err)?,
        broker_id: row.try_get("broker_id").map_err(sql_err)?,
        scope: enum_from_str(&row.try_get::<String, _>("scope").map_err(sql_err)?)?,
        status: enum_from_str(&row.try_get::<String, _>("status").map_err(sql_err)?)?,
        started_at: row.try_get("started_at").map_err(sql_err)?,
        finished_at: row.try_get("finished_at").map_err(sql_err)?,
        items_checked: row.try_get::<i64, _>("items_checked").map_err(sql_err)? as u64,
        mismatches_found: row.try_get::<i64, _>("mismatches_found").map_err(sql_err)? as u64,
    })
}

pub fn recon_item_from_row(row: &PgRow) -> Result<ReconItem, StoreError> {
    Ok(ReconItem {
        run_id: row.try_get("run_id").map_err(sql_err)?,
        item_type: enum_from_str(&row.try_get::<String, _>("item_type").map_err(sql_err)?)?,
        item_id: row.try_get("item_id").map_err(sql_err)?,
        broker_ref_id: row.try_get("broker_ref_id").map_err(sql_err)?,
        system_snapshot: row.try_get("system_snapshot").map_err(sql_err)?,
        broker_snapshot: row.try_get("broker_snapshot").map_err(sql_err)?,
        discrepancy: row.try_get("discrepancy").map_err(sql_err)?,
        status: enum_from_str(&row.try_get::<String, _>("status").map_err(sql_err)?)?,
    })
}
