//! td-db — Postgres implementation of the persistence port.
//!
//! Runtime-checked sqlx queries over a pooled connection; embedded
//! migrations under `./migrations`. Connection URL comes from
//! `TD_DATABASE_URL`.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use td_schemas::{
    FeeBreakdown, Fill, Order, OrderTransition, ReconItem, ReconRun, RiskLimit,
};
use td_store::{
    IdempotencyStore, LocalSnapshots, OrderFilter, Reservation, Store, StoreError, StoreTx,
};

mod rows;
mod tx;

use rows::{
    fee_from_row, fill_from_row, holding_from_row, order_from_row, position_from_row,
    recon_item_from_row, recon_run_from_row, risk_limit_from_row, sql_err, transition_from_row,
    ORDER_COLUMNS,
};
use tx::PgTx;

pub const ENV_DB_URL: &str = "TD_DATABASE_URL";

/// Connect to Postgres using TD_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgStore, StoreError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| StoreError::backend(format!("missing env var {ENV_DB_URL}")))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .map_err(sql_err)?;

    Ok(PgStore { pool })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::backend(format!("db migrate failed: {e}")))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(sql_err)?;
        Ok(Box::new(PgTx::new(tx)))
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::not_found(format!("order {order_id}")))?;
        order_from_row(&row)
    }

    async fn load_order_by_broker_id(
        &self,
        broker_id: &str,
        broker_order_id: &str,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where broker_id = $1 and broker_order_id = $2"
        ))
        .bind(broker_id)
        .bind(broker_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        .ok_or_else(|| {
            StoreError::not_found(format!("broker order {broker_id}/{broker_order_id}"))
        })?;
        order_from_row(&row)
    }

    async fn load_orders_by_filter(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        // Filtering in SQL would need a dynamic query builder; order counts
        // here are small, so fetch per broker (the common axis) and filter
        // in process with the same predicate the memory store uses.
        let rows = match &filter.broker_id {
            Some(b) => sqlx::query(&format!(
                "select {ORDER_COLUMNS} from orders where broker_id = $1 order by created_at"
            ))
            .bind(b)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?,
            None => sqlx::query(&format!(
                "select {ORDER_COLUMNS} from orders order by created_at"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?,
        };

        let mut out = Vec::new();
        for row in &rows {
            let order = order_from_row(row)?;
            if filter.matches(&order) {
                out.push(order);
            }
        }
        Ok(out)
    }

    async fn load_transitions(&self, order_id: Uuid) -> Result<Vec<OrderTransition>, StoreError> {
        let rows = sqlx::query(
            "select order_id, from_state, to_state, at, reason \
             from order_transitions where order_id = $1 order by id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn load_fills(&self, order_id: Uuid) -> Result<Vec<Fill>, StoreError> {
        let rows = sqlx::query(
            "select fill_id, order_id, broker_id, exchange, symbol, side, product, qty, price, ts \
             from fills where order_id = $1 order by ts",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        rows.iter().map(fill_from_row).collect()
    }

    async fn load_fee_breakdown(
        &self,
        order_id: Uuid,
    ) -> Result<Option<FeeBreakdown>, StoreError> {
        let row = sqlx::query(
            "select order_id, rule_id, order_value, brokerage, stt, exchange_txn, gst, sebi, \
             stamp_duty, total_fees, computed_at from fee_breakdowns where order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;
        row.as_ref().map(fee_from_row).transpose()
    }

    async fn load_risk_limits(&self) -> Result<Vec<RiskLimit>, StoreError> {
        let rows = sqlx::query(
            "select limit_id, scope, kind, limit_value, current_value, is_active \
             from risk_limits where is_active",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        rows.iter().map(risk_limit_from_row).collect()
    }

    async fn load_local_snapshots(&self, broker_id: &str) -> Result<LocalSnapshots, StoreError> {
        let order_rows = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where broker_id = $1"
        ))
        .bind(broker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let position_rows = sqlx::query(
            "select broker_id, exchange, symbol, product, buy_qty, buy_avg, sell_qty, sell_avg, \
             realized_pnl, unrealized_pnl from positions where broker_id = $1",
        )
        .bind(broker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        let holding_rows = sqlx::query(
            "select broker_id, exchange, symbol, qty, avg_cost, ltp \
             from holdings where broker_id = $1",
        )
        .bind(broker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(LocalSnapshots {
            orders: order_rows
                .iter()
                .map(order_from_row)
                .collect::<Result<_, _>>()?,
            positions: position_rows
                .iter()
                .map(position_from_row)
                .collect::<Result<_, _>>()?,
            holdings: holding_rows
                .iter()
                .map(holding_from_row)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn load_recon_run(&self, run_id: Uuid) -> Result<ReconRun, StoreError> {
        let row = sqlx::query(
            "select run_id, broker_id, scope, status, started_at, finished_at, items_checked, \
             mismatches_found from recon_runs where run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::not_found(format!("recon run {run_id}")))?;
        recon_run_from_row(&row)
    }

    async fn load_recon_items(&self, run_id: Uuid) -> Result<Vec<ReconItem>, StoreError> {
        let rows = sqlx::query(
            "select run_id, item_type, item_id, broker_ref_id, system_snapshot, broker_snapshot, \
             discrepancy, status from recon_items where run_id = $1 order by id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;
        rows.iter().map(recon_item_from_row).collect()
    }

    async fn try_acquire_lock(&self, key: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("insert into engine_locks (key) values ($1) on conflict do nothing")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("delete from engine_locks where key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn reserve(&self, key: &str, order_id: Uuid) -> Result<Reservation, StoreError> {
        let res = sqlx::query(
            "insert into idempotency_keys (key, order_id) values ($1, $2) \
             on conflict (key) do nothing",
        )
        .bind(key)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        if res.rows_affected() == 1 {
            return Ok(Reservation::Fresh);
        }

        let (existing,): (Uuid,) =
            sqlx::query_as("select order_id from idempotency_keys where key = $1")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(sql_err)?;
        Ok(Reservation::Existing(existing))
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("delete from idempotency_keys where key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}
