//! Transaction wrapper implementing the store-port transaction contract.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use td_schemas::{
    FeeBreakdown, Fill, Holding, Order, OrderTransition, Position, ReconItem, ReconRun,
};
use td_store::{Reservation, StoreError, StoreTx};

use crate::rows::{enum_to_str, order_from_row, sql_err, ORDER_COLUMNS};

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

fn units(a: td_schemas::Amount) -> i64 {
    a.units()
}

fn units_opt(a: Option<td_schemas::Amount>) -> Option<i64> {
    a.map(|v| v.units())
}

#[async_trait]
impl StoreTx for PgTx {
    async fn upsert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into orders (
              order_id, idempotency_key, strategy_id, broker_id, exchange, symbol,
              side, order_type, validity, product, qty, price, trigger_price,
              group_id, parent_id, broker_order_id, state, filled_qty,
              avg_fill_price, reject_reason, created_at, updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
              $14, $15, $16, $17, $18, $19, $20, $21, $22
            )
            on conflict (order_id) do update set
              broker_order_id = excluded.broker_order_id,
              state = excluded.state,
              filled_qty = excluded.filled_qty,
              avg_fill_price = excluded.avg_fill_price,
              reject_reason = excluded.reject_reason,
              qty = excluded.qty,
              price = excluded.price,
              trigger_price = excluded.trigger_price,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(order.order_id)
        .bind(&order.idempotency_key)
        .bind(&order.strategy_id)
        .bind(&order.broker_id)
        .bind(&order.instrument.exchange)
        .bind(&order.instrument.symbol)
        .bind(enum_to_str(&order.side)?)
        .bind(enum_to_str(&order.order_type)?)
        .bind(enum_to_str(&order.validity)?)
        .bind(enum_to_str(&order.product)?)
        .bind(order.qty)
        .bind(units_opt(order.price))
        .bind(units_opt(order.trigger_price))
        .bind(order.group_id)
        .bind(order.parent_id)
        .bind(&order.broker_order_id)
        .bind(enum_to_str(&order.state)?)
        .bind(order.filled_qty)
        .bind(units_opt(order.avg_fill_price))
        .bind(&order.reject_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn load_order(&mut self, order_id: Uuid) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::not_found(format!("order {order_id}")))?;
        order_from_row(&row)
    }

    async fn record_transition(&mut self, t: &OrderTransition) -> Result<(), StoreError> {
        sqlx::query(
            "insert into order_transitions (order_id, from_state, to_state, at, reason) \
             values ($1, $2, $3, $4, $5)",
        )
        .bind(t.order_id)
        .bind(enum_to_str(&t.from)?)
        .bind(enum_to_str(&t.to)?)
        .bind(t.at)
        .bind(&t.reason)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn append_fill(&mut self, fill: &Fill) -> Result<(), StoreError> {
        // Re-delivered fills hit the (order_id, fill_id) key and are no-ops.
        sqlx::query(
            "insert into fills (fill_id, order_id, broker_id, exchange, symbol, side, product, \
             qty, price, ts) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             on conflict (order_id, fill_id) do nothing",
        )
        .bind(&fill.fill_id)
        .bind(fill.order_id)
        .bind(&fill.broker_id)
        .bind(&fill.instrument.exchange)
        .bind(&fill.instrument.symbol)
        .bind(enum_to_str(&fill.side)?)
        .bind(enum_to_str(&fill.product)?)
        .bind(fill.qty)
        .bind(units(fill.price))
        .bind(fill.ts)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn write_fee_breakdown(&mut self, fees: &FeeBreakdown) -> Result<(), StoreError> {
        sqlx::query(
            "insert into fee_breakdowns (order_id, rule_id, order_value, brokerage, stt, \
             exchange_txn, gst, sebi, stamp_duty, total_fees, computed_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             on conflict (order_id) do nothing",
        )
        .bind(fees.order_id)
        .bind(fees.rule_id)
        .bind(units(fees.order_value))
        .bind(units(fees.brokerage))
        .bind(units(fees.stt))
        .bind(units(fees.exchange_txn))
        .bind(units(fees.gst))
        .bind(units(fees.sebi))
        .bind(units(fees.stamp_duty))
        .bind(units(fees.total_fees))
        .bind(fees.computed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn apply_portfolio_delta(
        &mut self,
        positions: &[Position],
        holdings: &[Holding],
    ) -> Result<(), StoreError> {
        for p in positions {
            sqlx::query(
                r#"
                insert into positions (
                  broker_id, exchange, symbol, product, buy_qty, buy_avg,
                  sell_qty, sell_avg, realized_pnl, unrealized_pnl
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                on conflict (broker_id, exchange, symbol, product) do update set
                  buy_qty = excluded.buy_qty,
                  buy_avg = excluded.buy_avg,
                  sell_qty = excluded.sell_qty,
                  sell_avg = excluded.sell_avg,
                  realized_pnl = excluded.realized_pnl,
                  unrealized_pnl = excluded.unrealized_pnl
                "#,
            )
            .bind(&p.key.broker_id)
            .bind(&p.key.instrument.exchange)
            .bind(&p.key.instrument.symbol)
            .bind(enum_to_str(&p.key.product)?)
            .bind(p.buy_qty)
            .bind(units(p.buy_avg))
            .bind(p.sell_qty)
            .bind(units(p.sell_avg))
            .bind(units(p.realized_pnl))
            .bind(units(p.unrealized_pnl))
            .execute(&mut *self.tx)
            .await
            .map_err(sql_err)?;
        }

        for h in holdings {
            sqlx::query(
                r#"
                insert into holdings (broker_id, exchange, symbol, qty, avg_cost, ltp)
                values ($1, $2, $3, $4, $5, $6)
                on conflict (broker_id, exchange, symbol) do update set
                  qty = excluded.qty,
                  avg_cost = excluded.avg_cost,
                  ltp = excluded.ltp
                "#,
            )
            .bind(&h.broker_id)
            .bind(&h.instrument.exchange)
            .bind(&h.instrument.symbol)
            .bind(h.qty)
            .bind(units(h.avg_cost))
            .bind(units(h.last_traded_price))
            .execute(&mut *self.tx)
            .await
            .map_err(sql_err)?;
        }

        Ok(())
    }

    async fn write_recon_run(&mut self, run: &ReconRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into recon_runs (
              run_id, broker_id, scope, status, started_at, finished_at,
              items_checked, mismatches_found
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (run_id) do update set
              status = excluded.status,
              finished_at = excluded.finished_at,
              items_checked = excluded.items_checked,
              mismatches_found = excluded.mismatches_found
            "#,
        )
        .bind(run.run_id)
        .bind(&run.broker_id)
        .bind(enum_to_str(&run.scope)?)
        .bind(enum_to_str(&run.status)?)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.items_checked as i64)
        .bind(run.mismatches_found as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn write_recon_items(&mut self, items: &[ReconItem]) -> Result<(), StoreError> {
        for item in items {
            sqlx::query(
                "insert into recon_items (run_id, item_type, item_id, broker_ref_id, \
                 system_snapshot, broker_snapshot, discrepancy, status) \
                 values ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(item.run_id)
            .bind(enum_to_str(&item.item_type)?)
            .bind(&item.item_id)
            .bind(&item.broker_ref_id)
            .bind(&item.system_snapshot)
            .bind(&item.broker_snapshot)
            .bind(&item.discrepancy)
            .bind(enum_to_str(&item.status)?)
            .execute(&mut *self.tx)
            .await
            .map_err(sql_err)?;
        }
        Ok(())
    }

    async fn reserve_idempotency(
        &mut self,
        key: &str,
        order_id: Uuid,
    ) -> Result<Reservation, StoreError> {
        // The unique constraint decides the race: a concurrent reserver
        // blocks until this transaction resolves, then conflicts.
        let res = sqlx::query(
            "insert into idempotency_keys (key, order_id) values ($1, $2) \
             on conflict (key) do nothing",
        )
        .bind(key)
        .bind(order_id)
        .execute(&mut *self.tx)
        .await
        .map_err(sql_err)?;

        if res.rows_affected() == 1 {
            return Ok(Reservation::Fresh);
        }

        let (existing,): (Uuid,) =
            sqlx::query_as("select order_id from idempotency_keys where key = $1")
                .bind(key)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(sql_err)?;
        Ok(Reservation::Existing(existing))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(sql_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(sql_err)
    }
}
