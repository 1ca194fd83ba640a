use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{GoodsId, OrderId, UserId};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::goods::{decide, requested_quantities};
use crate::orders::ensure_terminal_target;
use crate::{
    GoodsInventory, NewOrder, Order, OrderStatus, OrderStore, Outbox, OutboxMessage,
    OutboxMessageBuilder, OutboxRecord, Reservation, ReservationDecision, Result, StoreError,
    TransitionOutcome,
};

const ORDER_COLUMNS: &str = "id, user_id, goods_ids, status_id, created_at, updated_at";

/// Runs the database migrations shipped with the workspace.
pub async fn run_migrations(
    pool: &PgPool,
) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

fn to_raw(goods_ids: &[GoodsId]) -> Vec<i64> {
    goods_ids.iter().map(GoodsId::as_i64).collect()
}

fn from_raw(goods_ids: Vec<i64>) -> Vec<GoodsId> {
    goods_ids.into_iter().map(GoodsId::new).collect()
}

/// PostgreSQL-backed order store and outbox.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        run_migrations(&self.pool).await
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            goods_ids: from_raw(row.try_get("goods_ids")?),
            status: OrderStatus::from_code(row.try_get("status_id")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRecord> {
        let attempts: i32 = row.try_get("attempts")?;
        Ok(OutboxRecord {
            id: row.try_get("id")?,
            message: OutboxMessage {
                topic: row.try_get("topic")?,
                key: row.try_get("message_key")?,
                payload: row.try_get("payload")?,
            },
            created_at: row.try_get("created_at")?,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }

    async fn insert_order<'e, E>(executor: E, order: &NewOrder) -> Result<Order>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            "INSERT INTO orders (user_id, goods_ids, status_id) VALUES ($1, $2, $3) RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.user_id.as_i64())
        .bind(to_raw(&order.goods_ids))
        .bind(OrderStatus::Created.code())
        .fetch_one(executor)
        .await?;

        Self::row_to_order(row)
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn insert(&self, order: NewOrder) -> Result<Order> {
        Self::insert_order(&self.pool, &order).await
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn transition_from_created(
        &self,
        id: OrderId,
        target: OrderStatus,
    ) -> Result<TransitionOutcome> {
        ensure_terminal_target(target)?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE orders SET status_id = $2, updated_at = NOW()
            WHERE id = $1 AND status_id = $3
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id.as_i64())
        .bind(target.code())
        .bind(OrderStatus::Created.code())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(TransitionOutcome::Applied(Self::row_to_order(row)?));
        }

        // Terminal statuses never change, so this read cannot go stale.
        let status: Option<i16> = sqlx::query_scalar("SELECT status_id FROM orders WHERE id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        match status {
            Some(code) => Ok(TransitionOutcome::AlreadyTerminal(OrderStatus::from_code(
                code,
            )?)),
            None => Ok(TransitionOutcome::NotFound),
        }
    }

    async fn find_stale_created(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE status_id = $1 AND created_at <= $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(OrderStatus::Created.code())
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order).collect()
    }
}

#[async_trait]
impl Outbox for PostgresOrderStore {
    async fn insert_with_outbox(
        &self,
        order: NewOrder,
        message: OutboxMessageBuilder,
    ) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let order = Self::insert_order(&mut *tx, &order).await?;
        let message = message(&order)?;

        sqlx::query(
            r#"
            INSERT INTO order_outbox (topic, message_key, payload, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, attempts, last_error, created_at
            FROM order_outbox
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE order_outbox SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxRecordNotFound(id));
        }
        Ok(())
    }

    async fn record_outbox_failure(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE order_outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxRecordNotFound(id));
        }
        Ok(())
    }
}

/// PostgreSQL-backed goods stock and reservation ledger.
///
/// A reservation runs in one transaction: an advisory lock on the order ID
/// serializes duplicate deliveries, and the stock rows are locked while the
/// decision is made and recorded.
#[derive(Clone)]
pub struct PostgresGoodsInventory {
    pool: PgPool,
}

impl PostgresGoodsInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Sets stock levels, inserting unknown goods.
    pub async fn set_stock(&self, stock: &[(GoodsId, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, quantity) in stock {
            sqlx::query(
                r#"
                INSERT INTO goods (id, quantity) VALUES ($1, $2)
                ON CONFLICT (id) DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = NOW()
                "#,
            )
            .bind(id.as_i64())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn stock_of(&self, id: GoodsId) -> Result<i64> {
        let quantity: Option<i64> = sqlx::query_scalar("SELECT quantity FROM goods WHERE id = $1")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(quantity.unwrap_or(0))
    }

    fn row_to_decision(row: PgRow) -> Result<ReservationDecision> {
        let decision: String = row.try_get("decision")?;
        let goods_ids = from_raw(row.try_get("goods_ids")?);
        match decision.as_str() {
            "reserved" => Ok(ReservationDecision::Reserved { goods_ids }),
            "rejected" => Ok(ReservationDecision::Rejected {
                unavailable_goods_ids: goods_ids,
            }),
            _ => Err(StoreError::UnknownDecision(decision)),
        }
    }
}

#[async_trait]
impl GoodsInventory for PostgresGoodsInventory {
    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        goods_ids: &[GoodsId],
    ) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(order_id.as_i64())
            .execute(&mut *tx)
            .await?;

        let recorded = sqlx::query(
            "SELECT decision, goods_ids FROM goods_reservations WHERE order_id = $1",
        )
        .bind(order_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = recorded {
            tx.commit().await?;
            return Ok(Reservation {
                order_id,
                decision: Self::row_to_decision(row)?,
                replayed: true,
            });
        }

        let requested = requested_quantities(goods_ids);
        let distinct: Vec<i64> = requested.iter().map(|(id, _)| id.as_i64()).collect();

        let rows = sqlx::query(
            "SELECT id, quantity FROM goods WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&distinct)
        .fetch_all(&mut *tx)
        .await?;

        let mut stock: HashMap<GoodsId, i64> = HashMap::with_capacity(rows.len());
        for row in rows {
            stock.insert(GoodsId::new(row.try_get("id")?), row.try_get("quantity")?);
        }

        let decision = decide(goods_ids, |id| stock.get(&id).copied().unwrap_or(0));

        if decision.is_reserved() {
            for (id, quantity) in &requested {
                sqlx::query(
                    "UPDATE goods SET quantity = quantity - $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(id.as_i64())
                .bind(quantity)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "INSERT INTO goods_reservations (order_id, decision, goods_ids) VALUES ($1, $2, $3)",
        )
        .bind(order_id.as_i64())
        .bind(decision.as_str())
        .bind(to_raw(decision.goods_ids()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(%order_id, decision = decision.as_str(), "reservation recorded");
        Ok(Reservation {
            order_id,
            decision,
            replayed: false,
        })
    }

    async fn decision_for(&self, order_id: OrderId) -> Result<Option<ReservationDecision>> {
        let row =
            sqlx::query("SELECT decision, goods_ids FROM goods_reservations WHERE order_id = $1")
                .bind(order_id.as_i64())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Self::row_to_decision).transpose()
    }
}
