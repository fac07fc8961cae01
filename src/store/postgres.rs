use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::matching::types::Side;
use crate::models::{Account, Execution, Order, OrderStatus, Position};

use super::{CancelSettlement, FillSettlement, Store, StoreError, StoreResult};

/// Postgres-backed implementation of the Store contract. Owns a connection pool; every
/// write that touches more than one row runs inside a transaction via `pool.begin()` /
/// `tx.commit()`, the same pattern this codebase's persistence code already uses.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema if it does not already exist. Safe to call on every startup.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id VARCHAR PRIMARY KEY,
                balance NUMERIC(20,2) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                account_id VARCHAR NOT NULL REFERENCES accounts(id),
                symbol VARCHAR NOT NULL,
                amount NUMERIC(20,6) NOT NULL,
                PRIMARY KEY (account_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id VARCHAR PRIMARY KEY,
                account_id VARCHAR NOT NULL REFERENCES accounts(id),
                symbol VARCHAR NOT NULL,
                amount NUMERIC(20,6) NOT NULL,
                price NUMERIC(20,6) NOT NULL,
                status VARCHAR(10) NOT NULL,
                remaining NUMERIC(20,6) NOT NULL,
                timestamp BIGINT NOT NULL,
                canceled_time BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                order_id VARCHAR NOT NULL REFERENCES orders(id),
                shares NUMERIC(20,6) NOT NULL,
                price NUMERIC(20,6) NOT NULL,
                timestamp BIGINT NOT NULL,
                PRIMARY KEY (order_id, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_open_book ON orders (symbol, status, price, timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn credit_balance(tx: &mut Transaction<'_, Postgres>, account_id: &str, delta: Decimal) -> StoreResult<()> {
        sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
            .bind(delta.round_dp(2))
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn credit_position(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &str,
        symbol: &str,
        delta: Decimal,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (account_id, symbol, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id, symbol)
            DO UPDATE SET amount = positions.amount + EXCLUDED.amount
            "#,
        )
        .bind(account_id)
        .bind(symbol)
        .bind(delta)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn apply_fill_leg(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        exec_qty: Decimal,
    ) -> StoreResult<()> {
        let row = sqlx::query("SELECT remaining FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::OrderNotFound(order_id.to_string()))?;
        let remaining: Decimal = row.try_get("remaining")?;
        let new_remaining = remaining - exec_qty;
        let status = if new_remaining <= Decimal::ZERO {
            OrderStatus::Executed
        } else {
            OrderStatus::Open
        };

        sqlx::query("UPDATE orders SET remaining = $1, status = $2 WHERE id = $3")
            .bind(new_remaining)
            .bind(status.as_db_str())
            .bind(order_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_account(&self, id: &str, balance: Decimal) -> StoreResult<()> {
        let result = sqlx::query("INSERT INTO accounts (id, balance) VALUES ($1, $2)")
            .bind(id)
            .bind(balance.round_dp(2))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::AlreadyExists(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT id, balance FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn update_balance(&self, id: &str, new_balance: Decimal) -> StoreResult<()> {
        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(new_balance.round_dp(2))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_position(&self, account_id: &str, symbol: &str) -> StoreResult<Option<Position>> {
        let position = sqlx::query_as::<_, Position>(
            "SELECT account_id, symbol, amount FROM positions WHERE account_id = $1 AND symbol = $2",
        )
        .bind(account_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position)
    }

    async fn get_positions(&self, account_id: &str) -> StoreResult<Vec<Position>> {
        let positions = sqlx::query_as::<_, Position>(
            "SELECT account_id, symbol, amount FROM positions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(positions)
    }

    async fn upsert_position(&self, account_id: &str, symbol: &str, amount: Decimal) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (account_id, symbol, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id, symbol) DO UPDATE SET amount = EXCLUDED.amount
            "#,
        )
        .bind(account_id)
        .bind(symbol)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_order(&self, order: &Order) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, account_id, symbol, amount, price, status, remaining, timestamp, canceled_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&order.id)
        .bind(&order.account_id)
        .bind(&order.symbol)
        .bind(order.amount)
        .bind(order.price)
        .bind(order.status.as_db_str())
        .bind(order.remaining)
        .bind(order.timestamp)
        .bind(order.canceled_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query(
            "SELECT id, account_id, symbol, amount, price, status, remaining, timestamp, canceled_time FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
        remaining: Decimal,
        canceled_time: Option<i64>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE orders SET status = $1, remaining = $2, canceled_time = $3 WHERE id = $4")
            .bind(status.as_db_str())
            .bind(remaining)
            .bind(canceled_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_open_orders_for_side(
        &self,
        symbol: &str,
        side: Side,
        limit: i64,
    ) -> StoreResult<Vec<Order>> {
        let query = match side {
            Side::Buy => {
                "SELECT id, account_id, symbol, amount, price, status, remaining, timestamp, canceled_time \
                 FROM orders WHERE symbol = $1 AND status = 'open' AND amount > 0 \
                 ORDER BY price DESC, timestamp ASC LIMIT $2"
            }
            Side::Sell => {
                "SELECT id, account_id, symbol, amount, price, status, remaining, timestamp, canceled_time \
                 FROM orders WHERE symbol = $1 AND status = 'open' AND amount < 0 \
                 ORDER BY price ASC, timestamp ASC LIMIT $2"
            }
        };

        let rows = sqlx::query(query)
            .bind(symbol)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_order).collect()
    }

    async fn record_execution(
        &self,
        order_id: &str,
        shares: Decimal,
        price: Decimal,
        timestamp: i64,
    ) -> StoreResult<()> {
        sqlx::query("INSERT INTO executions (order_id, shares, price, timestamp) VALUES ($1, $2, $3, $4)")
            .bind(order_id)
            .bind(shares)
            .bind(price)
            .bind(timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_executions_for_order(&self, id: &str) -> StoreResult<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(
            "SELECT order_id, shares, price, timestamp FROM executions WHERE order_id = $1 ORDER BY timestamp ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    async fn max_numeric_order_id(&self) -> StoreResult<Option<u64>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM orders")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().filter_map(|id| id.parse::<u64>().ok()).max())
    }

    async fn settle_fill(&self, settlement: FillSettlement) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // Defensive re-read (§4.6.5 step 1): the resting side's remaining may have
        // drifted since the matching loop peeked it. `apply_fill_leg` re-reads under
        // `FOR UPDATE` before computing the new remaining.
        sqlx::query("INSERT INTO executions (order_id, shares, price, timestamp) VALUES ($1, $2, $3, $4)")
            .bind(&settlement.buy_order_id)
            .bind(settlement.exec_qty)
            .bind(settlement.exec_price)
            .bind(settlement.timestamp)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO executions (order_id, shares, price, timestamp) VALUES ($1, $2, $3, $4)")
            .bind(&settlement.sell_order_id)
            .bind(settlement.exec_qty)
            .bind(settlement.exec_price)
            .bind(settlement.timestamp)
            .execute(&mut *tx)
            .await?;

        Self::apply_fill_leg(&mut tx, &settlement.buy_order_id, settlement.exec_qty).await?;
        Self::apply_fill_leg(&mut tx, &settlement.sell_order_id, settlement.exec_qty).await?;

        if settlement.refund_rate > Decimal::ZERO {
            let refund = settlement.exec_qty * settlement.refund_rate;
            Self::credit_balance(&mut tx, &settlement.buyer_account_id, refund).await?;
        }

        let proceeds = settlement.exec_qty * settlement.exec_price;
        Self::credit_balance(&mut tx, &settlement.seller_account_id, proceeds).await?;
        Self::credit_position(&mut tx, &settlement.buyer_account_id, &settlement.symbol, settlement.exec_qty).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn settle_cancel(&self, cancel: CancelSettlement) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE orders SET status = 'canceled', canceled_time = $1 WHERE id = $2")
            .bind(cancel.canceled_time)
            .bind(&cancel.order_id)
            .execute(&mut *tx)
            .await?;

        if cancel.is_buy {
            let refund = cancel.remaining * cancel.limit_price;
            Self::credit_balance(&mut tx, &cancel.account_id, refund).await?;
        } else {
            Self::credit_position(&mut tx, &cancel.account_id, &cancel.symbol, cancel.remaining).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn row_to_order(row: sqlx::postgres::PgRow) -> StoreResult<Order> {
    let status_str: String = row.try_get("status")?;
    let status = OrderStatus::from_db_str(&status_str)
        .unwrap_or_else(|| panic!("unknown order status in store: {status_str}"));

    Ok(Order {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        symbol: row.try_get("symbol")?,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
        status,
        remaining: row.try_get("remaining")?,
        timestamp: row.try_get("timestamp")?,
        canceled_time: row.try_get("canceled_time")?,
    })
}
