pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::matching::types::Side;
use crate::models::{Account, Execution, Order, OrderStatus, Position};

pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account already exists: {0}")]
    AlreadyExists(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Every field needed to settle one fill, bundled so the atomic transaction can be
/// driven by a single Store call rather than a generic arbitrary-closure transaction
/// primitive (see DESIGN.md for why this is specialized to the two concrete shapes the
/// engine actually performs).
#[derive(Debug, Clone)]
pub struct FillSettlement {
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub buyer_account_id: String,
    pub seller_account_id: String,
    pub symbol: String,
    pub exec_qty: Decimal,
    pub exec_price: Decimal,
    pub refund_rate: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct CancelSettlement {
    pub order_id: String,
    pub account_id: String,
    pub symbol: String,
    pub is_buy: bool,
    pub remaining: Decimal,
    pub limit_price: Decimal,
    pub canceled_time: i64,
}

/// Persistent account/position/order/execution state, plus the ordered open-order query
/// SideBook refill depends on. This crate ships one concrete implementation
/// (`PostgresStore`) and one in-memory test double (`memory::InMemoryStore`) behind this
/// same trait.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_account(&self, id: &str, balance: Decimal) -> StoreResult<()>;
    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>>;
    async fn update_balance(&self, id: &str, new_balance: Decimal) -> StoreResult<()>;

    async fn get_position(&self, account_id: &str, symbol: &str) -> StoreResult<Option<Position>>;
    async fn get_positions(&self, account_id: &str) -> StoreResult<Vec<Position>>;
    async fn upsert_position(&self, account_id: &str, symbol: &str, amount: Decimal) -> StoreResult<()>;

    async fn create_order(&self, order: &Order) -> StoreResult<()>;
    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>>;
    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
        remaining: Decimal,
        canceled_time: Option<i64>,
    ) -> StoreResult<()>;

    /// Rows ordered `(price desc, timestamp asc)` for buy, `(price asc, timestamp asc)` for
    /// sell — the exact order a SideBook's comparator expects.
    async fn get_open_orders_for_side(
        &self,
        symbol: &str,
        side: Side,
        limit: i64,
    ) -> StoreResult<Vec<Order>>;

    async fn record_execution(
        &self,
        order_id: &str,
        shares: Decimal,
        price: Decimal,
        timestamp: i64,
    ) -> StoreResult<()>;
    async fn get_executions_for_order(&self, id: &str) -> StoreResult<Vec<Execution>>;

    async fn max_numeric_order_id(&self) -> StoreResult<Option<u64>>;

    /// Runs the full settlement sequence for one fill atomically.
    async fn settle_fill(&self, settlement: FillSettlement) -> StoreResult<()>;

    /// Runs the cancel sequence atomically.
    async fn settle_cancel(&self, cancel: CancelSettlement) -> StoreResult<()>;
}
