use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A durable account row: `id` is the opaque account identifier supplied by the client,
/// `balance` is signed cash at scale 2.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub balance: Decimal,
}

/// A durable position row keyed by `(account_id, symbol)`. A missing row is equivalent
/// to `amount = 0`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub amount: Decimal,
}
