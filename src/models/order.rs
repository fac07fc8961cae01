use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Terminal states are immutable once reached (see the Order state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Executed,
    Canceled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::Executed => write!(f, "executed"),
            OrderStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl OrderStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Executed => "executed",
            OrderStatus::Canceled => "canceled",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderStatus::Open),
            "executed" => Some(OrderStatus::Executed),
            "canceled" => Some(OrderStatus::Canceled),
            _ => None,
        }
    }
}

/// The durable order row. `amount` is signed: positive is a buy, negative is a sell.
/// `remaining` and `status` are authoritative here — any in-memory resting copy held by a
/// SideBook is only a comparison projection and must never be read for these two fields.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub remaining: Decimal,
    pub timestamp: i64,
    pub canceled_time: Option<i64>,
}

impl Order {
    pub fn is_buy(&self) -> bool {
        self.amount.is_sign_positive()
    }
}

/// One fill leg. Every match writes exactly two of these rows (one per side) sharing
/// `shares`, `price`, and `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub order_id: String,
    pub shares: Decimal,
    pub price: Decimal,
    pub timestamp: i64,
}
