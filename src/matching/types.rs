use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_signed_amount(amount: Decimal) -> Self {
        if amount.is_sign_positive() {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

/// The reduced projection of an Order held by a SideBook (C1). Comparison-only: the
/// authoritative `remaining`/`status` always live in the Order row, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOrder {
    pub id: String,
    pub price: Decimal,
    pub timestamp: i64,
}

impl RestingOrder {
    pub fn new(id: String, price: Decimal, timestamp: i64) -> Self {
        Self { id, price, timestamp }
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("insufficient funds for account: {0}")]
    InsufficientFunds(String),
    #[error("insufficient shares for: {0} in account: {1}")]
    InsufficientShares(Decimal, String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("order is not open: {0}")]
    NotOpen(String),
    #[error("account already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}
