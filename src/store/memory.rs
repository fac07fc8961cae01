//! An in-process `Store` test double. Exists so MatchEngine/RequestDispatcher scenario
//! tests (SPEC_FULL.md §8 S1-S6) can run without a live Postgres instance, the same way
//! the crate's trait boundary is meant to allow swapping backing implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::matching::types::Side;
use crate::models::{Account, Execution, Order, OrderStatus, Position};

use super::{CancelSettlement, FillSettlement, Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    positions: HashMap<(String, String), Position>,
    orders: HashMap<String, Order>,
    executions: Vec<Execution>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_account(&self, id: &str, balance: Decimal) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.accounts.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        inner.accounts.insert(
            id.to_string(),
            Account {
                id: id.to_string(),
                balance,
            },
        );
        Ok(())
    }

    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        Ok(self.inner.lock().accounts.get(id).cloned())
    }

    async fn update_balance(&self, id: &str, new_balance: Decimal) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.accounts.get_mut(id) {
            account.balance = new_balance;
        }
        Ok(())
    }

    async fn get_position(&self, account_id: &str, symbol: &str) -> StoreResult<Option<Position>> {
        Ok(self
            .inner
            .lock()
            .positions
            .get(&(account_id.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn get_positions(&self, account_id: &str) -> StoreResult<Vec<Position>> {
        Ok(self
            .inner
            .lock()
            .positions
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn upsert_position(&self, account_id: &str, symbol: &str, amount: Decimal) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.positions.insert(
            (account_id.to_string(), symbol.to_string()),
            Position {
                account_id: account_id.to_string(),
                symbol: symbol.to_string(),
                amount,
            },
        );
        Ok(())
    }

    async fn create_order(&self, order: &Order) -> StoreResult<()> {
        self.inner.lock().orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &str) -> StoreResult<Option<Order>> {
        Ok(self.inner.lock().orders.get(id).cloned())
    }

    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
        remaining: Decimal,
        canceled_time: Option<i64>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.orders.get_mut(id) {
            order.status = status;
            order.remaining = remaining;
            if canceled_time.is_some() {
                order.canceled_time = canceled_time;
            }
        }
        Ok(())
    }

    async fn get_open_orders_for_side(
        &self,
        symbol: &str,
        side: Side,
        limit: i64,
    ) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock();
        let mut matching: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && o.status == OrderStatus::Open
                    && Side::from_signed_amount(o.amount) == side
            })
            .cloned()
            .collect();

        match side {
            Side::Buy => matching.sort_by(|a, b| b.price.cmp(&a.price).then(a.timestamp.cmp(&b.timestamp))),
            Side::Sell => matching.sort_by(|a, b| a.price.cmp(&b.price).then(a.timestamp.cmp(&b.timestamp))),
        }

        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn record_execution(
        &self,
        order_id: &str,
        shares: Decimal,
        price: Decimal,
        timestamp: i64,
    ) -> StoreResult<()> {
        self.inner.lock().executions.push(Execution {
            order_id: order_id.to_string(),
            shares,
            price,
            timestamp,
        });
        Ok(())
    }

    async fn get_executions_for_order(&self, id: &str) -> StoreResult<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .inner
            .lock()
            .executions
            .iter()
            .filter(|e| e.order_id == id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.timestamp);
        Ok(executions)
    }

    async fn max_numeric_order_id(&self) -> StoreResult<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .orders
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max())
    }

    async fn settle_fill(&self, settlement: FillSettlement) -> StoreResult<()> {
        let mut inner = self.inner.lock();

        for (order_id, account_id) in [
            (&settlement.buy_order_id, &settlement.buyer_account_id),
            (&settlement.sell_order_id, &settlement.seller_account_id),
        ] {
            if !inner.orders.contains_key(order_id) {
                return Err(StoreError::OrderNotFound(order_id.clone()));
            }
            let _ = account_id;
        }

        inner.executions.push(Execution {
            order_id: settlement.buy_order_id.clone(),
            shares: settlement.exec_qty,
            price: settlement.exec_price,
            timestamp: settlement.timestamp,
        });
        inner.executions.push(Execution {
            order_id: settlement.sell_order_id.clone(),
            shares: settlement.exec_qty,
            price: settlement.exec_price,
            timestamp: settlement.timestamp,
        });

        for order_id in [&settlement.buy_order_id, &settlement.sell_order_id] {
            let order = inner.orders.get_mut(order_id).expect("checked above");
            let new_remaining = order.remaining - settlement.exec_qty;
            order.remaining = new_remaining;
            order.status = if new_remaining <= Decimal::ZERO {
                OrderStatus::Executed
            } else {
                OrderStatus::Open
            };
        }

        if settlement.refund_rate > Decimal::ZERO {
            let refund = settlement.exec_qty * settlement.refund_rate;
            if let Some(account) = inner.accounts.get_mut(&settlement.buyer_account_id) {
                account.balance += refund;
            }
        }

        let proceeds = settlement.exec_qty * settlement.exec_price;
        if let Some(account) = inner.accounts.get_mut(&settlement.seller_account_id) {
            account.balance += proceeds;
        }

        let key = (settlement.buyer_account_id.clone(), settlement.symbol.clone());
        let position = inner.positions.entry(key).or_insert(Position {
            account_id: settlement.buyer_account_id.clone(),
            symbol: settlement.symbol.clone(),
            amount: Decimal::ZERO,
        });
        position.amount += settlement.exec_qty;

        Ok(())
    }

    async fn settle_cancel(&self, cancel: CancelSettlement) -> StoreResult<()> {
        let mut inner = self.inner.lock();

        if let Some(order) = inner.orders.get_mut(&cancel.order_id) {
            order.status = OrderStatus::Canceled;
            order.canceled_time = Some(cancel.canceled_time);
        } else {
            return Err(StoreError::OrderNotFound(cancel.order_id.clone()));
        }

        if cancel.is_buy {
            let refund = cancel.remaining * cancel.limit_price;
            if let Some(account) = inner.accounts.get_mut(&cancel.account_id) {
                account.balance += refund;
            }
        } else {
            let key = (cancel.account_id.clone(), cancel.symbol.clone());
            let position = inner.positions.entry(key).or_insert(Position {
                account_id: cancel.account_id.clone(),
                symbol: cancel.symbol.clone(),
                amount: Decimal::ZERO,
            });
            position.amount += cancel.remaining;
        }

        Ok(())
    }
}
