use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{error, instrument, warn};

use crate::models::{Execution, Order, OrderStatus};
use crate::store::{CancelSettlement, FillSettlement, Store};

use super::pool::RoomPool;
use super::types::{MatchError, RestingOrder};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

/// The write-through projection of one account's balance and positions (§5 "Accounts
/// cache"). Advisory only: every mutation here is preceded or accompanied by a Store
/// write, never the other way around.
#[derive(Debug, Clone, Default)]
pub struct AccountCache {
    pub balance: Decimal,
    pub positions: HashMap<String, Decimal>,
}

/// Admits orders, runs the matching loop against a SymbolRoom, and settles every fill in
/// a Store transaction (C6). Also owns the accounts cache described in §5, since
/// admission (`reserve`) is the operation that reads and mutates it.
pub struct MatchEngine {
    store: Arc<dyn Store>,
    pool: RoomPool,
    accounts: RwLock<HashMap<String, AccountCache>>,
    next_order_id: AtomicU64,
}

impl MatchEngine {
    pub async fn new(
        store: Arc<dyn Store>,
        room_pool_limit: usize,
        side_book_max_size: usize,
        side_book_min_size: usize,
    ) -> Result<Self, MatchError> {
        let seed = store.max_numeric_order_id().await?.map(|m| m + 1).unwrap_or(1);
        Ok(Self {
            pool: RoomPool::new(room_pool_limit, side_book_max_size, side_book_min_size, store.clone()),
            store,
            accounts: RwLock::new(HashMap::new()),
            next_order_id: AtomicU64::new(seed),
        })
    }

    /// Lazily loads `account_id`'s balance and positions from Store into the cache if
    /// not already present. `AccountNotFound` if Store has no such account either.
    pub async fn ensure_account_cached(&self, account_id: &str) -> Result<(), MatchError> {
        {
            let accounts = self.accounts.read().await;
            if accounts.contains_key(account_id) {
                return Ok(());
            }
        }

        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| MatchError::AccountNotFound(account_id.to_string()))?;
        let positions = self.store.get_positions(account_id).await?;
        let mut position_map = HashMap::with_capacity(positions.len());
        for position in positions {
            position_map.insert(position.symbol, position.amount);
        }

        let mut accounts = self.accounts.write().await;
        accounts.entry(account_id.to_string()).or_insert(AccountCache {
            balance: account.balance,
            positions: position_map,
        });
        Ok(())
    }

    /// True if the account is cached or can be lazily loaded from Store; used by
    /// RequestDispatcher's Transactions-tree account check (§4.7).
    pub async fn account_known(&self, account_id: &str) -> bool {
        self.ensure_account_cached(account_id).await.is_ok()
    }

    /// Seeds a freshly created account straight into the cache, skipping a redundant
    /// positions query since it cannot have any yet.
    pub async fn seed_account_cache(&self, account_id: &str, balance: Decimal) {
        let mut accounts = self.accounts.write().await;
        accounts.insert(
            account_id.to_string(),
            AccountCache {
                balance,
                positions: HashMap::new(),
            },
        );
    }

    /// Ensures a SymbolRoom exists in the pool for `symbol`, without locking it. Used by
    /// RequestDispatcher's Create-tree Symbol handling (§4.7), which needs the room to
    /// exist before any allocation but has nothing to lock it for yet.
    pub async fn ensure_room(&self, symbol: &str) {
        self.pool.get_or_create(symbol).await;
    }

    /// Persists and caches `current position + amount` for (account_id, symbol),
    /// lazily loading the account first. Used by RequestDispatcher's Create-tree Symbol
    /// allocations (§4.7), which always *add* to an existing position.
    pub async fn allocate_position(
        &self,
        account_id: &str,
        symbol: &str,
        amount: Decimal,
    ) -> Result<Decimal, MatchError> {
        self.ensure_account_cached(account_id).await?;
        let mut accounts = self.accounts.write().await;
        let entry = accounts.get_mut(account_id).expect("just ensured cached");
        let current = *entry.positions.get(symbol).unwrap_or(&Decimal::ZERO);
        let new_amount = current + amount;
        self.store.upsert_position(account_id, symbol, new_amount).await?;
        entry.positions.insert(symbol.to_string(), new_amount);
        Ok(new_amount)
    }

    /// §4.6.1: pre-debits cash (buy) or shares (sell) at admission. Fails without
    /// admitting the order if the account cannot cover it.
    #[instrument(skip(self), fields(%account_id, %symbol))]
    pub async fn reserve(
        &self,
        account_id: &str,
        symbol: &str,
        signed_amount: Decimal,
        price: Decimal,
    ) -> Result<(), MatchError> {
        self.ensure_account_cached(account_id).await?;
        let mut accounts = self.accounts.write().await;
        let entry = accounts
            .get_mut(account_id)
            .ok_or_else(|| MatchError::AccountNotFound(account_id.to_string()))?;

        if signed_amount.is_sign_positive() {
            let cost = signed_amount * price;
            if entry.balance < cost {
                return Err(MatchError::InsufficientFunds(account_id.to_string()));
            }
            let new_balance = entry.balance - cost;
            self.store.update_balance(account_id, new_balance).await?;
            entry.balance = new_balance;
        } else {
            let sell_amount = signed_amount.abs();
            let current = *entry.positions.get(symbol).unwrap_or(&Decimal::ZERO);
            if current < sell_amount {
                return Err(MatchError::InsufficientShares(current, account_id.to_string()));
            }
            let new_amount = current - sell_amount;
            self.store.upsert_position(account_id, symbol, new_amount).await?;
            entry.positions.insert(symbol.to_string(), new_amount);
        }
        Ok(())
    }

    /// §4.6.2-4.6.5: assigns an order id, persists the order, locks the SymbolRoom, and
    /// runs the matching loop, settling each fill in its own Store transaction. Returns
    /// the assigned order id. Assumes `reserve` already succeeded for this order.
    #[instrument(skip(self), fields(%account_id, %symbol))]
    pub async fn place_order(
        &self,
        account_id: &str,
        symbol: &str,
        signed_amount: Decimal,
        price: Decimal,
    ) -> Result<String, MatchError> {
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string();
        let timestamp = now_ns();
        let amount_abs = signed_amount.abs();
        let is_buy = signed_amount.is_sign_positive();

        let order = Order {
            id: order_id.clone(),
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            amount: signed_amount,
            price,
            status: OrderStatus::Open,
            remaining: amount_abs,
            timestamp,
            canceled_time: None,
        };
        // Reservation already happened; if this fails the reservation is not rolled
        // back (see SPEC_FULL.md §9 open-question resolution — intentional).
        self.store.create_order(&order).await?;

        let room = self.pool.get_or_create(symbol).await;
        let mut guard = room.lock().await;
        let mut rem = amount_abs;

        if is_buy {
            while rem > Decimal::ZERO {
                let Some(resting) = guard.sell.pop().await else {
                    break;
                };
                if resting.price > price {
                    guard.sell.push_back(resting);
                    break;
                }
                let Some(exec_qty) = self
                    .try_settle_fill(&order_id, account_id, symbol, price, timestamp, &resting, true, rem)
                    .await?
                else {
                    continue;
                };
                rem -= exec_qty;
            }
        } else {
            while rem > Decimal::ZERO {
                let Some(resting) = guard.buy.pop().await else {
                    break;
                };
                if resting.price < price {
                    guard.buy.push_back(resting);
                    break;
                }
                let Some(exec_qty) = self
                    .try_settle_fill(&order_id, account_id, symbol, price, timestamp, &resting, false, rem)
                    .await?
                else {
                    continue;
                };
                rem -= exec_qty;
            }
        }

        if rem > Decimal::ZERO {
            self.store
                .update_order_status(&order_id, OrderStatus::Open, rem, None)
                .await?;
            let resting = RestingOrder::new(order_id.clone(), price, timestamp);
            if is_buy {
                guard.buy.push(resting);
            } else {
                guard.sell.push(resting);
            }
        }

        Ok(order_id)
    }

    /// One iteration of the matching loop body (§4.6.3 b-f): re-reads the resting order,
    /// computes the clearing price and refund rate, and settles the fill. Returns
    /// `Ok(None)` when the resting entry was stale and should simply be skipped,
    /// `Ok(Some(exec_qty))` on a successful settlement.
    #[allow(clippy::too_many_arguments)]
    async fn try_settle_fill(
        &self,
        incoming_order_id: &str,
        incoming_account_id: &str,
        symbol: &str,
        incoming_price: Decimal,
        incoming_timestamp: i64,
        resting: &RestingOrder,
        incoming_is_buy: bool,
        incoming_rem: Decimal,
    ) -> Result<Option<Decimal>, MatchError> {
        let resting_order = match self.store.get_order(&resting.id).await {
            Ok(Some(o)) if o.status == OrderStatus::Open => o,
            Ok(_) => return Ok(None), // stale: canceled or already executed since it was cached
            Err(e) => {
                warn!(order_id = %resting.id, error = %e, "failed to re-read resting order, skipping");
                return Ok(None);
            }
        };

        let exec_price = if resting_order.timestamp < incoming_timestamp {
            resting_order.price
        } else {
            incoming_price
        };
        let exec_qty = incoming_rem.min(resting_order.remaining);

        let (buy_order_id, sell_order_id, buyer_account_id, seller_account_id, refund_rate) = if incoming_is_buy {
            let refund_rate = (incoming_price - exec_price).max(Decimal::ZERO);
            (
                incoming_order_id.to_string(),
                resting_order.id.clone(),
                incoming_account_id.to_string(),
                resting_order.account_id.clone(),
                refund_rate,
            )
        } else {
            let refund_rate = (resting_order.price - exec_price).max(Decimal::ZERO);
            (
                resting_order.id.clone(),
                incoming_order_id.to_string(),
                resting_order.account_id.clone(),
                incoming_account_id.to_string(),
                refund_rate,
            )
        };

        let settlement = FillSettlement {
            buy_order_id,
            sell_order_id,
            buyer_account_id,
            seller_account_id,
            symbol: symbol.to_string(),
            exec_qty,
            exec_price,
            refund_rate,
            timestamp: now_ns(),
        };

        match self.store.settle_fill(settlement).await {
            Ok(()) => Ok(Some(exec_qty)),
            Err(e) => {
                error!(
                    resting_order = %resting_order.id,
                    incoming_order = %incoming_order_id,
                    error = %e,
                    "settlement failed, rolling back this fill and continuing"
                );
                Ok(None)
            }
        }
    }

    /// §4.6.6: fails `NotOpen` unless the order is currently open; otherwise cancels it
    /// and refunds the unfilled reservation, mirroring the refund into the accounts
    /// cache as well as Store.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), MatchError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| MatchError::OrderNotFound(order_id.to_string()))?;
        if order.status != OrderStatus::Open {
            return Err(MatchError::NotOpen(order_id.to_string()));
        }

        let is_buy = order.is_buy();
        let cancel = CancelSettlement {
            order_id: order.id.clone(),
            account_id: order.account_id.clone(),
            symbol: order.symbol.clone(),
            is_buy,
            remaining: order.remaining,
            limit_price: order.price,
            canceled_time: now_ns(),
        };
        self.store.settle_cancel(cancel).await?;

        let _ = self.ensure_account_cached(&order.account_id).await;
        let mut accounts = self.accounts.write().await;
        if let Some(entry) = accounts.get_mut(&order.account_id) {
            if is_buy {
                entry.balance += order.remaining * order.price;
            } else {
                let current = *entry.positions.get(&order.symbol).unwrap_or(&Decimal::ZERO);
                entry.positions.insert(order.symbol.clone(), current + order.remaining);
            }
        }
        Ok(())
    }

    /// §4.6.7: no side effects.
    pub async fn get_order_status(&self, order_id: &str) -> Result<(Order, Vec<Execution>), MatchError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| MatchError::OrderNotFound(order_id.to_string()))?;
        let executions = self
            .store
            .get_executions_for_order(order_id)
            .await
            .unwrap_or_default();
        Ok((order, executions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use rust_decimal_macros::dec;

    async fn engine() -> MatchEngine {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap()
    }

    async fn seed_account(engine: &MatchEngine, store: &Arc<dyn Store>, id: &str, balance: Decimal) {
        store.create_account(id, balance).await.unwrap();
        engine.seed_account_cache(id, balance).await;
    }

    #[tokio::test]
    async fn s2_resting_buy_reserves_and_opens() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap();
        seed_account(&engine, &store, "B", dec!(500)).await;

        engine.reserve("B", "SPY", dec!(5), dec!(10)).await.unwrap();
        let order_id = engine.place_order("B", "SPY", dec!(5), dec!(10)).await.unwrap();

        let (order, executions) = engine.get_order_status(&order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.remaining, dec!(5));
        assert!(executions.is_empty());
    }

    #[tokio::test]
    async fn s3_crossing_sell_executes_at_resting_price() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap();
        seed_account(&engine, &store, "A", dec!(0)).await;
        seed_account(&engine, &store, "B", dec!(500)).await;
        engine.allocate_position("A", "SPY", dec!(100)).await.unwrap();

        engine.reserve("B", "SPY", dec!(5), dec!(10)).await.unwrap();
        let buy_id = engine.place_order("B", "SPY", dec!(5), dec!(10)).await.unwrap();

        engine.reserve("A", "SPY", dec!(-5), dec!(8)).await.unwrap();
        let sell_id = engine.place_order("A", "SPY", dec!(-5), dec!(8)).await.unwrap();

        let (buy_order, buy_execs) = engine.get_order_status(&buy_id).await.unwrap();
        let (sell_order, sell_execs) = engine.get_order_status(&sell_id).await.unwrap();

        assert_eq!(buy_order.status, OrderStatus::Executed);
        assert_eq!(sell_order.status, OrderStatus::Executed);
        assert_eq!(buy_execs[0].price, dec!(10));
        assert_eq!(sell_execs[0].price, dec!(10));

        let a_account = store.get_account("A").await.unwrap().unwrap();
        assert_eq!(a_account.balance, dec!(50)); // 5 shares * 10
        let b_account = store.get_account("B").await.unwrap().unwrap();
        assert_eq!(b_account.balance, dec!(450)); // reserved 50, refund 0
    }

    #[tokio::test]
    async fn s5_oversell_is_rejected_without_mutating_book() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap();
        seed_account(&engine, &store, "A", dec!(0)).await;
        engine.allocate_position("A", "SPY", dec!(95)).await.unwrap();

        let result = engine.reserve("A", "SPY", dec!(-100), dec!(1)).await;
        assert!(matches!(result, Err(MatchError::InsufficientShares(_, _))));
    }

    #[tokio::test]
    async fn s6_cancel_partially_filled_buy_refunds_remainder() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap();
        seed_account(&engine, &store, "A", dec!(0)).await;
        seed_account(&engine, &store, "B", dec!(1000)).await;
        engine.allocate_position("A", "SPY", dec!(30)).await.unwrap();

        engine.reserve("B", "SPY", dec!(100), dec!(10)).await.unwrap();
        let buy_id = engine.place_order("B", "SPY", dec!(100), dec!(10)).await.unwrap();

        engine.reserve("A", "SPY", dec!(-30), dec!(10)).await.unwrap();
        engine.place_order("A", "SPY", dec!(-30), dec!(10)).await.unwrap();

        engine.cancel_order(&buy_id).await.unwrap();
        let (order, executions) = engine.get_order_status(&buy_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.remaining, dec!(70));
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].shares, dec!(30));

        let b_account = store.get_account("B").await.unwrap().unwrap();
        // reserve debited the full 1000; the 30-share fill paid the seller directly and
        // left none of it with the buyer, so canceling the remaining 70 refunds 700.
        assert_eq!(b_account.balance, dec!(700));
    }

    #[tokio::test]
    async fn cancel_of_non_open_order_fails() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap();
        seed_account(&engine, &store, "B", dec!(500)).await;
        engine.reserve("B", "SPY", dec!(5), dec!(10)).await.unwrap();
        let order_id = engine.place_order("B", "SPY", dec!(5), dec!(10)).await.unwrap();

        engine.cancel_order(&order_id).await.unwrap();
        let result = engine.cancel_order(&order_id).await;
        assert!(matches!(result, Err(MatchError::NotOpen(_))));
    }
}
