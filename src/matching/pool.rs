use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::store::Store;

use super::room::SymbolRoom;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("room already present in pool")]
    AlreadyPresent,
}

struct LruState {
    /// front = least recently used, back = most recently used.
    order: VecDeque<String>,
    rooms: HashMap<String, Arc<SymbolRoom>>,
}

/// Bounded LRU cache of SymbolRooms keyed by symbol, with pin-aware eviction (C4). The
/// whole list lives behind one short mutex rather than an intrusive pointer-linked list
/// plus a separate concurrent map (§9 design note).
pub struct RoomPool {
    limit: usize,
    side_book_max_size: usize,
    side_book_min_size: usize,
    store: Arc<dyn Store>,
    state: Mutex<LruState>,
}

impl RoomPool {
    pub fn new(limit: usize, side_book_max_size: usize, side_book_min_size: usize, store: Arc<dyn Store>) -> Self {
        assert!(limit >= 10, "RoomPool limit must be >= 10");
        Self {
            limit,
            side_book_max_size,
            side_book_min_size,
            store,
            state: Mutex::new(LruState {
                order: VecDeque::new(),
                rooms: HashMap::new(),
            }),
        }
    }

    /// Looks up `symbol`, marking it MRU on hit. Does not acquire the room's own lock.
    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolRoom>> {
        let mut state = self.state.lock();
        if let Some(pos) = state.order.iter().position(|s| s == symbol) {
            state.order.remove(pos);
            state.order.push_back(symbol.to_string());
        }
        state.rooms.get(symbol).cloned()
    }

    /// Inserts at MRU; evicts LRU-first (skipping pinned rooms) if now over `limit`.
    pub fn put(&self, room: Arc<SymbolRoom>) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let symbol = room.symbol().to_string();
        if state.rooms.contains_key(&symbol) {
            return Err(PoolError::AlreadyPresent);
        }
        state.rooms.insert(symbol.clone(), room);
        state.order.push_back(symbol);

        if state.rooms.len() > self.limit {
            self.evict_to_limit(&mut state);
        }
        Ok(())
    }

    /// Pin-aware eviction: walk LRU → MRU, evicting the first room whose pin count is 0.
    /// If every room is pinned, oversubscription is tolerated rather than blocking.
    fn evict_to_limit(&self, state: &mut LruState) {
        while state.rooms.len() > self.limit {
            let mut evicted_symbol = None;
            for symbol in state.order.iter() {
                if let Some(room) = state.rooms.get(symbol) {
                    if let Some(_guard) = room.try_lock() {
                        evicted_symbol = Some(symbol.clone());
                        break;
                    }
                }
            }
            match evicted_symbol {
                Some(symbol) => {
                    state.rooms.remove(&symbol);
                    if let Some(pos) = state.order.iter().position(|s| s == &symbol) {
                        state.order.remove(pos);
                    }
                    debug!(symbol = %symbol, "evicted symbol room from pool");
                }
                None => {
                    debug!(size = state.rooms.len(), limit = self.limit, "every room pinned, tolerating oversubscription");
                    break;
                }
            }
        }
    }

    /// Gets the room for `symbol`, or creates, primes, and inserts a fresh one if absent
    /// (§4.6.2 step 3). Tolerates a racing concurrent creation by discarding its own room
    /// and re-fetching the winner's.
    pub async fn get_or_create(&self, symbol: &str) -> Arc<SymbolRoom> {
        if let Some(room) = self.get(symbol) {
            return room;
        }

        let room = Arc::new(SymbolRoom::new(
            symbol,
            self.side_book_max_size,
            self.side_book_min_size,
            self.store.clone(),
        ));
        room.prime().await;

        match self.put(room.clone()) {
            Ok(()) => room,
            Err(PoolError::AlreadyPresent) => self.get(symbol).expect("just inserted by a racing put"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn pool(limit: usize) -> RoomPool {
        RoomPool::new(limit, 50, 5, Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn get_or_create_then_get_returns_same_room() {
        let pool = pool(10);
        let room = pool.get_or_create("SPY").await;
        let again = pool.get("SPY").unwrap();
        assert!(Arc::ptr_eq(&room, &again));
    }

    #[tokio::test]
    async fn evicts_lru_unpinned_room_over_limit() {
        let pool = pool(10);
        for i in 0..11 {
            pool.get_or_create(&format!("SYM{i}")).await;
        }
        // SYM0 was least recently touched and is unpinned, so it's evicted first.
        assert!(pool.get("SYM0").is_none());
        assert!(pool.get("SYM10").is_some());
    }

    #[tokio::test]
    async fn pinned_room_survives_eviction_attempt() {
        let pool = pool(10);
        let pinned = pool.get_or_create("SYM0").await;
        let _held = pinned.lock().await;
        for i in 1..11 {
            pool.get_or_create(&format!("SYM{i}")).await;
        }
        assert!(pool.get("SYM0").is_some());
    }
}
