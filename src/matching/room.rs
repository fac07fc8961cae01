use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::store::Store;

use super::sidebook::{BuySideBook, SellSideBook};

/// The two SideBooks for one symbol, guarded together by one exclusive lock (C3).
pub struct RoomBooks {
    pub buy: BuySideBook,
    pub sell: SellSideBook,
}

/// Holds `(buy_book, sell_book)` plus a pin counter, following the same pin-aware lock
/// discipline as this codebase's buffer-pool style caches: `lock()` bumps the pin before
/// acquiring the mutex so a concurrent eviction attempt fails safely instead of racing.
pub struct SymbolRoom {
    symbol: String,
    pin: AtomicI64,
    inner: Mutex<RoomBooks>,
}

impl SymbolRoom {
    pub fn new(symbol: impl Into<String>, max_size: usize, min_size: usize, store: Arc<dyn Store>) -> Self {
        let symbol = symbol.into();
        let mut buy = BuySideBook::new(symbol.clone(), max_size, min_size);
        let mut sell = SellSideBook::new(symbol.clone(), max_size, min_size);
        buy.bind_store(store.clone());
        sell.bind_store(store);

        Self {
            symbol,
            pin: AtomicI64::new(0),
            inner: Mutex::new(RoomBooks { buy, sell }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn pin_count(&self) -> i64 {
        self.pin.load(Ordering::SeqCst)
    }

    pub fn is_evictable(&self) -> bool {
        self.pin_count() == 0
    }

    /// Primes both books from Store (§4.6.2 step 3). Cheap no-op once each book is above
    /// its low-water mark.
    pub async fn prime(&self) {
        let mut guard = self.inner.lock().await;
        guard.buy.refill_if_needed().await;
        guard.sell.refill_if_needed().await;
    }

    /// Acquires the exclusive room lock for the matching loop / settlement (§4.3, §5).
    /// Bumps the pin count first so `RoomPool` eviction skips this room until the guard
    /// is dropped.
    pub async fn lock(&self) -> RoomGuard<'_> {
        self.pin.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.lock().await;
        RoomGuard { room: self, guard }
    }

    /// Used only by RoomPool eviction: atomically requires pin == 0 before acquiring.
    pub fn try_lock(&self) -> Option<RoomGuard<'_>> {
        if self
            .pin
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        match self.inner.try_lock() {
            Ok(guard) => Some(RoomGuard { room: self, guard }),
            Err(_) => {
                self.pin.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }
}

pub struct RoomGuard<'a> {
    room: &'a SymbolRoom,
    guard: MutexGuard<'a, RoomBooks>,
}

impl Deref for RoomGuard<'_> {
    type Target = RoomBooks;
    fn deref(&self) -> &RoomBooks {
        &self.guard
    }
}

impl DerefMut for RoomGuard<'_> {
    fn deref_mut(&mut self) -> &mut RoomBooks {
        &mut self.guard
    }
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        self.room.pin.fetch_sub(1, Ordering::SeqCst);
    }
}
