use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::store::Store;

use super::types::{RestingOrder, Side};

/// A compile-time comparator supplying the side's priority rule (§9 design note: the
/// source's generic heap + runtime comparator becomes a parameterized priority queue
/// with a comparator trait/function, instantiated once per side).
pub trait OrderComparator: Send + Sync + 'static {
    const SIDE: Side;

    /// True if `a` has strictly higher priority than `b` and should be popped first.
    fn is_better(a: &RestingOrder, b: &RestingOrder) -> bool;
}

pub struct BuyComparator;
impl OrderComparator for BuyComparator {
    const SIDE: Side = Side::Buy;

    fn is_better(a: &RestingOrder, b: &RestingOrder) -> bool {
        match a.price.cmp(&b.price) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => a.timestamp < b.timestamp,
        }
    }
}

pub struct SellComparator;
impl OrderComparator for SellComparator {
    const SIDE: Side = Side::Sell;

    fn is_better(a: &RestingOrder, b: &RestingOrder) -> bool {
        match a.price.cmp(&b.price) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.timestamp < b.timestamp,
        }
    }
}

struct HeapEntry<C: OrderComparator> {
    order: RestingOrder,
    _marker: PhantomData<C>,
}

impl<C: OrderComparator> HeapEntry<C> {
    fn new(order: RestingOrder) -> Self {
        Self {
            order,
            _marker: PhantomData,
        }
    }
}

impl<C: OrderComparator> PartialEq for HeapEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}
impl<C: OrderComparator> Eq for HeapEntry<C> {}

impl<C: OrderComparator> PartialOrd for HeapEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: OrderComparator> Ord for HeapEntry<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        if C::is_better(&self.order, &other.order) {
            Ordering::Greater
        } else if C::is_better(&other.order, &self.order) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

/// A bounded priority queue of resting Orders for one side of one symbol (C2). The book
/// is a cache, not a complete order book: the Store is ground truth, and low-priority
/// entries evicted under high water are simply re-pulled on the next refill.
pub struct SideBook<C: OrderComparator> {
    symbol: String,
    heap: BinaryHeap<HeapEntry<C>>,
    max_size: usize,
    min_size: usize,
    store: Option<Arc<dyn Store>>,
}

impl<C: OrderComparator> SideBook<C> {
    pub fn new(symbol: impl Into<String>, max_size: usize, min_size: usize) -> Self {
        assert!(min_size < max_size, "min_size must be < max_size");
        Self {
            symbol: symbol.into(),
            heap: BinaryHeap::new(),
            max_size,
            min_size,
            store: None,
        }
    }

    pub fn bind_store(&mut self, store: Arc<dyn Store>) {
        self.store = Some(store);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts a resting order; shrinks the tail under high water (§4.2).
    pub fn push(&mut self, order: RestingOrder) {
        self.heap.push(HeapEntry::new(order));
        if self.heap.len() > self.max_size {
            self.shrink();
        }
    }

    fn shrink(&mut self) {
        let target = self.max_size / 2;
        let mut entries: Vec<HeapEntry<C>> = std::mem::take(&mut self.heap).into_vec();
        entries.sort_by(|a, b| b.cmp(a));
        entries.truncate(target);
        self.heap = BinaryHeap::from(entries);
        debug!(symbol = %self.symbol, side = ?C::SIDE, kept = target, "shrunk sidebook under high water");
    }

    /// Pops the best resting order, refilling from Store first if depth is at or below
    /// `min_size` (§4.2). Non-fatal on any Store error: the in-memory book is left as-is.
    pub async fn pop(&mut self) -> Option<RestingOrder> {
        self.refill_if_needed().await;
        self.heap.pop().map(|e| e.order)
    }

    /// Same refill trigger as `pop`, without removing the element.
    pub async fn peek(&mut self) -> Option<RestingOrder> {
        self.refill_if_needed().await;
        self.heap.peek().map(|e| e.order.clone())
    }

    /// Re-inserts an order that was popped but did not cross (§4.6.3a).
    pub fn push_back(&mut self, order: RestingOrder) {
        self.heap.push(HeapEntry::new(order));
    }

    /// Triggers the same low-water refill `pop`/`peek` use, without touching the heap.
    /// Used to prime a freshly created book (§4.6.2 step 3).
    pub async fn refill_if_needed(&mut self) {
        if self.heap.len() > self.min_size {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };

        let target = (self.max_size + self.min_size) / 2;
        match store
            .get_open_orders_for_side(&self.symbol, C::SIDE, target as i64)
            .await
        {
            Ok(rows) => {
                self.heap = rows
                    .into_iter()
                    .map(|o| HeapEntry::new(RestingOrder::new(o.id, o.price, o.timestamp)))
                    .collect();
                debug!(symbol = %self.symbol, side = ?C::SIDE, pulled = self.heap.len(), "refilled sidebook from store");
            }
            Err(e) => {
                debug!(symbol = %self.symbol, side = ?C::SIDE, error = %e, "sidebook refill failed, leaving book as-is");
            }
        }
    }
}

pub type BuySideBook = SideBook<BuyComparator>;
pub type SellSideBook = SideBook<SellComparator>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn resting(id: &str, price: rust_decimal::Decimal, ts: i64) -> RestingOrder {
        RestingOrder::new(id.to_string(), price, ts)
    }

    #[tokio::test]
    async fn buy_book_orders_by_price_then_time() {
        let mut book: BuySideBook = SideBook::new("SPY", 100, 10);
        book.push(resting("1", dec!(10), 100));
        book.push(resting("2", dec!(12), 200));
        book.push(resting("3", dec!(12), 150));

        assert_eq!(book.pop().await.unwrap().id, "3"); // same price, earlier ts wins
        assert_eq!(book.pop().await.unwrap().id, "2");
        assert_eq!(book.pop().await.unwrap().id, "1");
        assert!(book.pop().await.is_none());
    }

    #[tokio::test]
    async fn sell_book_prefers_lowest_price() {
        let mut book: SellSideBook = SideBook::new("SPY", 100, 10);
        book.push(resting("1", dec!(11), 100));
        book.push(resting("2", dec!(9), 200));

        assert_eq!(book.pop().await.unwrap().id, "2");
        assert_eq!(book.pop().await.unwrap().id, "1");
    }

    #[tokio::test]
    async fn shrink_keeps_best_half_of_max_size() {
        let mut book: BuySideBook = SideBook::new("SPY", 4, 1);
        for i in 0..5 {
            book.push(resting(&i.to_string(), rust_decimal::Decimal::from(i), i as i64));
        }
        // max_size=4 -> shrink target is max_size/2 = 2
        assert_eq!(book.len(), 2);
        assert_eq!(book.pop().await.unwrap().id, "4");
        assert_eq!(book.pop().await.unwrap().id, "3");
    }

    #[tokio::test]
    async fn push_back_after_no_cross() {
        let mut book: SellSideBook = SideBook::new("SPY", 100, 10);
        book.push(resting("1", dec!(20), 100));
        let popped = book.pop().await.unwrap();
        book.push_back(popped);
        assert_eq!(book.len(), 1);
    }
}
