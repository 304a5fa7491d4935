use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Factory + policy for one kind of pooled resource (backend
/// connections, child processes, translation sockets).
pub trait StockClass: Send + Sync + 'static {
    type Item: Send + 'static;

    fn create(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Item, StockError>> + Send + '_>>;

    /// Revalidate an idle item before reuse; `false` discards it.
    fn validate(&self, _item: &mut Self::Item) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StockError {
    #[error("failed to create stock item: {0}")]
    Create(#[source] std::io::Error),
    #[error("stock is shutting down")]
    ShuttingDown,
}

struct IdleItem<T> {
    item: T,
    score: i32,
    since: Instant,
}

struct KeySlot<T> {
    sem: Arc<Semaphore>,
    idle: Mutex<Vec<IdleItem<T>>>,
}

/// A keyed pool of homogeneous resources with a per-key capacity limit
/// and LRU idle management. `get()` waits when the key is at capacity;
/// idle items are reused best-score-first and expire after
/// `idle_timeout`.
pub struct Stock<C: StockClass> {
    class: C,
    limit_per_key: usize,
    max_idle_per_key: usize,
    idle_timeout: Duration,
    slots: dashmap::DashMap<String, Arc<KeySlot<C::Item>>>,
}

impl<C: StockClass> Stock<C> {
    pub fn new(class: C, limit_per_key: usize, max_idle_per_key: usize) -> Self {
        Self {
            class,
            limit_per_key,
            max_idle_per_key,
            idle_timeout: Duration::from_secs(60),
            slots: dashmap::DashMap::new(),
        }
    }

    pub fn with_idle_timeout(mut self, t: Duration) -> Self {
        self.idle_timeout = t;
        self
    }

    fn slot(&self, key: &str) -> Arc<KeySlot<C::Item>> {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeySlot {
                    sem: Arc::new(Semaphore::new(self.limit_per_key)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Borrow an item for `key`, creating one if no idle item survives
    /// validation. Suspends while the key is at capacity.
    pub async fn get(&self, key: &str) -> Result<StockLease<C::Item>, StockError> {
        let slot = self.slot(key);
        let permit = slot
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StockError::ShuttingDown)?;

        loop {
            let candidate = {
                let mut idle = slot.idle.lock().unwrap();
                // best score last; prefer it
                idle.pop()
            };
            let Some(mut candidate) = candidate else { break };
            if candidate.since.elapsed() <= self.idle_timeout
                && self.class.validate(&mut candidate.item)
            {
                trace!("stock: reusing idle item, key={}", key);
                return Ok(StockLease {
                    item: Some(candidate.item),
                    score: candidate.score,
                    slot,
                    max_idle: self.max_idle_per_key,
                    _permit: Some(permit),
                });
            }
            // expired or invalid; drop and try the next one
        }

        let item = self.class.create(key).await?;
        Ok(StockLease {
            item: Some(item),
            score: 0,
            slot,
            max_idle: self.max_idle_per_key,
            _permit: Some(permit),
        })
    }

    /// Drop all idle items of every key.
    pub fn flush_idle(&self) {
        for slot in self.slots.iter() {
            slot.value().idle.lock().unwrap().clear();
        }
    }
}

/// A scoped borrow of a stock item. Returning it with `release(true)`
/// marks it reusable; dropping the lease (or `release(false)`) discards
/// the item.
pub struct StockLease<T: Send + 'static> {
    item: Option<T>,
    score: i32,
    slot: Arc<KeySlot<T>>,
    max_idle: usize,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: Send + 'static> StockLease<T> {
    pub fn get_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease already released")
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    /// Take the item out of the lease, keeping the capacity permit
    /// alive. Pair with `restore()` or let the returned parts drop.
    pub fn into_parts(mut self) -> (T, StockReturn<T>) {
        let item = self.item.take().unwrap();
        (
            item,
            StockReturn {
                score: self.score,
                slot: self.slot.clone(),
                max_idle: self.max_idle,
                _permit: self._permit.take(),
            },
        )
    }

    pub fn release(mut self, reuse: bool, score_delta: i32) {
        if let Some(item) = self.item.take() {
            return_item(
                &self.slot,
                self.max_idle,
                item,
                self.score + score_delta,
                reuse,
            );
        }
    }
}

impl<T: Send + 'static> Drop for StockLease<T> {
    fn drop(&mut self) {
        // an un-released lease discards its item; the permit returns
        // capacity automatically
    }
}

/// The put-back half of a split lease.
pub struct StockReturn<T: Send + 'static> {
    score: i32,
    slot: Arc<KeySlot<T>>,
    max_idle: usize,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<T: Send + 'static> StockReturn<T> {
    pub fn put(self, item: T, reuse: bool, score_delta: i32) {
        return_item(&self.slot, self.max_idle, item, self.score + score_delta, reuse);
    }
}

fn return_item<T>(slot: &KeySlot<T>, max_idle: usize, item: T, score: i32, reuse: bool) {
    if !reuse {
        return;
    }
    let mut idle = slot.idle.lock().unwrap();
    idle.push(IdleItem {
        item,
        score,
        since: Instant::now(),
    });
    // keep best-score at the tail for pop(); evict the worst overflow
    idle.sort_by_key(|i| i.score);
    if idle.len() > max_idle {
        idle.remove(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        created: AtomicUsize,
    }

    impl StockClass for Counter {
        type Item = usize;

        fn create(
            &self,
            _key: &str,
        ) -> Pin<Box<dyn Future<Output = Result<usize, StockError>> + Send + '_>> {
            Box::pin(async move { Ok(self.created.fetch_add(1, Ordering::SeqCst)) })
        }
    }

    fn new_stock(limit: usize) -> Stock<Counter> {
        Stock::new(
            Counter {
                created: AtomicUsize::new(0),
            },
            limit,
            4,
        )
    }

    #[tokio::test]
    async fn reuses_released_items() {
        let stock = new_stock(2);
        let lease = stock.get("a").await.unwrap();
        lease.release(true, 1);

        let mut lease = stock.get("a").await.unwrap();
        assert_eq!(*lease.get_mut(), 0, "should reuse item 0");
        assert_eq!(lease.score(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_discards() {
        let stock = new_stock(2);
        drop(stock.get("a").await.unwrap());
        let mut lease = stock.get("a").await.unwrap();
        assert_eq!(*lease.get_mut(), 1, "discarded item not reused");
    }

    #[tokio::test]
    async fn capacity_limits_concurrency() {
        let stock = Arc::new(new_stock(1));
        let lease = stock.get("a").await.unwrap();

        let stock2 = stock.clone();
        let waiter = tokio::spawn(async move { stock2.get("a").await.unwrap().release(true, 0) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        lease.release(true, 0);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let stock = new_stock(1);
        let _a = stock.get("a").await.unwrap();
        // a second key must not be blocked by the first key's capacity
        let _b = stock.get("b").await.unwrap();
    }
}
