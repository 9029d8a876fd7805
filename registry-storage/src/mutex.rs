//! Key-partitioned critical sections
//!
//! The blob store offers no locking, so single-writer semantics for
//! read-modify-write sequences are emulated in-process: operations
//! submitted under the same key run one at a time, in submission
//! order, while distinct keys proceed concurrently. The lock is
//! cooperative and advisory only; it protects nothing against other
//! processes.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// A process-local, key-partitioned asynchronous mutex.
///
/// Each adapter instance owns its own `KeyedMutex`, so separate
/// instances (and separate tests) never contend with each other.
///
/// Acquisition is FIFO per key: tokio's mutex queues waiters fairly,
/// so operations enter their critical sections in the order
/// [`acquire`](KeyedMutex::acquire) was awaited. Re-acquiring a key
/// from within its own critical section deadlocks; don't.
#[derive(Debug, Default, Clone)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    /// Create a new mutex with no keys held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` while holding the lock for `key`.
    ///
    /// The lock is released exactly once, whether the operation
    /// completes or errors; its output (including any error) is
    /// returned unchanged. No retry is performed.
    pub async fn acquire<F, T>(&self, key: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self
            .locks
            .entry(key.to_owned())
            .or_default()
            .value()
            .clone();

        let output = {
            let _guard = lock.lock().await;
            tracing::trace!(%key, "acquired lock");
            operation.await
        };

        // Evict the key once no task holds a handle to its lock, so
        // the map does not grow with every distinct key ever locked.
        // Waiters clone the Arc under the map's shard lock, so a
        // strong count of one means only the map itself remains.
        drop(lock);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Tracks how many critical sections for a key are live at once.
    #[derive(Debug, Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn same_key_never_overlaps() {
        let mutex = KeyedMutex::new();
        let gauge = Arc::new(Gauge::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let mutex = mutex.clone();
            let gauge = Arc::clone(&gauge);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                mutex
                    .acquire("left-pad", async {
                        gauge.enter();
                        order.lock().await.push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        gauge.exit();
                    })
                    .await;
            }));
            // Stagger submissions so the expected order is well defined.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(gauge.peak(), 1, "critical sections overlapped");
        assert_eq!(&*order.lock().await, &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let mutex = KeyedMutex::new();
        let gauge = Arc::new(Gauge::default());

        let mut tasks = Vec::new();
        for key in ["a", "b", "c", "d"] {
            let mutex = mutex.clone();
            let gauge = Arc::clone(&gauge);
            tasks.push(tokio::spawn(async move {
                mutex
                    .acquire(key, async {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        gauge.exit();
                    })
                    .await;
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(gauge.peak() > 1, "distinct keys were serialized");
    }

    #[tokio::test]
    async fn released_keys_are_evicted() {
        let mutex = KeyedMutex::new();

        mutex.acquire("left-pad", async {}).await;
        assert!(mutex.locks.is_empty());

        // Contended keys are evicted once the last holder is done.
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            tasks.push(tokio::spawn(async move {
                mutex.acquire("left-pad", async {}).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(mutex.locks.is_empty());
    }

    #[tokio::test]
    async fn error_releases_lock() {
        let mutex = KeyedMutex::new();

        let result: Result<(), &str> = mutex.acquire("key", async { Err("boom") }).await;
        assert_eq!(result, Err("boom"));

        // The key is free again.
        let result: Result<(), &str> = mutex.acquire("key", async { Ok(()) }).await;
        assert!(result.is_ok());
    }
}
