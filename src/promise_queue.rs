// promise_queue.rs - Per-key FIFO async serializer
//
// `OfflineRepository` uses this exclusively to serialize mutations per
// `(appKey, collection)` key; reads bypass it entirely (§4.1).

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serializes async work per key while letting independent keys run in parallel.
///
/// Implemented as a concurrent map from key to a per-key `tokio::sync::Mutex`;
/// registering a new key never blocks unrelated keys, and `tokio::sync::Mutex`
/// is not poisoned by a panicking task, so a failed enqueued task never wedges
/// the queue for its key.
#[derive(Default)]
pub struct PromiseQueue {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PromiseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` only after every previously enqueued task for `key` has resolved.
    pub async fn enqueue<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_key_orders_completion() {
        let queue = Arc::new(PromiseQueue::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let q1 = queue.clone();
        let o1 = order.clone();
        let t1 = tokio::spawn(async move {
            q1.enqueue("books", || async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                o1.lock().unwrap().push(1);
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;

        let q2 = queue.clone();
        let o2 = order.clone();
        let t2 = tokio::spawn(async move {
            q2.enqueue("books", || async move {
                o2.lock().unwrap().push(2);
            })
            .await;
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn independent_keys_do_not_block_each_other() {
        let queue = Arc::new(PromiseQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let q1 = queue.clone();
        let c1 = count.clone();
        let t1 = tokio::spawn(async move {
            q1.enqueue("books", || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });

        let q2 = queue.clone();
        let c2 = count.clone();
        let t2 = tokio::spawn(async move {
            q2.enqueue("authors", || async move {
                c2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        // "authors" should have completed well before "books" given no shared key.
        t2.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        t1.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_task_does_not_block_subsequent_tasks() {
        let queue = Arc::new(PromiseQueue::new());

        let q1 = queue.clone();
        let t1 = tokio::spawn(async move {
            q1.enqueue("books", || async move {
                panic!("boom");
            })
            .await;
        });
        let _ = t1.await; // panics inside the task, caught by JoinHandle

        let result = queue.enqueue("books", || async { 42 }).await;
        assert_eq!(result, 42);
    }
}
