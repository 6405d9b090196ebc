// cache_read.rs - CacheRead<T>: the two-value observable read Cache mode
// returns (§9 Design Notes): the value already in the local cache, plus a
// handle to the network-synced value that lands once the background refresh
// completes.

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A read that already has a cached answer and will eventually have a
/// network-confirmed one. Built on a `tokio::sync::oneshot` pair rather than
/// a full stream since there are exactly two values, never more.
pub struct CacheRead<T> {
    pub cached: T,
    synced: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> CacheRead<T> {
    /// Returns `cached` immediately and spawns `synced` in the background,
    /// making its eventual result available via [`CacheRead::await_synced`].
    pub fn new<Fut>(cached: T, synced: Fut) -> Self
    where
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(synced.await);
        });
        Self { cached, synced: rx }
    }

    /// Waits for the network-synced value. Resolves to an error if the
    /// background task was dropped before completing, which should only
    /// happen if the runtime is shutting down.
    pub async fn await_synced(self) -> Result<T> {
        self.synced
            .await
            .map_err(|_| Error::Kinvey("cache-synced read was dropped before completion".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_value_is_immediate_and_synced_resolves_later() {
        let read = CacheRead::new(1, async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(2)
        });
        assert_eq!(read.cached, 1);
        assert_eq!(read.await_synced().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn synced_failure_surfaces_through_await_synced() {
        let read = CacheRead::new(1, async { Err(Error::NotFound("x".into())) });
        assert!(read.await_synced().await.is_err());
    }
}
