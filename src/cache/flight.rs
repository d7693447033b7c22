//! Single-flight coalescing.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Coalesces concurrent calls with the same key into one outstanding
/// operation whose result every waiter shares.
///
/// If the operation fails, the next waiter runs its own attempt, so at most
/// one call is outstanding per key at any instant.
pub struct FlightGroup<T> {
    inflight: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<T: Clone> FlightGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` for `key`, unless a flight for `key` is already underway,
    /// in which case await and share its result.
    pub async fn run<F, Fut, E>(&self, key: &str, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_try_init(op).await.cloned();

        // Retire this flight so later callers start fresh (the completed
        // result lives in the cache, not here). Waiters already holding the
        // cell still read from it.
        self.inflight
            .remove_if(key, |_, current| Arc::ptr_eq(current, &cell));

        result
    }

    #[cfg(test)]
    pub(crate) fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_call() {
        let group = Arc::new(FlightGroup::<String>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>("shared".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.inflight_len(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let group = FlightGroup::<u32>::new();
        let a = group.run("a", || async { Ok::<_, ()>(1) }).await.unwrap();
        let b = group.run("b", || async { Ok::<_, ()>(2) }).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn failed_flight_allows_retry() {
        let group = FlightGroup::<u32>::new();
        let first: Result<u32, &str> = group.run("k", || async { Err("down") }).await;
        assert!(first.is_err());

        let second = group.run("k", || async { Ok::<_, &str>(7) }).await;
        assert_eq!(second.unwrap(), 7);
    }
}
