//! Small cross-cutting helpers shared by more than one component.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Per-key single-flight: concurrent callers for the same key share one
/// execution of the supplied future and all receive its result. Grounds
/// the chunk cache's in-flight map, built on `tokio::sync::OnceCell` rather than a
/// dedicated single-flight crate.
pub struct SingleFlightGroup<K, V> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlightGroup<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlightGroup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` at most once per outstanding `key`; any caller that arrives
    /// while a call for `key` is already in flight awaits that call's result
    /// instead of starting a new one.
    pub async fn work<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut guard = self.inflight.lock();
            guard.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let result = cell.get_or_init(f).await.clone();
        let mut guard = self.inflight.lock();
        if let Some(existing) = guard.get(&key) {
            if Arc::ptr_eq(existing, &cell) {
                guard.remove(&key);
            }
        }
        result
    }
}

/// Rounds `offset` down to the nearest multiple of `chunk_size`.
pub fn align_down(offset: u64, chunk_size: u64) -> u64 {
    offset - (offset % chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn align_down_rounds_to_chunk_boundary() {
        assert_eq!(align_down(0, 1 << 20), 0);
        assert_eq!(align_down(500, 1 << 20), 0);
        assert_eq!(align_down(1 << 20, 1 << 20), 1 << 20);
        assert_eq!(align_down((1 << 20) + 5, 1 << 20), 1 << 20);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_callers() {
        let group: Arc<SingleFlightGroup<&'static str, u32>> = Arc::new(SingleFlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .work("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        42
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
