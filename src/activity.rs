//! The activity tracker. Grounded on `fritztv/src/manager.rs`'s
//! `ClientGuard`/`AtomicUsize` client-count plus idle-cleanup spawned loop,
//! generalized into a standalone tracker background workers cooperate with.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::info;

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const RESUME_DEBOUNCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StreamSession {
    pub peer: IpAddr,
    pub started_at: Instant,
    pub last_activity_at: Instant,
}

struct Inner {
    sessions: RwLock<HashMap<i64, StreamSession>>,
    paused: RwLock<bool>,
    notify: Notify,
    generation: std::sync::atomic::AtomicU64,
}

/// Tracks live streaming sessions and drives pause/resume of background
/// work. All transitions go through `sessions`/`paused`'s locks so waiters
/// observe a consistent view.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Inner>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                paused: RwLock::new(false),
                notify: Notify::new(),
                generation: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// Upserts the session and (re)arms its inactivity timer. Transitions to
    /// paused on the first active session.
    pub async fn register_activity(&self, file_id: i64, peer: IpAddr) {
        let now = Instant::now();
        let was_empty = {
            let mut sessions = self.inner.sessions.write().await;
            let was_empty = sessions.is_empty();
            sessions
                .entry(file_id)
                .and_modify(|s| s.last_activity_at = now)
                .or_insert(StreamSession {
                    peer,
                    started_at: now,
                    last_activity_at: now,
                });
            was_empty
        };

        if was_empty {
            self.set_paused(true).await;
        } else {
            crate::metrics::ACTIVE_STREAMS.set(self.inner.sessions.read().await.len() as i64);
        }

        self.spawn_expiry_watch(file_id, now);
    }

    fn spawn_expiry_watch(&self, file_id: i64, registered_at: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_TIMEOUT).await;
            let expired_last = {
                let mut sessions = this.inner.sessions.write().await;
                match sessions.get(&file_id) {
                    Some(s) if s.last_activity_at == registered_at => {
                        sessions.remove(&file_id);
                        Some(sessions.is_empty())
                    }
                    _ => None,
                }
            };
            if let Some(was_last) = expired_last {
                crate::metrics::ACTIVE_STREAMS.set(this.inner.sessions.read().await.len() as i64);
                if was_last {
                    this.debounced_resume().await;
                }
            }
        });
    }

    async fn debounced_resume(&self) {
        let generation = self
            .inner
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESUME_DEBOUNCE).await;
            if this.inner.generation.load(std::sync::atomic::Ordering::SeqCst) != generation {
                return; // a newer session arrived during the debounce window
            }
            if this.inner.sessions.read().await.is_empty() {
                this.set_paused(false).await;
            }
        });
    }

    async fn set_paused(&self, paused: bool) {
        let mut guard = self.inner.paused.write().await;
        if *guard == paused {
            return;
        }
        *guard = paused;
        drop(guard);
        crate::metrics::WORKER_PAUSED.set(paused as i64);
        if paused {
            info!("background work paused: streaming session active");
        } else {
            info!("background work resumed: no active streaming sessions");
        }
        self.inner.notify.notify_waiters();
    }

    pub async fn is_paused(&self) -> bool {
        *self.inner.paused.read().await
    }

    /// Blocks until not-paused. Background tasks must call this at safe
    /// yield points.
    pub async fn wait_if_busy(&self) {
        loop {
            if !self.is_paused().await {
                return;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Like `wait_if_busy` but bounded; returns `true` if the timeout fired
    /// before the tracker became unpaused.
    pub async fn wait_if_busy_with_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_if_busy())
            .await
            .is_err()
    }

    pub async fn force_pause(&self) {
        self.set_paused(true).await;
    }

    pub async fn force_resume(&self) {
        self.set_paused(false).await;
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn register_activity_pauses_immediately() {
        let tracker = ActivityTracker::new();
        assert!(!tracker.is_paused().await);
        tracker.register_activity(1, localhost()).await;
        assert!(tracker.is_paused().await);
    }

    #[tokio::test]
    async fn wait_if_busy_returns_once_resumed() {
        let tracker = ActivityTracker::new();
        tracker.force_pause().await;
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_if_busy().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.force_resume().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_if_busy_with_timeout_reports_timeout() {
        let tracker = ActivityTracker::new();
        tracker.force_pause().await;
        let timed_out = tracker
            .wait_if_busy_with_timeout(Duration::from_millis(50))
            .await;
        assert!(timed_out);
    }
}
