//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{CounterStore, Lifetime};
use crate::error::{Result, TollgateError};

/// A stored counter and its optional expiry deadline.
#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// A [`CounterStore`] that keeps counters in a concurrent map.
///
/// Every primitive holds the shard lock of its key for the whole
/// read-modify-write, which gives the same per-key atomicity a Redis
/// server does. Expired counters are dropped when touched, and by
/// [`cleanup_task`](Self::cleanup_task) for keys that are never seen again.
///
/// Limits are per-process, so this store is meant for tests and for
/// single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a counter that never expires, replacing any existing one.
    ///
    /// This reproduces a key written by something other than a limiter.
    pub fn set_without_expiry(&self, key: &str, value: i64) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: None,
            },
        );
    }

    /// Current value of a live counter.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.value)
    }

    /// Delete a counter. Returns `true` if a live counter was removed.
    pub fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        matches!(self.slots.remove(key), Some((_, slot)) if !slot.is_expired(now))
    }

    /// Drop every expired counter. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }

    /// Purge expired counters every `interval`, forever.
    pub async fn cleanup_task(self: Arc<Self>, interval: Duration) {
        let mut cleanup_interval = tokio::time::interval(interval);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            cleanup_interval.tick().await;
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = self.len(), "Purged expired windows");
            }
        }
    }

    /// Run [`cleanup_task`](Self::cleanup_task) on the current Tokio runtime.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).cleanup_task(interval))
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove all counters.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn create_if_absent(&self, key: &str, initial: i64, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = Slot {
            value: initial,
            expires_at: Some(now + ttl),
        };

        let created = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };

        trace!(key = %key, created, "create_if_absent");
        Ok(created)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            value: 0,
            expires_at: None,
        });

        if slot.is_expired(now) {
            *slot = Slot {
                value: 0,
                expires_at: None,
            };
        }

        slot.value = slot
            .value
            .checked_add(1)
            .ok_or_else(|| TollgateError::Store(format!("counter overflow at \"{}\"", key)))?;

        trace!(key = %key, value = slot.value, "increment");
        Ok(slot.value)
    }

    async fn remaining_lifetime(&self, key: &str) -> Result<Lifetime> {
        let now = Instant::now();
        let lifetime = match self.slots.entry(key.to_string()) {
            Entry::Vacant(_) => Lifetime::Absent,
            Entry::Occupied(occupied) => {
                let expires_at = occupied.get().expires_at;
                match expires_at {
                    None => Lifetime::NoExpiry,
                    Some(deadline) if deadline <= now => {
                        occupied.remove();
                        Lifetime::Absent
                    }
                    Some(deadline) => Lifetime::Expires(deadline - now),
                }
            }
        };
        Ok(lifetime)
    }

    async fn set_lifetime(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let applied = match self.slots.entry(key.to_string()) {
            Entry::Vacant(_) => false,
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    false
                } else {
                    occupied.get_mut().expires_at = Some(now + ttl);
                    true
                }
            }
        };
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_create_if_absent_only_once() {
        let store = MemoryStore::new();

        assert!(store.create_if_absent("k", 1, PERIOD).await.unwrap());
        assert!(!store.create_if_absent("k", 1, PERIOD).await.unwrap());
        assert_eq!(store.get("k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_existing_counter() {
        let store = MemoryStore::new();
        store.create_if_absent("k", 1, PERIOD).await.unwrap();

        assert_eq!(store.increment("k").await.unwrap(), 2);
        assert_eq!(store.increment("k").await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_missing_counter_has_no_expiry() {
        let store = MemoryStore::new();

        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(
            store.remaining_lifetime("k").await.unwrap(),
            Lifetime::NoExpiry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_lifetime_counts_down() {
        let store = MemoryStore::new();
        store.create_if_absent("k", 1, PERIOD).await.unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(
            store.remaining_lifetime("k").await.unwrap(),
            Lifetime::Expires(Duration::from_millis(300))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counter_is_absent() {
        let store = MemoryStore::new();
        store.create_if_absent("k", 1, PERIOD).await.unwrap();

        tokio::time::advance(PERIOD).await;

        assert_eq!(store.get("k"), None);
        assert_eq!(
            store.remaining_lifetime("k").await.unwrap(),
            Lifetime::Absent
        );
        assert!(store.create_if_absent("k", 1, PERIOD).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_lifetime() {
        let store = MemoryStore::new();
        store.set_without_expiry("stray", 5);

        assert!(store.set_lifetime("stray", PERIOD).await.unwrap());
        assert_eq!(
            store.remaining_lifetime("stray").await.unwrap(),
            Lifetime::Expires(PERIOD)
        );
        assert!(!store.set_lifetime("missing", PERIOD).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.create_if_absent("short", 1, PERIOD).await.unwrap();
        store
            .create_if_absent("long", 1, Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(PERIOD).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_drops_windows_never_touched_again() {
        let store = Arc::new(MemoryStore::new());
        for client in 0..1000 {
            store
                .create_if_absent(&format!("limiter:api:{}", client), 1, Duration::from_millis(100))
                .await
                .unwrap();
        }
        store
            .create_if_absent("limiter:api:long", 1, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(store.len(), 1001);

        let cleanup = store.spawn_cleanup(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("limiter:api:long"), Some(1));
        cleanup.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        store.create_if_absent("k", 0, Duration::from_secs(60)).await.unwrap();

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k").await.unwrap() })
            })
            .collect();

        let mut seen = Vec::with_capacity(handles.len());
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    store
                        .create_if_absent("fresh", 1, Duration::from_secs(60))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }
}
