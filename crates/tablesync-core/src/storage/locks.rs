//! Per-key mutual exclusion.
//!
//! `KeyLocks` hands out one async mutex per string key. Holders of different
//! keys never contend; holders of the same key are serialized. Acquisition can
//! be bounded by a timeout so callers never wait indefinitely.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle slots are pruned once the map grows past this many entries.
const PRUNE_THRESHOLD: usize = 1024;

/// A table of async mutexes keyed by string.
#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the holder owns the lock for `key`. Dropping it releases the lock.
#[derive(Debug)]
pub struct KeyLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLockGuard {
    /// The key this guard protects.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() > PRUNE_THRESHOLD {
            // A slot referenced only by the map is neither held nor awaited.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Wait for the lock on `key`.
    pub async fn lock(&self, key: &str) -> KeyLockGuard {
        let guard = self.slot(key).lock_owned().await;
        KeyLockGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Wait at most `timeout` for the lock on `key`.
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Option<KeyLockGuard> {
        tokio::time::timeout(timeout, self.lock(key)).await.ok()
    }

    /// Take the lock on `key` only if it is free right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyLockGuard> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(KeyLockGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Lock several keys, in sorted order so that concurrent multi-key callers
    /// cannot deadlock. Duplicate keys are locked once. The whole acquisition
    /// shares one `timeout`; on expiry every lock taken so far is released.
    pub async fn lock_many<'a, I>(&self, keys: I, timeout: Duration) -> Option<Vec<KeyLockGuard>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ordered: BTreeSet<&str> = keys.into_iter().collect();
        let acquire = async move {
            let mut guards = Vec::with_capacity(ordered.len());
            for key in ordered {
                guards.push(self.lock(key).await);
            }
            guards
        };
        tokio::time::timeout(timeout, acquire).await.ok()
    }

    /// Number of keys with a live slot.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no slot exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyLocks::new();
        let held = locks.lock("r1").await;
        assert_eq!(held.key(), "r1");
        assert!(locks.try_lock("r1").is_none());
        drop(held);
        assert!(locks.try_lock("r1").is_some());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = KeyLocks::new();
        let _a = locks.lock("a").await;
        assert!(locks.try_lock("b").is_some());
    }

    #[tokio::test]
    async fn lock_timeout_gives_up() {
        let locks = KeyLocks::new();
        let _held = locks.lock("r1").await;
        let waited = locks.lock_timeout("r1", Duration::from_millis(20)).await;
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn lock_many_dedups_and_releases_on_timeout() {
        let locks = KeyLocks::new();
        let guards = locks
            .lock_many(["b", "a", "b"], Duration::from_secs(1))
            .await
            .unwrap();
        let keys: Vec<&str> = guards.iter().map(KeyLockGuard::key).collect();
        assert_eq!(keys, vec!["a", "b"]);
        drop(guards);

        let _b = locks.lock("b").await;
        let blocked = locks
            .lock_many(["a", "b"], Duration::from_millis(20))
            .await;
        assert!(blocked.is_none());
        assert!(locks.try_lock("a").is_some());
    }
}
