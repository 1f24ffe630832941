//! Keyed async mutexes.
//!
//! Conversation keys (user pair or group) and recipient inboxes each get
//! their own lock so that unrelated traffic never contends. Acquire the
//! conversation lock before the inbox lock.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        // The shard guard must be gone before awaiting.
        let mutex = self.locks.entry(key).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns how many went away.
    pub fn purge_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::<&'static str>::new());
        let guard = locks.lock("dm:alice:bob").await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock("dm:alice:bob").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::<&'static str>::new();
        let _a = locks.lock("group:1").await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock("group:2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purge_keeps_held_locks() {
        let locks = KeyLocks::<u32>::new();
        let held = locks.lock(1).await;
        drop(locks.lock(2).await);

        assert_eq!(locks.purge_idle(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.purge_idle(), 1);
    }
}
