//! Per-resource async mutual exclusion.
//!
//! One extraction body runs per resource key at a time; unrelated keys
//! never contend. Each lock also remembers the last value published under
//! it, so callers that queued behind a running extraction can reuse its
//! result instead of repeating the upstream work.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Default number of keys kept before idle locks are pruned.
pub const DEFAULT_MAX_LOCKS: usize = 4096;

struct Slot<T> {
    published: Option<(Instant, T)>,
}

/// Registry of lazily created per-key locks.
pub struct LockRegistry<T> {
    locks: DashMap<String, Arc<Mutex<Slot<T>>>>,
    max_entries: usize,
}

impl<T: Clone + Send> LockRegistry<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            locks: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> ResourceGuard<T> {
        let arrived = Instant::now();
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot { published: None })))
            .clone();

        if self.locks.len() > self.max_entries {
            self.prune();
        }

        let guard = lock.lock_owned().await;
        ResourceGuard { guard, arrived }
    }

    /// Drop locks nobody holds or waits on.
    pub fn prune(&self) {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let pruned = before.saturating_sub(self.locks.len());
        if pruned > 0 {
            tracing::debug!("pruned {pruned} idle resource locks");
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<T: Clone + Send> Default for LockRegistry<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOCKS)
    }
}

/// Exclusive access to one resource; released on drop.
pub struct ResourceGuard<T> {
    guard: OwnedMutexGuard<Slot<T>>,
    arrived: Instant,
}

impl<T: Clone> ResourceGuard<T> {
    /// A value published by a holder that finished while this caller waited.
    pub fn shared(&self) -> Option<T> {
        match &self.guard.published {
            Some((at, value)) if *at >= self.arrived => Some(value.clone()),
            _ => None,
        }
    }

    /// Publish the result of this holder's work for queued callers.
    pub fn publish(&mut self, value: T) {
        self.guard.published = Some((Instant::now(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let registry = Arc::new(LockRegistry::<u32>::default());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("instagram:user:a").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let registry = LockRegistry::<u32>::default();
        let _a = registry.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), registry.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_sees_published_value() {
        let registry = Arc::new(LockRegistry::<u32>::default());
        let mut first = registry.acquire("k").await;
        assert!(first.shared().is_none());

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire("k").await.shared() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.publish(7);
        drop(first);

        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_later_arrival_ignores_stale_value() {
        let registry = LockRegistry::<u32>::default();
        {
            let mut guard = registry.acquire("k").await;
            guard.publish(1);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        let guard = registry.acquire("k").await;
        assert!(guard.shared().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let registry = LockRegistry::<u32>::new(2);
        let held = registry.acquire("held").await;
        drop(registry.acquire("idle-1").await);
        drop(registry.acquire("idle-2").await);

        registry.prune();
        assert_eq!(registry.len(), 1);
        drop(held);
        registry.prune();
        assert!(registry.is_empty());
    }
}
