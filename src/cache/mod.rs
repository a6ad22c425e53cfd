//! Cache Coordinator — in-process balance cache with pattern invalidation.
//!
//! Appropriate for the single-instance deployment model this crate targets
//! (SPEC_FULL.md §2.1); a multi-instance deployment would swap this for a
//! shared cache without changing call sites, since correctness never
//! depends on the cache (§4.8 — best effort only).

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    value: i64,
    inserted_at: Instant,
}

pub struct CacheCoordinator {
    ttl: Duration,
    balances: DashMap<String, Entry>,
}

impl CacheCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            balances: DashMap::new(),
        }
    }

    pub fn get_balance(&self, key: &str) -> Option<i64> {
        match self.balances.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.value),
            _ => None,
        }
    }

    pub fn put_balance(&self, key: String, value: i64) {
        self.balances.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Invalidates every cached entry for the given user, e.g. after a
    /// committed reserve/return/consume/adjust/credit. Best-effort: a
    /// failure to invalidate only degrades read performance, never
    /// correctness.
    pub fn invalidate_user(&self, user_id: uuid::Uuid) {
        let prefix = format!("inventory:{user_id}:");
        let before = self.balances.len();
        self.balances.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - self.balances.len();
        debug!(%user_id, removed, "invalidated user balance cache entries");
    }

    /// Periodic sweep to drop stale entries proactively rather than relying
    /// solely on lazy TTL checks at read time.
    pub fn sweep_expired(&self) {
        self.balances
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_invalidation_only_affects_one_user() {
        let cache = CacheCoordinator::new(Duration::from_secs(60));
        let user_a = uuid::Uuid::new_v4();
        let user_b = uuid::Uuid::new_v4();
        cache.put_balance(format!("inventory:{user_a}:x"), 1);
        cache.put_balance(format!("inventory:{user_b}:x"), 2);

        cache.invalidate_user(user_a);

        assert!(cache.get_balance(&format!("inventory:{user_a}:x")).is_none());
        assert_eq!(cache.get_balance(&format!("inventory:{user_b}:x")), Some(2));
    }

    #[test]
    fn expired_entry_not_returned() {
        let cache = CacheCoordinator::new(Duration::from_millis(1));
        cache.put_balance("k".to_string(), 5);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get_balance("k"), None);
    }
}
