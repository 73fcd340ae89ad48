//! Replay-protection nonce cache (spec §4.2).
//!
//! Entries are evicted lazily on insert (sweep a bounded number of the
//! oldest entries) and can additionally be swept on a timer by the owning
//! [`crate::SecurityKernel`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;

pub struct NonceCache {
    seen: DashMap<String, DateTime<Utc>>,
    ttl_seconds: i64,
}

impl std::fmt::Debug for NonceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceCache")
            .field("tracked", &self.seen.len())
            .finish()
    }
}

impl NonceCache {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_seconds,
        }
    }

    fn is_expired(&self, seen_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - seen_at).num_seconds() >= self.ttl_seconds
    }

    /// Returns `true` if `nonce` was not already present (and records it),
    /// `false` if it is a replay within the TTL window. A previously-seen
    /// nonce whose entry has aged past the TTL is treated as fresh and may
    /// be reused — the concrete scenario in spec §8 explicitly allows
    /// either choice; this kernel picks "reusable after TTL".
    pub fn check_and_insert(&self, nonce: &str) -> bool {
        let now = Utc::now();
        self.lazy_sweep(now);

        if let Some(seen_at) = self.seen.get(nonce) {
            if !self.is_expired(*seen_at, now) {
                return false;
            }
        }
        self.seen.insert(nonce.to_string(), now);
        true
    }

    /// Evict a bounded number of expired entries on every insert, plus a
    /// full pass available to a periodic sweeper task.
    fn lazy_sweep(&self, now: DateTime<Utc>) {
        const MAX_EVICTIONS_PER_CALL: usize = 64;
        let mut evicted = 0;
        self.seen.retain(|_, seen_at| {
            if evicted >= MAX_EVICTIONS_PER_CALL {
                return true;
            }
            let keep = !self.is_expired(*seen_at, now);
            if !keep {
                evicted += 1;
            }
            keep
        });
    }

    /// Full sweep, intended to be called periodically.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.seen.retain(|_, seen_at| !self.is_expired(*seen_at, now));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_accepted_second_is_rejected() {
        let cache = NonceCache::new(300);
        assert!(cache.check_and_insert("n1"));
        assert!(!cache.check_and_insert("n1"));
    }

    #[test]
    fn distinct_nonces_are_independent() {
        let cache = NonceCache::new(300);
        assert!(cache.check_and_insert("n1"));
        assert!(cache.check_and_insert("n2"));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = NonceCache::new(-1); // already-expired TTL for this test
        cache.check_and_insert("n1");
        cache.sweep();
        assert!(cache.is_empty());
    }
}
