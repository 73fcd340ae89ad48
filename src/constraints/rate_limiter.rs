//! Token-bucket rate limiting, keyed by `(principal_id, resource_uri)`
//! (spec §4.5).

use crate::error::{ConstraintError, ConstraintKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    last_touch: DateTime<Utc>,
}

pub struct RateLimiter {
    buckets: DashMap<(String, String), Bucket>,
    refill_period_seconds: f64,
    bucket_ttl_seconds: i64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked_buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(refill_period_seconds: f64, bucket_ttl_seconds: i64) -> Self {
        Self {
            buckets: DashMap::new(),
            refill_period_seconds,
            bucket_ttl_seconds,
        }
    }

    fn refill(&self, bucket: &mut Bucket, max_tokens: u32, now: DateTime<Utc>) {
        let elapsed = (now - bucket.last_refill).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return;
        }
        let rate = max_tokens as f64 / self.refill_period_seconds;
        bucket.tokens = (bucket.tokens + elapsed * rate).min(max_tokens as f64);
        bucket.last_refill = now;
    }

    /// Consume a single token from `(principal_id, resource_uri)`'s bucket,
    /// whose capacity is `max_tokens`. A freshly created bucket starts full.
    pub fn consume(
        &self,
        principal_id: &str,
        resource_uri: &str,
        max_tokens: u32,
    ) -> Result<(), ConstraintError> {
        let now = Utc::now();
        let key = (principal_id.to_string(), resource_uri.to_string());
        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: max_tokens as f64,
            last_refill: now,
            last_touch: now,
        });

        self.refill(&mut entry, max_tokens, now);
        entry.last_touch = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            Ok(())
        } else {
            let mut ctx = HashMap::new();
            ctx.insert("remaining".to_string(), format!("{:.2}", entry.tokens));
            Err(ConstraintError {
                kind: ConstraintKind::RateLimit,
                ctx,
            })
        }
    }

    /// Remove every bucket whose `last_touch` is older than `bucket_ttl_seconds`.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| (now - bucket.last_touch).num_seconds() < self.bucket_ttl_seconds);
        before - self.buckets.len()
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }
}
