//! A single rate-limit bucket and the keyed map of buckets that gets persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RateLimitingSettings;
use crate::time::{as_millis_i64, duration_ms};

/// Time assumed to pass between the last moment before a reboot and the
/// first moment of the new boot.
pub const BOOT_TIME: Duration = Duration::from_secs(3 * 60);

/// Rate-limit counter for one key. Times are boot-relative milliseconds and
/// may be negative after a reboot rebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: u32,

    pub count: u32,

    #[serde(rename = "period_ms", with = "duration_ms")]
    pub period: Duration,

    pub last_refill_ms: i64,

    /// Creation or last successful take; orders eviction.
    #[serde(default)]
    pub last_used_ms: i64,
}

impl TokenBucket {
    /// A full bucket created at `now_ms`.
    pub fn new(capacity: u32, period: Duration, now_ms: i64) -> Self {
        Self {
            capacity,
            count: capacity,
            period,
            last_refill_ms: now_ms,
            last_used_ms: now_ms,
        }
    }

    /// Refill to capacity if a whole period has elapsed since the last refill.
    pub fn feed(&mut self, now_ms: i64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed >= as_millis_i64(self.period) {
            self.count = self.capacity;
            self.last_refill_ms = now_ms;
        }
    }

    /// Feed, then consume one token if any is left.
    pub fn take(&mut self, now_ms: i64) -> bool {
        self.feed(now_ms);
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        self.last_used_ms = now_ms;
        true
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    /// Apply a new policy, keeping `count` within the new capacity.
    fn reconcile(&mut self, capacity: Option<u32>, period: Option<Duration>) {
        if let Some(capacity) = capacity {
            self.capacity = capacity;
            self.count = self.count.min(capacity);
        }
        if let Some(period) = period {
            self.period = period;
        }
    }

    fn rebase(&mut self, previous_uptime_ms: i64) {
        let boot_time_ms = as_millis_i64(BOOT_TIME);
        self.last_refill_ms = -(previous_uptime_ms - self.last_refill_ms).max(0) - boot_time_ms;
        self.last_used_ms = -(previous_uptime_ms - self.last_used_ms).max(0) - boot_time_ms;
    }
}

/// Optional per-call policy. `None` fields fall back to the store's settings
/// for new buckets and leave existing buckets untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: Option<u32>,
    pub period: Option<Duration>,
}

/// Keyed buckets, persisted as one JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenBucketMap {
    buckets: BTreeMap<String, TokenBucket>,
}

impl TokenBucketMap {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&TokenBucket> {
        self.buckets.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Return the bucket for `key`, creating it from `policy` (evicting to
    /// stay within `policy.max_buckets`) when absent.
    pub fn upsert_bucket(
        &mut self,
        key: &str,
        params: BucketParams,
        policy: &RateLimitingSettings,
        now_ms: i64,
    ) -> &mut TokenBucket {
        if !self.buckets.contains_key(key) {
            let max_buckets = policy.max_buckets.max(1);
            while self.buckets.len() >= max_buckets {
                if self.evict_one(now_ms).is_none() {
                    break;
                }
            }
        }

        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(
                params.capacity.unwrap_or(policy.capacity),
                params.period.unwrap_or(policy.period),
                now_ms,
            )
        });
        bucket.reconcile(params.capacity, params.period);
        bucket
    }

    /// Remove one bucket: the least recently used among buckets that are full
    /// after feeding, otherwise the least recently used overall. Ties break
    /// on key order.
    fn evict_one(&mut self, now_ms: i64) -> Option<String> {
        for bucket in self.buckets.values_mut() {
            bucket.feed(now_ms);
        }

        let least_recent = |full_only: bool| {
            self.buckets
                .iter()
                .filter(|(_, bucket)| !full_only || bucket.is_full())
                .min_by(|(key_a, a), (key_b, b)| {
                    a.last_used_ms
                        .cmp(&b.last_used_ms)
                        .then_with(|| key_a.cmp(key_b))
                })
                .map(|(key, _)| key.clone())
        };

        let victim = least_recent(true).or_else(|| least_recent(false))?;
        self.buckets.remove(&victim);
        Some(victim)
    }

    /// Drop every bucket that is full after feeding. Returns how many were
    /// dropped.
    pub fn prune(&mut self, now_ms: i64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.feed(now_ms);
            !bucket.is_full()
        });
        before - self.buckets.len()
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }

    /// Move every timestamp into the timeline of a new boot.
    pub fn rebase_after_reboot(&mut self, previous_uptime_ms: i64) {
        for bucket in self.buckets.values_mut() {
            bucket.rebase(previous_uptime_ms);
        }
    }
}
