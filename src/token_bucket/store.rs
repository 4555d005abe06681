//! Persisted, keyed rate limiter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::bucket::{BucketParams, TokenBucketMap};
use crate::config::{FeatureFlag, RateLimitingSettings, SettingsHandle};
use crate::metrics::{rate_limit_counter, BuiltinMetrics};
use crate::storage::{get_json_or_default, set_json, KeyValueStore};
use crate::time::{as_millis_i64, Clock};

/// Keyed token buckets backed by one entry of a [`KeyValueStore`].
///
/// All edits are serialized by one lock over the cached map, so two takes on
/// the same key never observe the same count. New buckets take their policy
/// from the current settings; existing buckets keep the policy they were
/// created with until reconciled by an explicit [`BucketParams`].
pub struct TokenBucketStore {
    storage: Arc<dyn KeyValueStore>,

    /// Storage key of the persisted map
    storage_key: String,

    settings: SettingsHandle,

    clock: Arc<dyn Clock>,

    metrics: Arc<BuiltinMetrics>,

    dev_mode: FeatureFlag,

    /// Map read from storage on first use
    cache: Mutex<Option<TokenBucketMap>>,
}

impl TokenBucketStore {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        storage_key: impl Into<String>,
        settings: SettingsHandle,
        clock: Arc<dyn Clock>,
        metrics: Arc<BuiltinMetrics>,
        dev_mode: FeatureFlag,
    ) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
            settings,
            clock,
            metrics,
            dev_mode,
            cache: Mutex::new(None),
        }
    }

    /// Try to take one token for `key` with the store's default policy.
    ///
    /// Returns `false` when rate-limited and counts it under `tag`.
    pub fn take_simple(&self, key: &str, tag: &str) -> bool {
        self.take(key, BucketParams::default(), tag)
    }

    /// Try to take one token for `key`, reconciling the bucket with `params`.
    pub fn take(&self, key: &str, params: BucketParams, tag: &str) -> bool {
        if self.dev_mode.is_enabled() {
            return true;
        }
        if key.is_empty() {
            warn!(tag = tag, "Refusing token bucket take with an empty key");
            return false;
        }

        let policy = self.policy();
        let now_ms = self.now_ms();
        let allowed = self.edit(|map| map.upsert_bucket(key, params, &policy, now_ms).take(now_ms));

        if !allowed {
            self.metrics.increment(&rate_limit_counter(tag));
            debug!(key = key, tag = tag, "Rate limit applied");
        }
        allowed
    }

    /// Drop every bucket. Idempotent.
    pub fn reset(&self) {
        self.edit(TokenBucketMap::reset);
    }

    /// Drop buckets that are full again and so carry no state.
    pub fn prune(&self) -> usize {
        let now_ms = self.now_ms();
        self.edit(|map| map.prune(now_ms))
    }

    /// Rebase stored timestamps after a reboot. `previous_uptime` is how long
    /// the previous boot ran.
    pub fn handle_linux_reboot(&self, previous_uptime: Duration) {
        let previous_uptime_ms = as_millis_i64(previous_uptime);
        self.edit(|map| map.rebase_after_reboot(previous_uptime_ms));
        info!(
            storage_key = %self.storage_key,
            previous_uptime_secs = previous_uptime.as_secs(),
            "Token buckets rebased after reboot"
        );
    }

    /// Copy of the current map.
    pub fn snapshot(&self) -> TokenBucketMap {
        self.edit(|map| map.clone())
    }

    fn policy(&self) -> RateLimitingSettings {
        self.settings.get().rate_limiting
    }

    fn now_ms(&self) -> i64 {
        as_millis_i64(self.clock.elapsed_realtime())
    }

    /// Run `f` on the cached map, persisting only if it changed.
    fn edit<R>(&self, f: impl FnOnce(&mut TokenBucketMap) -> R) -> R {
        let mut guard = self.lock();
        let map = guard
            .get_or_insert_with(|| get_json_or_default(self.storage.as_ref(), &self.storage_key));

        let before = map.clone();
        let result = f(map);

        if *map != before {
            if let Err(e) = set_json(self.storage.as_ref(), &self.storage_key, map) {
                warn!(
                    storage_key = %self.storage_key,
                    error = %e,
                    "Failed to persist token buckets"
                );
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, Option<TokenBucketMap>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
