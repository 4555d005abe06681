//! Internal diagnostic counters.
//!
//! Counters are reported to the backend by an external collaborator; this
//! module only accumulates them.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Prefix of the per-tag counter incremented whenever a token bucket refuses a
/// take.
pub const RATE_LIMIT_APPLIED: &str = "rate_limit_applied";

/// Counter names for upload results.
pub const UPLOAD_SUCCESS: &str = "upload_success";
pub const UPLOAD_RETRY: &str = "upload_retry";
pub const UPLOAD_FAILURE: &str = "upload_failure";

/// Process-wide counter store.
#[derive(Debug, Default)]
pub struct BuiltinMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl BuiltinMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name` by one.
    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, by: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += by;
        }
    }

    /// Current value of `name` (0 if never incremented).
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(name).copied())
            .unwrap_or(0)
    }

    /// Copy of every counter, for reporting.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

/// Name of the counter for a rate-limited `tag`.
pub fn rate_limit_counter(tag: &str) -> String {
    format!("{}_{}", RATE_LIMIT_APPLIED, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_snapshot() {
        let metrics = BuiltinMetrics::new();
        assert_eq!(metrics.get(UPLOAD_SUCCESS), 0);

        metrics.increment(UPLOAD_SUCCESS);
        metrics.increment(UPLOAD_SUCCESS);
        metrics.add(UPLOAD_RETRY, 3);

        assert_eq!(metrics.get(UPLOAD_SUCCESS), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get(UPLOAD_RETRY), Some(&3));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_rate_limit_counter_name() {
        assert_eq!(rate_limit_counter("reboot"), "rate_limit_applied_reboot");
    }
}
