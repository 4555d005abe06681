//! Boot-relative time sources.
//!
//! Everything in the upload pipeline that reasons about "when" uses elapsed
//! realtime (time since boot) rather than wall-clock time, so that NTP jumps
//! can't refill a token bucket or flush the holding area early.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of boot-relative time.
pub trait Clock: Send + Sync {
    /// Time elapsed since boot.
    fn elapsed_realtime(&self) -> Duration;

    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock backed by the tokio timer.
///
/// Uses `tokio::time::Instant` so that paused-time tests drive it together
/// with the holding area's margin timer.
#[derive(Debug, Clone)]
pub struct SystemClock {
    started: tokio::time::Instant,
    uptime_at_start: Duration,
}

impl SystemClock {
    /// Create a clock, anchored at the current system uptime when available.
    pub fn new() -> Self {
        Self {
            started: tokio::time::Instant::now(),
            uptime_at_start: read_system_uptime().unwrap_or_default(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed_realtime(&self) -> Duration {
        self.uptime_at_start + self.started.elapsed()
    }
}

/// Reads `/proc/uptime`. Returns `None` on platforms without it.
fn read_system_uptime() -> Option<Duration> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(Duration::from_secs_f64(secs))
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn at(now: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FakeClock {
    fn elapsed_realtime(&self) -> Duration {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }
}

/// Collection timestamp attached to every uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedTime {
    #[serde(rename = "elapsed_realtime_ms", with = "duration_ms")]
    pub elapsed_realtime: Duration,

    pub linux_boot_id: String,

    pub boot_count: u32,

    pub timestamp: DateTime<Utc>,
}

impl CombinedTime {
    /// Capture the current time from `clock`.
    pub fn now(clock: &dyn Clock, linux_boot_id: impl Into<String>, boot_count: u32) -> Self {
        Self {
            elapsed_realtime: clock.elapsed_realtime(),
            linux_boot_id: linux_boot_id.into(),
            boot_count,
            timestamp: clock.now_utc(),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Converts a boot-relative duration to signed milliseconds.
pub fn as_millis_i64(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_set_and_advance() {
        let clock = FakeClock::at(Duration::from_secs(5));
        assert_eq!(clock.elapsed_realtime(), Duration::from_secs(5));

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.elapsed_realtime(), Duration::from_millis(5_250));

        clock.set(Duration::ZERO);
        assert_eq!(clock.elapsed_realtime(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_tokio_time() {
        let clock = SystemClock::new();
        let before = clock.elapsed_realtime();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(clock.elapsed_realtime() - before, Duration::from_secs(10));
    }

    #[test]
    fn test_combined_time_serializes_elapsed_as_millis() {
        let clock = FakeClock::at(Duration::from_millis(318_362));
        let time = CombinedTime::now(&clock, "9649a5cb", 1);
        let json = serde_json::to_value(&time).unwrap();
        assert_eq!(json["elapsed_realtime_ms"], 318_362);
        assert_eq!(json["boot_count"], 1);

        let back: CombinedTime = serde_json::from_value(json).unwrap();
        assert_eq!(back, time);
    }
}
