//! Reboot event production and boot tracking.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SettingsHandle;
use crate::storage::{get_json_or_default, set_json, KeyValueStore};
use crate::time::{duration_ms, CombinedTime};
use crate::token_bucket::TokenBucketStore;
use crate::upload::{EnqueueError, UploadEnqueuer, UploadHandle, UploadMetadata};

/// Token bucket key and metric tag for reboot events.
pub const REBOOT_EVENT_KEY: &str = "reboot-event";
pub const REBOOT_EVENT_TAG: &str = "reboot";

const LAST_TRACKED_BOOT_COUNT_KEY: &str = "last_tracked_boot_count";
const LAST_LINUX_BOOT_KEY: &str = "last_linux_boot";

/// Android `sys.boot.reason`, split into its comma separated parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndroidBootReason {
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subreason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<String>,
}

impl AndroidBootReason {
    /// Parse `reason[,subreason[,breadcrumb...]]`. A missing property maps to
    /// `reboot,bort_unknown`.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = raw.unwrap_or("reboot,bort_unknown");
        let mut parts = raw.split(',').map(str::to_string);
        Self {
            reason: parts.next().unwrap_or_default(),
            subreason: parts.next(),
            breadcrumbs: parts.collect(),
        }
    }
}

/// Uploaded once per untracked boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootEvent {
    pub boot_count: u32,

    pub boot_reason: AndroidBootReason,

    pub time: CombinedTime,
}

/// Remembers the last boot count a reboot event was produced for.
pub struct BootCountTracker {
    storage: Arc<dyn KeyValueStore>,
}

impl BootCountTracker {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Returns `true` the first time `boot_count` is seen.
    pub fn track_if_needed(&self, boot_count: u32) -> bool {
        let last: Option<u32> = get_json_or_default(self.storage.as_ref(), LAST_TRACKED_BOOT_COUNT_KEY);
        if last == Some(boot_count) {
            return false;
        }
        if let Err(e) = set_json(self.storage.as_ref(), LAST_TRACKED_BOOT_COUNT_KEY, &boot_count) {
            warn!(error = %e, "Failed to persist tracked boot count");
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LastLinuxBoot {
    boot_id: String,
    #[serde(default)]
    boot_count: u32,
    #[serde(rename = "uptime_ms", with = "duration_ms")]
    uptime: Duration,
}

/// Detects Linux reboots by comparing the kernel boot id with the last one
/// recorded. Counts boots and remembers how long the previous boot ran.
pub struct LinuxBootTracker {
    storage: Arc<dyn KeyValueStore>,
}

impl LinuxBootTracker {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Record the current boot. Returns the previous boot's last recorded
    /// uptime if the boot id changed since the last call.
    pub fn check(&self, boot_id: &str, uptime: Duration) -> Option<Duration> {
        let last = self.load();
        let (boot_count, previous_uptime) = match &last {
            Some(last) if last.boot_id == boot_id => (last.boot_count, None),
            Some(last) => {
                info!(previous_boot_id = %last.boot_id, boot_id = boot_id, "Linux reboot detected");
                (last.boot_count.saturating_add(1), Some(last.uptime))
            }
            None => (1, None),
        };
        self.store(&LastLinuxBoot {
            boot_id: boot_id.to_string(),
            boot_count,
            uptime,
        });
        previous_uptime
    }

    /// Remember how long the current boot has been running.
    pub fn record_uptime(&self, boot_id: &str, uptime: Duration) {
        let boot_count = self.boot_count();
        self.store(&LastLinuxBoot {
            boot_id: boot_id.to_string(),
            boot_count,
            uptime,
        });
    }

    /// Boots seen so far, starting at 1 for the first recorded boot.
    pub fn boot_count(&self) -> u32 {
        self.load().map(|last| last.boot_count).unwrap_or_default()
    }

    fn load(&self) -> Option<LastLinuxBoot> {
        get_json_or_default(self.storage.as_ref(), LAST_LINUX_BOOT_KEY)
    }

    fn store(&self, current: &LastLinuxBoot) {
        if let Err(e) = set_json(self.storage.as_ref(), LAST_LINUX_BOOT_KEY, current) {
            warn!(error = %e, "Failed to persist Linux boot state");
        }
    }
}

/// Reads the kernel's random boot id.
pub fn read_linux_boot_id() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|id| id.trim().to_string())
}

/// Produces one reboot event per untracked boot, rate-limited through the
/// token bucket store.
pub struct RebootEventUploader {
    store: Arc<TokenBucketStore>,
    enqueuer: Arc<dyn UploadEnqueuer>,
    settings: SettingsHandle,
    boot_reason: Option<String>,
}

impl RebootEventUploader {
    pub fn new(
        store: Arc<TokenBucketStore>,
        enqueuer: Arc<dyn UploadEnqueuer>,
        settings: SettingsHandle,
        boot_reason: Option<String>,
    ) -> Self {
        Self {
            store,
            enqueuer,
            settings,
            boot_reason,
        }
    }

    /// Enqueue a reboot event for `boot_count` unless disabled or
    /// rate-limited.
    pub async fn handle_untracked_boot_count(
        &self,
        boot_count: u32,
        time: CombinedTime,
    ) -> Result<Option<UploadHandle>, EnqueueError> {
        if !self.settings.get().reboot_events_enabled {
            return Ok(None);
        }
        if !self.store.take_simple(REBOOT_EVENT_KEY, REBOOT_EVENT_TAG) {
            info!(boot_count = boot_count, "Reboot event rate-limited");
            return Ok(None);
        }

        let event = RebootEvent {
            boot_count,
            boot_reason: AndroidBootReason::parse(self.boot_reason.as_deref()),
            time: time.clone(),
        };
        info!(
            boot_count = boot_count,
            reason = %event.boot_reason.reason,
            "Uploading reboot event"
        );
        let handle = self
            .enqueuer
            .enqueue_metadata(UploadMetadata::Reboot { event }, time)
            .await?;
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlag, Settings};
    use crate::metrics::{rate_limit_counter, BuiltinMetrics};
    use crate::storage::MemoryKeyValueStore;
    use crate::time::FakeClock;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingEnqueuer {
        metadata: Mutex<Vec<UploadMetadata>>,
    }

    #[async_trait]
    impl UploadEnqueuer for RecordingEnqueuer {
        async fn enqueue_upload(
            &self,
            _file: PathBuf,
            _metadata: UploadMetadata,
            _collection_time: CombinedTime,
        ) -> Result<UploadHandle, EnqueueError> {
            unreachable!("reboot events carry no file")
        }

        async fn enqueue_metadata(
            &self,
            metadata: UploadMetadata,
            _collection_time: CombinedTime,
        ) -> Result<UploadHandle, EnqueueError> {
            self.metadata.lock().unwrap().push(metadata);
            Ok(UploadHandle {
                id: Uuid::new_v4(),
                name: "upload.reboot".to_string(),
            })
        }
    }

    fn uploader(
        settings: Settings,
        enqueuer: Arc<RecordingEnqueuer>,
        metrics: Arc<BuiltinMetrics>,
    ) -> RebootEventUploader {
        let settings = SettingsHandle::new(settings);
        let store = TokenBucketStore::new(
            Arc::new(MemoryKeyValueStore::new()),
            "token_buckets.reboot",
            settings.clone(),
            Arc::new(FakeClock::default()),
            metrics,
            FeatureFlag::new(false),
        );
        RebootEventUploader::new(
            Arc::new(store),
            enqueuer,
            settings,
            Some("reboot,userrequested".to_string()),
        )
    }

    fn time(boot_count: u32) -> CombinedTime {
        CombinedTime::now(&FakeClock::default(), "boot-id", boot_count)
    }

    #[test]
    fn test_parse_boot_reason() {
        let cases: [(Option<&str>, &str, Option<&str>, &[&str]); 6] = [
            (None, "reboot", Some("bort_unknown"), &[]),
            (Some(""), "", None, &[]),
            (Some("reboot"), "reboot", None, &[]),
            (Some("reboot,userrequested"), "reboot", Some("userrequested"), &[]),
            (Some("shutdown,battery,thermal"), "shutdown", Some("battery"), &["thermal"]),
            (
                Some("shutdown,battery,thermal,50C"),
                "shutdown",
                Some("battery"),
                &["thermal", "50C"],
            ),
        ];
        for (raw, reason, subreason, breadcrumbs) in cases {
            let parsed = AndroidBootReason::parse(raw);
            assert_eq!(parsed.reason, reason, "{:?}", raw);
            assert_eq!(parsed.subreason.as_deref(), subreason, "{:?}", raw);
            assert_eq!(parsed.breadcrumbs, breadcrumbs, "{:?}", raw);
        }
    }

    #[test]
    fn test_boot_count_tracked_once() {
        let tracker = BootCountTracker::new(Arc::new(MemoryKeyValueStore::new()));
        assert!(tracker.track_if_needed(7));
        assert!(!tracker.track_if_needed(7));
        assert!(tracker.track_if_needed(8));
    }

    #[test]
    fn test_linux_boot_change_reports_previous_uptime() {
        let tracker = LinuxBootTracker::new(Arc::new(MemoryKeyValueStore::new()));
        assert_eq!(tracker.check("a", Duration::from_secs(10)), None);
        assert_eq!(tracker.boot_count(), 1);
        tracker.record_uptime("a", Duration::from_secs(600));
        assert_eq!(tracker.check("a", Duration::from_secs(700)), None);
        assert_eq!(tracker.boot_count(), 1);
        assert_eq!(
            tracker.check("b", Duration::from_secs(5)),
            Some(Duration::from_secs(700))
        );
        assert_eq!(tracker.boot_count(), 2);
    }

    #[tokio::test]
    async fn test_reboot_event_enqueued() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let uploader = uploader(Settings::default(), enqueuer.clone(), Arc::new(BuiltinMetrics::new()));

        let handle = uploader.handle_untracked_boot_count(3, time(3)).await.unwrap();
        assert!(handle.is_some());

        let metadata = enqueuer.metadata.lock().unwrap();
        match &metadata[..] {
            [UploadMetadata::Reboot { event }] => {
                assert_eq!(event.boot_count, 3);
                assert_eq!(event.boot_reason.subreason.as_deref(), Some("userrequested"));
            }
            other => panic!("unexpected uploads: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reboot_events_are_rate_limited() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let metrics = Arc::new(BuiltinMetrics::new());
        let mut settings = Settings::default();
        settings.rate_limiting.capacity = 5;
        let uploader = uploader(settings, enqueuer.clone(), metrics.clone());

        for boot_count in 0..15 {
            uploader
                .handle_untracked_boot_count(boot_count, time(boot_count))
                .await
                .unwrap();
        }

        assert_eq!(enqueuer.metadata.lock().unwrap().len(), 5);
        assert_eq!(metrics.get(&rate_limit_counter(REBOOT_EVENT_TAG)), 10);
    }

    #[tokio::test]
    async fn test_disabled_reboot_events_skip_bucket() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let mut settings = Settings::default();
        settings.reboot_events_enabled = false;
        let uploader = uploader(settings, enqueuer.clone(), Arc::new(BuiltinMetrics::new()));

        assert!(uploader.handle_untracked_boot_count(1, time(1)).await.unwrap().is_none());
        assert!(enqueuer.metadata.lock().unwrap().is_empty());
    }
}
