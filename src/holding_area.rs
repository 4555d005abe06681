//! Holding area for files waiting to be uploaded.
//!
//! Files are held until an "event of interest" (a crash, a user bug report)
//! has been quiet for a trailing margin, so that files produced around the
//! same incident go out together. Each new event pushes the release back to
//! `last_event + trailing_margin`. Files that never see an event are released
//! after `max_hold`.
//!
//! [`FileUploadHoldingArea`] is the synchronous state machine; every
//! operation takes the current boot-relative time and returns the files it
//! released. [`HoldingAreaTask`] drives it from an mpsc channel with a
//! re-armed deadline timer and hands released files to an
//! [`UploadEnqueuer`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FileUploadHoldingAreaSettings, SettingsHandle};
use crate::storage::{get_json_or_default, set_json, KeyValueStore};
use crate::time::{duration_ms, Clock, CombinedTime};
use crate::upload::{delete_upload_file, EnqueueError, UploadEnqueuer, UploadMetadata};

/// Storage key of the persisted holding area.
pub const HOLDING_AREA_KEY: &str = "file_upload_holding_area";

/// Default channel capacity for the command sender/receiver.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A file owned by the holding area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldFile {
    pub id: Uuid,

    pub path: PathBuf,

    pub metadata: UploadMetadata,

    pub collection_time: CombinedTime,

    /// Boot-relative time the file entered the current batch
    #[serde(rename = "added_at_ms", with = "duration_ms")]
    pub added_at: Duration,
}

impl HeldFile {
    pub fn new(
        path: PathBuf,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
        added_at: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            metadata,
            collection_time,
            added_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    entries: Vec<HeldFile>,

    /// Sorted ascending, boot-relative milliseconds
    #[serde(default)]
    event_times_ms: Vec<u64>,

    /// Released but not yet accepted by the uploader
    #[serde(default)]
    in_flight: Vec<HeldFile>,
}

/// Where the holding area is in its hold/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldingState {
    Idle,
    Holding,
    Flushing,
}

/// How the uploader took a released file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    Accepted,
    /// The file disappeared before it could be handed off
    FileMissing,
    /// Anything else; the file goes back into the next batch
    Failed,
}

/// Statistics about holding area operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingAreaStats {
    pub files_added: u64,
    pub files_released: u64,
    pub files_dropped: u64,
    pub events_received: u64,
    pub events_dropped: u64,
    pub event_flushes: u64,
    pub timeout_flushes: u64,
}

/// The holding area state machine.
pub struct FileUploadHoldingArea {
    storage: Arc<dyn KeyValueStore>,
    settings: SettingsHandle,
    state: PersistedState,
    stats: HoldingAreaStats,
}

impl FileUploadHoldingArea {
    /// Restore from storage. Files that were in flight when the process died
    /// go back to the held set; any already accepted by the uploader were
    /// moved away and will be dropped as missing on the next hand-off.
    pub fn new(storage: Arc<dyn KeyValueStore>, settings: SettingsHandle) -> Self {
        let mut state: PersistedState = get_json_or_default(storage.as_ref(), HOLDING_AREA_KEY);
        if !state.in_flight.is_empty() {
            let mut entries = std::mem::take(&mut state.in_flight);
            entries.append(&mut state.entries);
            state.entries = entries;
        }
        Self {
            storage,
            settings,
            state,
            stats: HoldingAreaStats::default(),
        }
    }

    pub fn state(&self) -> HoldingState {
        if !self.state.in_flight.is_empty() {
            HoldingState::Flushing
        } else if !self.state.entries.is_empty() {
            HoldingState::Holding
        } else {
            HoldingState::Idle
        }
    }

    pub fn held(&self) -> &[HeldFile] {
        &self.state.entries
    }

    pub fn event_times(&self) -> Vec<Duration> {
        self.state
            .event_times_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn stats(&self) -> &HoldingAreaStats {
        &self.stats
    }

    /// Hold `file`. Returns anything that was already due at `now`.
    pub fn add(&mut self, mut file: HeldFile, now: Duration) -> Vec<HeldFile> {
        let released = self.settle(now);
        file.added_at = now;
        debug!(id = %file.id, kind = file.metadata.kind(), "Holding file for upload");
        self.state.entries.push(file);
        self.stats.files_added += 1;
        self.persist();
        released
    }

    /// Record an event of interest at `timestamp`, pushing the release back.
    pub fn handle_event_of_interest(&mut self, timestamp: Duration, now: Duration) -> Vec<HeldFile> {
        let mut released = self.settle(now);
        let settings = self.policy();

        // Arrival order; the bound drops the earliest arrivals.
        self.state.event_times_ms.push(duration_to_ms(timestamp));
        self.stats.events_received += 1;

        let max_events = settings.max_stored_events_of_interest.max(1);
        if self.state.event_times_ms.len() > max_events {
            let excess = self.state.event_times_ms.len() - max_events;
            self.state.event_times_ms.drain(0..excess);
            self.stats.events_dropped += excess as u64;
        }

        self.persist();
        released.extend(self.settle(now));
        released
    }

    /// Release whatever is due at `now`.
    pub fn handle_timeout(&mut self, now: Duration) -> Vec<HeldFile> {
        self.settle(now)
    }

    /// Earliest time at which something becomes due, if anything is held.
    pub fn next_deadline(&self) -> Option<Duration> {
        let settings = self.policy();
        let hold_deadline = self
            .state
            .entries
            .iter()
            .map(|entry| entry.added_at)
            .min()?
            .saturating_add(settings.max_hold);
        let events_deadline = self
            .last_event()
            .map(|last| last.saturating_add(settings.trailing_margin));

        Some(match events_deadline {
            Some(events_deadline) => events_deadline.min(hold_deadline),
            None => hold_deadline,
        })
    }

    /// Report how the uploader took a released file.
    pub fn complete_release(&mut self, id: Uuid, result: HandOff, now: Duration) {
        let Some(index) = self.state.in_flight.iter().position(|f| f.id == id) else {
            return;
        };
        let mut file = self.state.in_flight.remove(index);
        match result {
            HandOff::Accepted => {}
            HandOff::FileMissing => {
                self.stats.files_dropped += 1;
                warn!(id = %id, path = %file.path.display(), "Held file vanished, dropping it");
            }
            HandOff::Failed => {
                file.added_at = now;
                self.state.entries.push(file);
            }
        }
        self.persist();
    }

    /// Forget everything after a reboot. Returns the files to delete.
    pub fn handle_linux_reboot(&mut self) -> Vec<HeldFile> {
        info!("Linux reboot detected, wiping holding area");
        self.wipe()
    }

    /// Forget everything when uploads get disabled. Returns the files to
    /// delete.
    pub fn handle_change_enabled(&mut self, enabled: bool) -> Vec<HeldFile> {
        if enabled {
            return Vec::new();
        }
        info!("Uploads disabled, wiping holding area");
        self.wipe()
    }

    fn wipe(&mut self) -> Vec<HeldFile> {
        let state = std::mem::take(&mut self.state);
        self.stats.files_dropped += (state.entries.len() + state.in_flight.len()) as u64;
        self.persist();
        state.entries.into_iter().chain(state.in_flight).collect()
    }

    /// Release all entries once the events have been quiet for the margin
    /// (consuming the events), otherwise only entries held past `max_hold`.
    fn settle(&mut self, now: Duration) -> Vec<HeldFile> {
        let settings = self.policy();

        let events_due = self
            .last_event()
            .map(|last| last.saturating_add(settings.trailing_margin) <= now)
            .unwrap_or(false);

        let released: Vec<HeldFile> = if events_due {
            self.state.event_times_ms.clear();
            if !self.state.entries.is_empty() {
                self.stats.event_flushes += 1;
            }
            std::mem::take(&mut self.state.entries)
        } else {
            let (due, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.state.entries)
                .into_iter()
                .partition(|entry| entry.added_at.saturating_add(settings.max_hold) <= now);
            self.state.entries = held;
            if !due.is_empty() {
                self.stats.timeout_flushes += 1;
            }
            due
        };

        if released.is_empty() && !events_due {
            return released;
        }

        debug!(
            released = released.len(),
            still_held = self.state.entries.len(),
            "Releasing held files"
        );
        self.stats.files_released += released.len() as u64;
        self.state.in_flight.extend(released.iter().cloned());
        self.persist();
        released
    }

    fn last_event(&self) -> Option<Duration> {
        self.state
            .event_times_ms
            .iter()
            .max()
            .map(|ms| Duration::from_millis(*ms))
    }

    fn policy(&self) -> FileUploadHoldingAreaSettings {
        self.settings.get().holding_area
    }

    fn persist(&self) {
        let result = if self.state == PersistedState::default() {
            self.storage.delete(HOLDING_AREA_KEY)
        } else {
            set_json(self.storage.as_ref(), HOLDING_AREA_KEY, &self.state)
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist holding area");
        }
    }
}

fn duration_to_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// Commands accepted by the holding area task.
#[derive(Debug)]
pub enum HoldingAreaCommand {
    Add {
        path: PathBuf,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    },
    EventOfInterest(Duration),
    Timeout,
    LinuxReboot,
    ChangeEnabled(bool),
}

/// Errors that can occur when sending to the holding area.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HoldingAreaError {
    #[error("Holding area channel is full")]
    Full,

    #[error("Holding area has been closed")]
    Closed,
}

/// Handle for submitting work to the holding area task.
///
/// This can be cloned and shared across producer tasks.
#[derive(Clone)]
pub struct HoldingAreaSender {
    tx: mpsc::Sender<HoldingAreaCommand>,
}

impl HoldingAreaSender {
    pub async fn send(&self, command: HoldingAreaCommand) -> Result<(), HoldingAreaError> {
        self.tx.send(command).await.map_err(|_| HoldingAreaError::Closed)
    }

    /// Send without waiting. Fails if the channel is full or closed.
    pub fn try_send(&self, command: HoldingAreaCommand) -> Result<(), HoldingAreaError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HoldingAreaError::Full,
            mpsc::error::TrySendError::Closed(_) => HoldingAreaError::Closed,
        })
    }

    pub async fn add(
        &self,
        path: PathBuf,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<(), HoldingAreaError> {
        self.send(HoldingAreaCommand::Add {
            path,
            metadata,
            collection_time,
        })
        .await
    }

    pub async fn event_of_interest(&self, timestamp: Duration) -> Result<(), HoldingAreaError> {
        self.send(HoldingAreaCommand::EventOfInterest(timestamp)).await
    }
}

/// Drives a [`FileUploadHoldingArea`]: applies commands in arrival order,
/// fires the release deadline, and hands released files to the uploader.
///
/// Files added while a release is being handed off are only seen after the
/// hand-off finishes, so they always land in the next batch.
pub struct HoldingAreaTask {
    rx: mpsc::Receiver<HoldingAreaCommand>,
    area: FileUploadHoldingArea,
    clock: Arc<dyn Clock>,
    enqueuer: Arc<dyn UploadEnqueuer>,
}

impl HoldingAreaTask {
    pub fn new(
        area: FileUploadHoldingArea,
        clock: Arc<dyn Clock>,
        enqueuer: Arc<dyn UploadEnqueuer>,
    ) -> (HoldingAreaSender, Self) {
        Self::with_capacity(area, clock, enqueuer, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        area: FileUploadHoldingArea,
        clock: Arc<dyn Clock>,
        enqueuer: Arc<dyn UploadEnqueuer>,
        channel_capacity: usize,
    ) -> (HoldingAreaSender, Self) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let task = Self {
            rx,
            area,
            clock,
            enqueuer,
        };
        (HoldingAreaSender { tx }, task)
    }

    /// Run until cancelled or every sender is dropped.
    pub async fn run(mut self, cancel: CancellationToken) -> HoldingAreaStats {
        // Anything restored from storage may already be due.
        let released = self.area.handle_timeout(self.now());
        self.hand_off(released).await;

        loop {
            let deadline = self.area.next_deadline();
            let wait = deadline.map(|d| d.saturating_sub(self.now()));
            let timer = async move {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Holding area task cancelled");
                    break;
                }
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            info!("Holding area channel closed");
                            break;
                        }
                    }
                }
                _ = timer => {
                    let released = self.area.handle_timeout(self.now());
                    self.hand_off(released).await;
                }
            }
        }

        self.area.stats().clone()
    }

    async fn handle(&mut self, command: HoldingAreaCommand) {
        let now = self.now();
        match command {
            HoldingAreaCommand::Add {
                path,
                metadata,
                collection_time,
            } => {
                let file = HeldFile::new(path, metadata, collection_time, now);
                let released = self.area.add(file, now);
                self.hand_off(released).await;
            }
            HoldingAreaCommand::EventOfInterest(timestamp) => {
                let released = self.area.handle_event_of_interest(timestamp, now);
                self.hand_off(released).await;
            }
            HoldingAreaCommand::Timeout => {
                let released = self.area.handle_timeout(now);
                self.hand_off(released).await;
            }
            HoldingAreaCommand::LinuxReboot => {
                let dropped = self.area.handle_linux_reboot();
                delete_files(dropped).await;
            }
            HoldingAreaCommand::ChangeEnabled(enabled) => {
                let dropped = self.area.handle_change_enabled(enabled);
                delete_files(dropped).await;
            }
        }
    }

    async fn hand_off(&mut self, released: Vec<HeldFile>) {
        for file in released {
            let id = file.id;
            let result = self
                .enqueuer
                .enqueue_upload(file.path, file.metadata, file.collection_time)
                .await;
            let hand_off = match result {
                Ok(handle) => {
                    debug!(id = %id, upload_id = %handle.id, "Held file handed to uploader");
                    HandOff::Accepted
                }
                Err(EnqueueError::FileMissing(_)) => HandOff::FileMissing,
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to hand held file to uploader");
                    HandOff::Failed
                }
            };
            self.area.complete_release(id, hand_off, self.now());
        }
    }

    fn now(&self) -> Duration {
        self.clock.elapsed_realtime()
    }
}

async fn delete_files(files: Vec<HeldFile>) {
    for file in files {
        delete_upload_file(&file.path).await;
    }
}
