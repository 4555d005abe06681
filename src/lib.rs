//! Bort Uploader Library
//!
//! Reliability core for uploading device diagnostics:
//!
//! - **config**: Environment-based configuration and settings overrides
//! - **time**: Boot-relative clock abstraction
//! - **storage**: Durable key-value persistence
//! - **metrics**: Internal diagnostic counters
//! - **token_bucket**: Persisted, keyed rate limiting
//! - **holding_area**: Holds files until the trailing margin after an event of interest
//! - **upload**: Prepare/put/commit uploads with bounded retries
//! - **requester**: Periodic work and restart-on-settings-change decisions
//! - **lifecycle**: Ordered start/stop of scoped services
//! - **reboot**: Reboot event production
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bort_uploader::config::{FeatureFlag, SettingsHandle};
//! use bort_uploader::metrics::BuiltinMetrics;
//! use bort_uploader::storage::MemoryKeyValueStore;
//! use bort_uploader::time::SystemClock;
//! use bort_uploader::token_bucket::TokenBucketStore;
//! use bort_uploader::Config;
//!
//! let config = Config::from_env().expect("Failed to load config");
//! let store = TokenBucketStore::new(
//!     Arc::new(MemoryKeyValueStore::new()),
//!     "token_buckets.bugreport",
//!     SettingsHandle::new(config.settings.clone()),
//!     Arc::new(SystemClock::new()),
//!     Arc::new(BuiltinMetrics::new()),
//!     FeatureFlag::new(config.dev_mode),
//! );
//!
//! if store.take_simple("bugreport", "bugreport") {
//!     // collect and enqueue the bug report
//! }
//! ```

pub mod config;
pub mod holding_area;
pub mod lifecycle;
pub mod metrics;
pub mod reboot;
pub mod requester;
pub mod storage;
pub mod time;
pub mod token_bucket;
pub mod upload;

pub use config::{Config, ConfigError, Settings, SettingsHandle, SettingsOverrides};
pub use holding_area::{FileUploadHoldingArea, HoldingAreaSender, HoldingAreaTask};
pub use storage::{FileKeyValueStore, KeyValueStore, StorageError};
pub use time::{Clock, CombinedTime, SystemClock};
pub use token_bucket::TokenBucketStore;
pub use upload::{EnqueueUpload, UploadEnqueuer, UploadMetadata, UploadOutcome, UploadWorker};
