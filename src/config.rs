//! Configuration for the upload pipeline.
//!
//! Settings are loaded from `BORT_*` environment variables with validation,
//! falling back to defaults. Fetched settings can later be layered on top
//! with [`SettingsOverrides::apply`], which is the single place where
//! precedence (explicit override > provided default) is decided.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

/// Default base URL for the files API
const DEFAULT_FILES_BASE_URL: &str = "https://files.memfault.com";

/// Default root for persisted state and pending uploads
const DEFAULT_DATA_DIR: &str = "./bort-data";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_UPLOAD_ATTEMPTS: u32 = 3;
const MAX_UPLOAD_ATTEMPTS_LIMIT: u32 = 100;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 5 * 60;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 5 * 60 * 60;

const DEFAULT_MAX_BUCKETS: usize = 32;
const DEFAULT_BUCKET_CAPACITY: u32 = 5;
const DEFAULT_BUCKET_PERIOD_SECS: u64 = 60 * 60;

const DEFAULT_TRAILING_MARGIN_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_STORED_EVENTS_OF_INTEREST: usize = 50;
const DEFAULT_MAX_HOLD_SECS: u64 = 12 * 60 * 60;

const DEFAULT_HOLDING_AREA_TIMEOUT_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_UPLOAD_RESCAN_INTERVAL_SECS: u64 = 60 * 60;

/// HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpApiSettings {
    /// Base URL of the files API (prepare/commit)
    pub files_base_url: String,

    /// Project key sent with authenticated calls
    pub project_key: String,

    /// Timeout applied to each HTTP call
    pub request_timeout: Duration,

    /// Gzip upload bodies that are not already compressed
    pub upload_compression_enabled: bool,
}

/// Identity reported with uploads that carry device metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_serial: String,
    pub hardware_version: String,
    pub software_version: String,
}

/// Retry policy for file uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    /// Attempts after which a retryable upload becomes a terminal failure
    pub max_upload_attempts: u32,

    /// Delay before the first retry; doubles for every further retry
    pub backoff_base: Duration,

    /// Upper bound on the retry delay
    pub backoff_max: Duration,
}

/// Policy for buckets created by a token bucket store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitingSettings {
    pub capacity: u32,
    pub period: Duration,
    pub max_buckets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadHoldingAreaSettings {
    /// Delay after the last event of interest before held files are released
    pub trailing_margin: Duration,

    /// Bound on remembered event timestamps (oldest dropped first)
    pub max_stored_events_of_interest: usize,

    /// Longest a file is held when no event of interest arrives
    pub max_hold: Duration,
}

/// Scheduling parameters of one periodic requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicSettings {
    pub enabled: bool,
    pub interval: Duration,
}

/// Complete settings snapshot consumed by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub http_api: HttpApiSettings,
    pub upload: UploadSettings,
    pub rate_limiting: RateLimitingSettings,
    pub holding_area: FileUploadHoldingAreaSettings,
    pub holding_area_timeout: PeriodicSettings,
    pub upload_rescan: PeriodicSettings,
    pub reboot_events_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_api: HttpApiSettings {
                files_base_url: DEFAULT_FILES_BASE_URL.to_string(),
                project_key: String::new(),
                request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
                upload_compression_enabled: true,
            },
            upload: UploadSettings {
                max_upload_attempts: DEFAULT_MAX_UPLOAD_ATTEMPTS,
                backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
                backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            },
            rate_limiting: RateLimitingSettings {
                capacity: DEFAULT_BUCKET_CAPACITY,
                period: Duration::from_secs(DEFAULT_BUCKET_PERIOD_SECS),
                max_buckets: DEFAULT_MAX_BUCKETS,
            },
            holding_area: FileUploadHoldingAreaSettings {
                trailing_margin: Duration::from_millis(DEFAULT_TRAILING_MARGIN_MS),
                max_stored_events_of_interest: DEFAULT_MAX_STORED_EVENTS_OF_INTEREST,
                max_hold: Duration::from_secs(DEFAULT_MAX_HOLD_SECS),
            },
            holding_area_timeout: PeriodicSettings {
                enabled: true,
                interval: Duration::from_secs(DEFAULT_HOLDING_AREA_TIMEOUT_INTERVAL_SECS),
            },
            upload_rescan: PeriodicSettings {
                enabled: true,
                interval: Duration::from_secs(DEFAULT_UPLOAD_RESCAN_INTERVAL_SECS),
            },
            reboot_events_enabled: true,
        }
    }
}

/// Partial settings, e.g. fetched from the backend. `None` keeps the
/// underlying value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub max_upload_attempts: Option<u32>,
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_period: Option<Duration>,
    pub max_buckets: Option<usize>,
    pub trailing_margin: Option<Duration>,
    pub max_stored_events_of_interest: Option<usize>,
    pub max_hold: Option<Duration>,
    pub holding_area_timeout: Option<PeriodicSettings>,
    pub upload_rescan: Option<PeriodicSettings>,
    pub reboot_events_enabled: Option<bool>,
}

impl SettingsOverrides {
    /// Merge onto `base`. An explicit override always wins over the value
    /// provided by `base`.
    pub fn apply(&self, base: &Settings) -> Settings {
        let mut merged = base.clone();
        if let Some(v) = self.max_upload_attempts {
            merged.upload.max_upload_attempts = v;
        }
        if let Some(v) = self.rate_limit_capacity {
            merged.rate_limiting.capacity = v;
        }
        if let Some(v) = self.rate_limit_period {
            merged.rate_limiting.period = v;
        }
        if let Some(v) = self.max_buckets {
            merged.rate_limiting.max_buckets = v;
        }
        if let Some(v) = self.trailing_margin {
            merged.holding_area.trailing_margin = v;
        }
        if let Some(v) = self.max_stored_events_of_interest {
            merged.holding_area.max_stored_events_of_interest = v;
        }
        if let Some(v) = self.max_hold {
            merged.holding_area.max_hold = v;
        }
        if let Some(v) = &self.holding_area_timeout {
            merged.holding_area_timeout = v.clone();
        }
        if let Some(v) = &self.upload_rescan {
            merged.upload_rescan = v.clone();
        }
        if let Some(v) = self.reboot_events_enabled {
            merged.reboot_events_enabled = v;
        }
        merged
    }
}

/// Shared, replaceable settings snapshot.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Settings {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Install `new`, returning the previous snapshot.
    pub fn replace(&self, new: Settings) -> Settings {
        match self.inner.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, new),
            Err(_) => Settings::default(),
        }
    }
}

/// Shared on/off switch (SDK enablement, dev mode).
#[derive(Debug, Clone, Default)]
pub struct FeatureFlag(Arc<AtomicBool>);

impl FeatureFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {env_var}: {message}")]
    Invalid { env_var: String, message: String },
}

impl ConfigError {
    fn invalid(env_var: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            env_var: env_var.to_string(),
            message: message.into(),
        }
    }
}

/// Process configuration.
///
/// All settings can be configured via environment variables:
/// - `BORT_FILES_BASE_URL`, `BORT_PROJECT_KEY`, `BORT_REQUEST_TIMEOUT_SECS`
/// - `BORT_DATA_DIR`: root for persisted state and pending uploads
/// - `BORT_MAX_UPLOAD_ATTEMPTS`: 1..=100 (default: 3)
/// - `BORT_MAX_BUCKETS`, `BORT_RATE_LIMIT_CAPACITY`, `BORT_RATE_LIMIT_PERIOD_SECS`
/// - `BORT_TRAILING_MARGIN_MS`, `BORT_MAX_STORED_EVENTS_OF_INTEREST`, `BORT_MAX_HOLD_SECS`
/// - `BORT_DEVICE_SERIAL`, `BORT_HARDWARE_VERSION`, `BORT_SOFTWARE_VERSION`
/// - `BORT_ENABLED`, `BORT_DEV_MODE`, `BORT_UPLOAD_COMPRESSION`
/// - `BORT_BOOT_REASON`: `reason[,subreason[,breadcrumb...]]` of the last boot
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub device_info: DeviceInfo,
    pub boot_reason: Option<String>,
    pub settings: Settings,
    pub sdk_enabled: bool,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            device_info: DeviceInfo::default(),
            boot_reason: None,
            settings: Settings::default(),
            sdk_enabled: true,
            dev_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the variable when a value does not parse
    /// or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();

        let files_base_url = lookup("BORT_FILES_BASE_URL")
            .unwrap_or_else(|| DEFAULT_FILES_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !files_base_url.starts_with("http://") && !files_base_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "BORT_FILES_BASE_URL",
                format!("'{}' is not an http(s) URL", files_base_url),
            ));
        }

        let project_key = lookup("BORT_PROJECT_KEY").unwrap_or_default();
        let data_dir = lookup("BORT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let request_timeout_secs = parse_var(
            &lookup,
            "BORT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            600,
        )?;
        let max_upload_attempts = parse_var(
            &lookup,
            "BORT_MAX_UPLOAD_ATTEMPTS",
            DEFAULT_MAX_UPLOAD_ATTEMPTS,
            1,
            MAX_UPLOAD_ATTEMPTS_LIMIT,
        )?;
        let max_buckets = parse_var(&lookup, "BORT_MAX_BUCKETS", DEFAULT_MAX_BUCKETS, 1, 10_000)?;
        let capacity = parse_var(
            &lookup,
            "BORT_RATE_LIMIT_CAPACITY",
            DEFAULT_BUCKET_CAPACITY,
            0,
            100_000,
        )?;
        let period_secs = parse_var(
            &lookup,
            "BORT_RATE_LIMIT_PERIOD_SECS",
            DEFAULT_BUCKET_PERIOD_SECS,
            1,
            u64::MAX / 1000,
        )?;
        let trailing_margin_ms = parse_var(
            &lookup,
            "BORT_TRAILING_MARGIN_MS",
            DEFAULT_TRAILING_MARGIN_MS,
            0,
            u64::MAX,
        )?;
        let max_stored_events_of_interest = parse_var(
            &lookup,
            "BORT_MAX_STORED_EVENTS_OF_INTEREST",
            DEFAULT_MAX_STORED_EVENTS_OF_INTEREST,
            1,
            10_000,
        )?;
        let max_hold_secs =
            parse_var(&lookup, "BORT_MAX_HOLD_SECS", DEFAULT_MAX_HOLD_SECS, 1, u64::MAX / 1000)?;

        let device_info = DeviceInfo {
            device_serial: lookup("BORT_DEVICE_SERIAL").unwrap_or_default(),
            hardware_version: lookup("BORT_HARDWARE_VERSION").unwrap_or_default(),
            software_version: lookup("BORT_SOFTWARE_VERSION").unwrap_or_default(),
        };

        let sdk_enabled = parse_bool(&lookup, "BORT_ENABLED", true)?;
        let dev_mode = parse_bool(&lookup, "BORT_DEV_MODE", false)?;
        let upload_compression_enabled = parse_bool(&lookup, "BORT_UPLOAD_COMPRESSION", true)?;

        let settings = Settings {
            http_api: HttpApiSettings {
                files_base_url,
                project_key,
                request_timeout: Duration::from_secs(request_timeout_secs),
                upload_compression_enabled,
            },
            upload: UploadSettings {
                max_upload_attempts,
                ..defaults.upload
            },
            rate_limiting: RateLimitingSettings {
                capacity,
                period: Duration::from_secs(period_secs),
                max_buckets,
            },
            holding_area: FileUploadHoldingAreaSettings {
                trailing_margin: Duration::from_millis(trailing_margin_ms),
                max_stored_events_of_interest,
                max_hold: Duration::from_secs(max_hold_secs),
            },
            ..defaults
        };

        Ok(Self {
            data_dir,
            device_info,
            boot_reason: lookup("BORT_BOOT_REASON").filter(|reason| !reason.is_empty()),
            settings,
            sdk_enabled,
            dev_mode,
        })
    }
}

/// Parse a numeric variable, enforcing `min..=max`.
fn parse_var<T, F>(lookup: &F, env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(env_var) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(env_var, format!("'{}' is not a valid number", raw)))?;

    if value < min {
        return Err(ConfigError::invalid(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }
    if value > max {
        return Err(ConfigError::invalid(
            env_var,
            format!("{} exceeds maximum ({})", value, max),
        ));
    }
    Ok(value)
}

fn parse_bool<F>(lookup: &F, env_var: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(env_var).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::invalid(
            env_var,
            format!("'{}' is not a boolean", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    fn message(err: ConfigError) -> String {
        match err {
            ConfigError::Invalid { message, .. } => message,
        }
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]).expect("Should load with defaults");
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.upload.max_upload_attempts, 3);
        assert_eq!(config.data_dir, PathBuf::from("./bort-data"));
        assert!(config.sdk_enabled);
        assert!(!config.dev_mode);
        assert_eq!(config.boot_reason, None);
        assert!(config.settings.http_api.upload_compression_enabled);
    }

    #[test]
    fn test_custom_values() {
        let config = load(&[
            ("BORT_FILES_BASE_URL", "http://localhost:9000/"),
            ("BORT_PROJECT_KEY", "secret"),
            ("BORT_MAX_UPLOAD_ATTEMPTS", "5"),
            ("BORT_MAX_BUCKETS", "4"),
            ("BORT_RATE_LIMIT_CAPACITY", "2"),
            ("BORT_RATE_LIMIT_PERIOD_SECS", "60"),
            ("BORT_TRAILING_MARGIN_MS", "300"),
            ("BORT_DEV_MODE", "true"),
            ("BORT_BOOT_REASON", "shutdown,battery"),
            ("BORT_UPLOAD_COMPRESSION", "false"),
        ])
        .expect("Should load custom values");

        let settings = &config.settings;
        assert_eq!(settings.http_api.files_base_url, "http://localhost:9000");
        assert_eq!(settings.http_api.project_key, "secret");
        assert!(!settings.http_api.upload_compression_enabled);
        assert_eq!(settings.upload.max_upload_attempts, 5);
        assert_eq!(settings.rate_limiting.max_buckets, 4);
        assert_eq!(settings.rate_limiting.capacity, 2);
        assert_eq!(settings.rate_limiting.period, Duration::from_secs(60));
        assert_eq!(settings.holding_area.trailing_margin, Duration::from_millis(300));
        assert!(config.dev_mode);
        assert_eq!(config.boot_reason.as_deref(), Some("shutdown,battery"));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("BORT_MAX_UPLOAD_ATTEMPTS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("BORT_MAX_UPLOAD_ATTEMPTS"));
        assert!(message(err).contains("not a valid number"));
    }

    #[test]
    fn test_out_of_range() {
        let err = load(&[("BORT_MAX_UPLOAD_ATTEMPTS", "0")]).unwrap_err();
        assert!(message(err).contains("below minimum"));

        let err = load(&[("BORT_MAX_UPLOAD_ATTEMPTS", "1000")]).unwrap_err();
        assert!(message(err).contains("exceeds maximum"));
    }

    #[test]
    fn test_invalid_bool_and_url() {
        let err = load(&[("BORT_ENABLED", "maybe")]).unwrap_err();
        assert!(message(err).contains("not a boolean"));

        let err = load(&[("BORT_FILES_BASE_URL", "ftp://files")]).unwrap_err();
        assert!(message(err).contains("not an http(s) URL"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let base = Settings::default();
        let overrides = SettingsOverrides {
            max_upload_attempts: Some(7),
            trailing_margin: Some(Duration::from_millis(300)),
            upload_rescan: Some(PeriodicSettings {
                enabled: false,
                interval: Duration::from_secs(1),
            }),
            ..SettingsOverrides::default()
        };

        let merged = overrides.apply(&base);
        assert_eq!(merged.upload.max_upload_attempts, 7);
        assert_eq!(merged.holding_area.trailing_margin, Duration::from_millis(300));
        assert!(!merged.upload_rescan.enabled);
        // Untouched fields come from the base.
        assert_eq!(merged.rate_limiting, base.rate_limiting);
        assert_eq!(SettingsOverrides::default().apply(&base), base);
    }

    #[test]
    fn test_settings_handle_replace() {
        let handle = SettingsHandle::new(Settings::default());
        let mut new = Settings::default();
        new.reboot_events_enabled = false;

        let old = handle.replace(new.clone());
        assert!(old.reboot_events_enabled);
        assert_eq!(handle.get(), new);
    }

    #[test]
    fn test_feature_flag_is_shared() {
        let flag = FeatureFlag::new(true);
        let clone = flag.clone();
        clone.set(false);
        assert!(!flag.is_enabled());
    }
}
