//! Bort Uploader - reliable diagnostics upload service
//!
//! Wires the rate limiter, holding area and upload queue together, resumes
//! uploads left over from a previous run, records reboots, and keeps the
//! periodic work running until shutdown.
//!
//! ## Configuration
//!
//! Configuration is loaded from `BORT_*` environment variables, see
//! [`bort_uploader::Config`]. `RUST_LOG` sets the log filter (default: info).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bort_uploader::config::{Config, FeatureFlag, Settings, SettingsHandle};
use bort_uploader::holding_area::{FileUploadHoldingArea, HoldingAreaCommand, HoldingAreaTask};
use bort_uploader::lifecycle::{Scope, ScopeController, Scoped};
use bort_uploader::metrics::BuiltinMetrics;
use bort_uploader::reboot::{read_linux_boot_id, BootCountTracker, LinuxBootTracker, RebootEventUploader};
use bort_uploader::requester::{
    HoldingAreaTimeoutJob, IntervalWorkRequester, PendingUploadRescanJob, PeriodicWorkManager,
    PeriodicWorkRequester,
};
use bort_uploader::storage::{FileKeyValueStore, KeyValueStore};
use bort_uploader::time::{Clock, CombinedTime, SystemClock};
use bort_uploader::token_bucket::TokenBucketStore;
use bort_uploader::upload::{EnqueueUpload, FileUploadTask, PendingUploads, PreparedUploader, UploadWorker};

/// Storage key of the reboot event rate limiter
const REBOOT_TOKEN_BUCKETS_KEY: &str = "token_buckets.reboot";

/// How long shutdown waits for the holding area to persist its state
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Bort Uploader...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                files_base_url = %config.settings.http_api.files_base_url,
                data_dir = %config.data_dir.display(),
                max_upload_attempts = config.settings.upload.max_upload_attempts,
                sdk_enabled = config.sdk_enabled,
                dev_mode = config.dev_mode,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn KeyValueStore> = match FileKeyValueStore::open(config.data_dir.join("state")) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(error = %e, "Failed to open state storage");
            std::process::exit(1);
        }
    };

    let service = match PreparedUploader::new(&config.settings.http_api, config.device_info.clone()) {
        Ok(service) => {
            info!(base_url = %service.base_url(), "HTTP client initialized");
            Arc::new(service)
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let settings = SettingsHandle::new(config.settings.clone());
    let sdk_enabled = FeatureFlag::new(config.sdk_enabled);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let metrics = Arc::new(BuiltinMetrics::new());
    let shutdown = CancellationToken::new();

    // Upload queue
    let pending = Arc::new(PendingUploads::new(storage.clone()));
    let task = Arc::new(FileUploadTask::new(
        service,
        pending.clone(),
        settings.clone(),
        sdk_enabled.clone(),
        metrics.clone(),
    ));
    let worker = UploadWorker::new(
        task,
        pending.clone(),
        config.settings.upload.backoff_base,
        config.settings.upload.backoff_max,
    );
    let enqueuer = Arc::new(EnqueueUpload::new(&config.data_dir, pending, worker.clone()));
    // Files moved in by a run that stopped before recording them
    enqueuer.remove_orphans().await;

    // Holding area
    let area = FileUploadHoldingArea::new(storage.clone(), settings.clone());
    let (holding_area, holding_area_task) = HoldingAreaTask::new(area, clock.clone(), enqueuer.clone());
    let holding_area_handle = tokio::spawn(holding_area_task.run(shutdown.child_token()));

    if !config.sdk_enabled {
        send_or_warn(&holding_area, HoldingAreaCommand::ChangeEnabled(false)).await;
    }

    // Reboot tracking
    let rate_limiter = Arc::new(TokenBucketStore::new(
        storage.clone(),
        REBOOT_TOKEN_BUCKETS_KEY,
        settings.clone(),
        clock.clone(),
        metrics.clone(),
        FeatureFlag::new(config.dev_mode),
    ));
    let boot_id = read_linux_boot_id().unwrap_or_default();
    let linux_boot = LinuxBootTracker::new(storage.clone());
    let just_booted = match linux_boot.check(&boot_id, clock.elapsed_realtime()) {
        Some(previous_uptime) => {
            rate_limiter.handle_linux_reboot(previous_uptime);
            send_or_warn(&holding_area, HoldingAreaCommand::LinuxReboot).await;
            true
        }
        None => false,
    };

    let boot_count = linux_boot.boot_count();
    if config.sdk_enabled && BootCountTracker::new(storage.clone()).track_if_needed(boot_count) {
        let reboot_events = RebootEventUploader::new(
            rate_limiter,
            enqueuer,
            settings.clone(),
            config.boot_reason.clone(),
        );
        let time = CombinedTime::now(clock.as_ref(), boot_id.clone(), boot_count);
        if let Err(e) = reboot_events.handle_untracked_boot_count(boot_count, time).await {
            warn!(error = %e, boot_count = boot_count, "Failed to enqueue reboot event");
        }
    }

    // Periodic work
    let requesters: Vec<Arc<dyn PeriodicWorkRequester>> = vec![
        Arc::new(IntervalWorkRequester::new(
            HoldingAreaTimeoutJob::new(holding_area.clone()),
            shutdown.clone(),
        )),
        Arc::new(IntervalWorkRequester::new(
            PendingUploadRescanJob::new(worker.clone()),
            shutdown.clone(),
        )),
    ];
    let manager = Arc::new(PeriodicWorkManager::new(requesters));

    let services: Vec<Arc<dyn Scoped>> = vec![
        Arc::new(UploadWorkerService { worker }),
        Arc::new(PeriodicWorkService {
            manager: manager.clone(),
            settings: settings.get(),
            sdk_enabled,
            just_booted,
        }),
    ];
    let controller = ScopeController::new(services);
    controller.enter().await;

    for diagnostics in manager.diagnostics() {
        info!(requester = %diagnostics.name, running = diagnostics.running, "Periodic work");
    }

    info!("Bort Uploader running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    info!("Initiating graceful shutdown...");
    controller.exit().await;
    linux_boot.record_uptime(&boot_id, clock.elapsed_realtime());
    shutdown.cancel();
    drop(holding_area);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, holding_area_handle).await {
        Ok(Ok(stats)) => info!(
            files_added = stats.files_added,
            files_released = stats.files_released,
            "Holding area shut down gracefully"
        ),
        Ok(Err(e)) => warn!(error = %e, "Holding area task panicked during shutdown"),
        Err(_) => warn!("Holding area shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    info!(metrics = ?metrics.snapshot(), "Bort Uploader stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

async fn send_or_warn(holding_area: &bort_uploader::HoldingAreaSender, command: HoldingAreaCommand) {
    if let Err(e) = holding_area.send(command).await {
        warn!(error = %e, "Failed to send holding area command");
    }
}

/// Resumes uploads persisted by a previous run and stops the worker on exit.
struct UploadWorkerService {
    worker: Arc<UploadWorker>,
}

#[async_trait]
impl Scoped for UploadWorkerService {
    fn name(&self) -> &str {
        "upload_worker"
    }

    async fn on_enter_scope(&self, _scope: &Scope) {
        self.worker.resume_pending();
    }

    async fn on_exit_scope(&self) {
        self.worker.shutdown();
    }
}

struct PeriodicWorkService {
    manager: Arc<PeriodicWorkManager>,
    settings: Settings,
    sdk_enabled: FeatureFlag,
    just_booted: bool,
}

#[async_trait]
impl Scoped for PeriodicWorkService {
    fn name(&self) -> &str {
        "periodic_work"
    }

    async fn on_enter_scope(&self, _scope: &Scope) {
        self.manager.schedule_tasks_after_boot_or_enable(
            &self.settings,
            self.sdk_enabled.is_enabled(),
            self.just_booted,
        );
    }

    async fn on_exit_scope(&self) {
        self.manager.cancel_all();
    }
}
