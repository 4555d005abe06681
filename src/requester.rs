//! Periodic work and the restart decision applied after boot or a settings
//! change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PeriodicSettings, Settings};
use crate::holding_area::{HoldingAreaCommand, HoldingAreaError, HoldingAreaSender};
use crate::upload::UploadWorker;

/// Something that owns a periodic job and can be started or cancelled.
pub trait PeriodicWorkRequester: Send + Sync {
    fn name(&self) -> &str;

    /// Start (or restart) the periodic job. Starting an already running job
    /// replaces it.
    fn start_periodic(&self, settings: &Settings, just_booted: bool, settings_changed: bool);

    /// Cancel the periodic job. Idempotent.
    fn cancel_periodic(&self);

    fn enabled(&self, settings: &Settings) -> bool;

    /// Whether the scheduling parameters differ between `old` and `new`.
    fn parameters_changed(&self, old: &Settings, new: &Settings) -> bool;

    fn is_running(&self) -> bool;
}

/// What to do with one requester after a settings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Cancel,
    Start,
    Restart,
    Unchanged,
}

/// Disabled wins, then a newly enabled requester starts, then changed
/// parameters restart it.
pub fn decide(enabled_old: bool, enabled_new: bool, parameters_changed: bool) -> RestartDecision {
    if !enabled_new {
        RestartDecision::Cancel
    } else if !enabled_old {
        RestartDecision::Start
    } else if parameters_changed {
        RestartDecision::Restart
    } else {
        RestartDecision::Unchanged
    }
}

/// Name and state of one requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterDiagnostics {
    pub name: String,
    pub running: bool,
}

/// Applies the restart decision to every registered requester.
pub struct PeriodicWorkManager {
    requesters: Vec<Arc<dyn PeriodicWorkRequester>>,
}

impl PeriodicWorkManager {
    pub fn new(requesters: Vec<Arc<dyn PeriodicWorkRequester>>) -> Self {
        Self { requesters }
    }

    pub fn maybe_restart_tasks_after_settings_change(
        &self,
        old: &Settings,
        new: &Settings,
    ) -> Vec<(String, RestartDecision)> {
        self.requesters
            .iter()
            .map(|requester| {
                let decision = decide(
                    requester.enabled(old),
                    requester.enabled(new),
                    requester.parameters_changed(old, new),
                );
                match decision {
                    RestartDecision::Cancel => requester.cancel_periodic(),
                    RestartDecision::Start => requester.start_periodic(new, false, true),
                    RestartDecision::Restart => {
                        requester.cancel_periodic();
                        requester.start_periodic(new, false, true);
                    }
                    RestartDecision::Unchanged => {}
                }
                debug!(requester = requester.name(), decision = ?decision, "Applied settings change");
                (requester.name().to_string(), decision)
            })
            .collect()
    }

    /// Start every enabled requester, or cancel all of them when the SDK is
    /// disabled.
    pub fn schedule_tasks_after_boot_or_enable(
        &self,
        settings: &Settings,
        sdk_enabled: bool,
        just_booted: bool,
    ) {
        for requester in &self.requesters {
            if sdk_enabled && requester.enabled(settings) {
                requester.start_periodic(settings, just_booted, false);
            } else {
                requester.cancel_periodic();
            }
        }
        info!(
            sdk_enabled = sdk_enabled,
            just_booted = just_booted,
            running = self.requesters.iter().filter(|r| r.is_running()).count(),
            "Scheduled periodic work"
        );
    }

    pub fn cancel_all(&self) {
        for requester in &self.requesters {
            requester.cancel_periodic();
        }
    }

    pub fn diagnostics(&self) -> Vec<RequesterDiagnostics> {
        self.requesters
            .iter()
            .map(|requester| RequesterDiagnostics {
                name: requester.name().to_string(),
                running: requester.is_running(),
            })
            .collect()
    }
}

/// One unit of periodic work run by an [`IntervalWorkRequester`].
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// This job's scheduling parameters within `settings`.
    fn schedule<'a>(&self, settings: &'a Settings) -> &'a PeriodicSettings;

    async fn run_once(&self);
}

/// Runs a [`PeriodicJob`] on a tokio interval until cancelled.
pub struct IntervalWorkRequester<J> {
    job: Arc<J>,
    parent: CancellationToken,
    running: Mutex<Option<CancellationToken>>,
}

impl<J: PeriodicJob> IntervalWorkRequester<J> {
    /// `parent` cancels the job on shutdown.
    pub fn new(job: J, parent: CancellationToken) -> Self {
        Self {
            job: Arc::new(job),
            parent,
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<J: PeriodicJob> PeriodicWorkRequester for IntervalWorkRequester<J> {
    fn name(&self) -> &str {
        self.job.name()
    }

    fn start_periodic(&self, settings: &Settings, just_booted: bool, settings_changed: bool) {
        let period = self.job.schedule(settings).interval.max(Duration::from_millis(1));
        let cancel = self.parent.child_token();
        if let Some(previous) = self.lock_running().replace(cancel.clone()) {
            previous.cancel();
        }

        info!(
            requester = self.job.name(),
            interval_secs = period.as_secs(),
            just_booted = just_booted,
            settings_changed = settings_changed,
            "Starting periodic work"
        );

        let job = Arc::clone(&self.job);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => job.run_once().await,
                }
            }
            debug!(requester = job.name(), "Periodic work stopped");
        });
    }

    fn cancel_periodic(&self) {
        if let Some(cancel) = self.lock_running().take() {
            cancel.cancel();
            info!(requester = self.job.name(), "Cancelled periodic work");
        }
    }

    fn enabled(&self, settings: &Settings) -> bool {
        self.job.schedule(settings).enabled
    }

    fn parameters_changed(&self, old: &Settings, new: &Settings) -> bool {
        self.job.schedule(old).interval != self.job.schedule(new).interval
    }

    fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|cancel| !cancel.is_cancelled())
    }
}

/// Asks the holding area to release files held past their maximum hold.
pub struct HoldingAreaTimeoutJob {
    sender: HoldingAreaSender,
}

impl HoldingAreaTimeoutJob {
    pub fn new(sender: HoldingAreaSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl PeriodicJob for HoldingAreaTimeoutJob {
    fn name(&self) -> &str {
        "holding_area_timeout"
    }

    fn schedule<'a>(&self, settings: &'a Settings) -> &'a PeriodicSettings {
        &settings.holding_area_timeout
    }

    async fn run_once(&self) {
        match self.sender.try_send(HoldingAreaCommand::Timeout) {
            Ok(()) => {}
            // A busy holding area settles on its next command anyway.
            Err(HoldingAreaError::Full) => debug!("Holding area busy, skipping timeout"),
            Err(e) => warn!(error = %e, "Failed to send holding area timeout"),
        }
    }
}

/// Resubmits persisted uploads that lost their job, e.g. after a restart.
pub struct PendingUploadRescanJob {
    worker: Arc<UploadWorker>,
}

impl PendingUploadRescanJob {
    pub fn new(worker: Arc<UploadWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl PeriodicJob for PendingUploadRescanJob {
    fn name(&self) -> &str {
        "pending_upload_rescan"
    }

    fn schedule<'a>(&self, settings: &'a Settings) -> &'a PeriodicSettings {
        &settings.upload_rescan
    }

    async fn run_once(&self) {
        self.worker.resume_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records start/cancel calls; enabled by `holding_area_timeout`.
    struct FakeRequester {
        name: String,
        calls: Mutex<Vec<&'static str>>,
        running: Mutex<bool>,
    }

    impl FakeRequester {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: Mutex::new(Vec::new()),
                running: Mutex::new(false),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PeriodicWorkRequester for FakeRequester {
        fn name(&self) -> &str {
            &self.name
        }

        fn start_periodic(&self, _: &Settings, _: bool, _: bool) {
            self.calls.lock().unwrap().push("start");
            *self.running.lock().unwrap() = true;
        }

        fn cancel_periodic(&self) {
            self.calls.lock().unwrap().push("cancel");
            *self.running.lock().unwrap() = false;
        }

        fn enabled(&self, settings: &Settings) -> bool {
            settings.holding_area_timeout.enabled
        }

        fn parameters_changed(&self, old: &Settings, new: &Settings) -> bool {
            old.holding_area_timeout.interval != new.holding_area_timeout.interval
        }

        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }
    }

    fn settings(enabled: bool, interval_secs: u64) -> Settings {
        let mut settings = Settings::default();
        settings.holding_area_timeout = PeriodicSettings {
            enabled,
            interval: Duration::from_secs(interval_secs),
        };
        settings
    }

    #[test]
    fn test_restart_decisions() {
        assert_eq!(decide(true, false, false), RestartDecision::Cancel);
        assert_eq!(decide(false, false, true), RestartDecision::Cancel);
        assert_eq!(decide(false, true, false), RestartDecision::Start);
        assert_eq!(decide(false, true, true), RestartDecision::Start);
        assert_eq!(decide(true, true, true), RestartDecision::Restart);
        assert_eq!(decide(true, true, false), RestartDecision::Unchanged);
    }

    #[test]
    fn test_settings_change_applies_decision() {
        let requester = FakeRequester::new("fake");
        let manager = PeriodicWorkManager::new(vec![requester.clone()]);

        let decisions = manager.maybe_restart_tasks_after_settings_change(&settings(true, 60), &settings(true, 120));
        assert_eq!(decisions, vec![("fake".to_string(), RestartDecision::Restart)]);
        assert_eq!(requester.calls(), vec!["cancel", "start"]);

        manager.maybe_restart_tasks_after_settings_change(&settings(true, 120), &settings(true, 120));
        assert_eq!(requester.calls().len(), 2);

        manager.maybe_restart_tasks_after_settings_change(&settings(true, 120), &settings(false, 120));
        assert_eq!(requester.calls().last(), Some(&"cancel"));
        assert!(!requester.is_running());
    }

    #[test]
    fn test_boot_with_sdk_disabled_cancels_all() {
        let requester = FakeRequester::new("fake");
        let manager = PeriodicWorkManager::new(vec![requester.clone()]);

        manager.schedule_tasks_after_boot_or_enable(&settings(true, 60), false, true);
        assert_eq!(requester.calls(), vec!["cancel"]);

        manager.schedule_tasks_after_boot_or_enable(&settings(true, 60), true, true);
        assert_eq!(requester.calls(), vec!["cancel", "start"]);
        assert_eq!(
            manager.diagnostics(),
            vec![RequesterDiagnostics {
                name: "fake".to_string(),
                running: true,
            }]
        );
    }

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        fn schedule<'a>(&self, settings: &'a Settings) -> &'a PeriodicSettings {
            &settings.holding_area_timeout
        }

        async fn run_once(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_requester_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let requester = IntervalWorkRequester::new(CountingJob { runs: runs.clone() }, CancellationToken::new());

        requester.start_periodic(&settings(true, 10), true, false);
        assert!(requester.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        requester.cancel_periodic();
        assert!(!requester.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_running_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let requester = IntervalWorkRequester::new(CountingJob { runs: runs.clone() }, CancellationToken::new());

        requester.start_periodic(&settings(true, 10), false, false);
        requester.start_periodic(&settings(true, 10), false, true);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
