//! Drives pending uploads to a terminal outcome.
//!
//! Each upload runs as a named job. Jobs are unique by name: submitting a job
//! under a name that already has one pending cancels the pending one and
//! replaces it. Retries wait with exponential backoff plus jitter. A small
//! semaphore bounds how many attempts run at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AttemptResult, FileUploadTask, PendingUpload, PendingUploads, UploadOutcome};

/// Attempts allowed to run concurrently.
const MAX_CONCURRENT_UPLOADS: usize = 2;

/// Calculate the backoff delay before retry number `attempt` (1-based).
///
/// Uses exponential backoff with jitter:
/// delay = min(base * 2^(attempt - 1) + jitter, max), jitter up to 25%.
pub fn calculate_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let exponent = attempt.saturating_sub(1).min(16);
    let exponential_ms = base_ms.saturating_mul(1u64 << exponent);
    let jitter_ms = rand::random::<u64>() % (exponential_ms / 4 + 1);

    Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
}

struct Job {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Jobs {
    by_name: HashMap<String, Job>,
    next_generation: u64,
}

/// Runs upload jobs, unique by name.
pub struct UploadWorker {
    task: Arc<FileUploadTask>,
    pending: Arc<PendingUploads>,
    backoff_base: Duration,
    backoff_max: Duration,
    jobs: Mutex<Jobs>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl UploadWorker {
    pub fn new(
        task: Arc<FileUploadTask>,
        pending: Arc<PendingUploads>,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            pending,
            backoff_base,
            backoff_max,
            jobs: Mutex::new(Jobs::default()),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start a job for `upload`, replacing any pending job with the same name.
    ///
    /// The replaced job's record stays in the pending store.
    pub fn submit(self: &Arc<Self>, upload: PendingUpload) {
        self.spawn_job(upload, true);
    }

    /// Start a job for `upload` unless one with the same name is pending.
    /// Returns whether a job was started.
    pub fn submit_if_absent(self: &Arc<Self>, upload: PendingUpload) -> bool {
        self.spawn_job(upload, false)
    }

    /// Resubmit every persisted upload that has no running job.
    pub fn resume_pending(self: &Arc<Self>) -> usize {
        let resumed = self
            .pending
            .all()
            .into_iter()
            .filter(|upload| self.submit_if_absent(upload.clone()))
            .count();
        if resumed > 0 {
            info!(resumed = resumed, "Resumed pending uploads");
        }
        resumed
    }

    /// Names of jobs that have not finished.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock_jobs().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every job. Cancelled attempts are not counted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock_jobs().by_name.clear();
    }

    fn spawn_job(self: &Arc<Self>, upload: PendingUpload, replace: bool) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        // A snapshot may outlive its record.
        if self.pending.get(upload.id).is_none() {
            debug!(name = %upload.name, "Upload no longer pending, not starting job");
            return false;
        }

        let (generation, cancel) = {
            let mut jobs = self.lock_jobs();
            if let Some(existing) = jobs.by_name.get(&upload.name) {
                if !replace {
                    return false;
                }
                debug!(name = %upload.name, "Replacing pending upload job");
                existing.cancel.cancel();
            }
            jobs.next_generation += 1;
            let generation = jobs.next_generation;
            let cancel = self.shutdown.child_token();
            jobs.by_name.insert(
                upload.name.clone(),
                Job {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            (generation, cancel)
        };

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let name = upload.name.clone();
            worker.run_job(upload, &cancel).await;
            worker.finish_job(&name, generation);
        });
        true
    }

    async fn run_job(&self, mut upload: PendingUpload, cancel: &CancellationToken) {
        loop {
            let result = {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = self.permits.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                self.task.run(&mut upload, cancel).await
            };

            match result {
                AttemptResult::Cancelled => return,
                AttemptResult::Completed(UploadOutcome::Retry(_)) => {
                    let delay =
                        calculate_backoff_delay(upload.attempts, self.backoff_base, self.backoff_max);
                    debug!(
                        name = %upload.name,
                        attempts = upload.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting before retrying upload"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                AttemptResult::Completed(_) => return,
            }
        }
    }

    /// Forget the job unless it was replaced meanwhile.
    fn finish_job(&self, name: &str, generation: u64) {
        let mut jobs = self.lock_jobs();
        if jobs.by_name.get(name).map(|job| job.generation) == Some(generation) {
            jobs.by_name.remove(name);
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
