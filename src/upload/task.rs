//! One upload attempt for one pending file.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::upload_file;
use super::{
    apply_attempt_policy, delete_upload_file, FailureReason, PendingUpload, PendingUploads,
    UploadOutcome, UploadService,
};
use crate::config::{FeatureFlag, SettingsHandle};
use crate::metrics::{BuiltinMetrics, UPLOAD_FAILURE, UPLOAD_RETRY, UPLOAD_SUCCESS};

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// The attempt ran; a `Retry` outcome means it should be scheduled again.
    Completed(UploadOutcome),

    /// Cancelled before it finished. Nothing was counted and the file is kept.
    Cancelled,
}

/// Runs single upload attempts and applies their side effects: attempt
/// counting, and deleting the file and record on a terminal outcome.
pub struct FileUploadTask {
    service: Arc<dyn UploadService>,
    pending: Arc<PendingUploads>,
    settings: SettingsHandle,
    sdk_enabled: FeatureFlag,
    metrics: Arc<BuiltinMetrics>,
}

impl FileUploadTask {
    pub fn new(
        service: Arc<dyn UploadService>,
        pending: Arc<PendingUploads>,
        settings: SettingsHandle,
        sdk_enabled: FeatureFlag,
        metrics: Arc<BuiltinMetrics>,
    ) -> Self {
        Self {
            service,
            pending,
            settings,
            sdk_enabled,
            metrics,
        }
    }

    /// Attempt `upload` once. `upload.attempts` is updated in place when the
    /// attempt ends in a retry.
    pub async fn run(&self, upload: &mut PendingUpload, cancel: &CancellationToken) -> AttemptResult {
        let settings = self.settings.get();
        let max_attempts = settings.upload.max_upload_attempts;
        let compress = settings.http_api.upload_compression_enabled && upload.metadata.should_compress();

        let Some(path) = upload.path.clone() else {
            return self.finish(upload, UploadOutcome::Failure(FailureReason::NullPath)).await;
        };

        if !self.sdk_enabled.is_enabled() {
            return self
                .finish(upload, UploadOutcome::Failure(FailureReason::SdkDisabled))
                .await;
        }

        if upload.attempts >= max_attempts {
            warn!(
                id = %upload.id,
                attempts = upload.attempts,
                max_attempts = max_attempts,
                "Upload already exhausted its attempts"
            );
            let outcome = UploadOutcome::Failure(FailureReason::AttemptsExhausted(upload.attempts));
            return self.finish(upload, outcome).await;
        }

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return self
                .finish(upload, UploadOutcome::Failure(FailureReason::FileMissing))
                .await;
        }

        debug!(
            id = %upload.id,
            kind = upload.metadata.kind(),
            attempt = upload.attempts + 1,
            "Starting upload attempt"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(id = %upload.id, "Upload attempt cancelled");
                return AttemptResult::Cancelled;
            }
            outcome = upload_file(self.service.as_ref(), &path, &upload.metadata, compress) => outcome,
        };

        let (attempts, outcome) = apply_attempt_policy(upload.attempts, outcome, max_attempts);
        upload.attempts = attempts;
        self.finish(upload, outcome).await
    }

    async fn finish(&self, upload: &PendingUpload, outcome: UploadOutcome) -> AttemptResult {
        match &outcome {
            UploadOutcome::Success => {
                self.metrics.increment(UPLOAD_SUCCESS);
                info!(id = %upload.id, kind = upload.metadata.kind(), "Upload succeeded");
            }
            UploadOutcome::Retry(reason) => {
                self.metrics.increment(UPLOAD_RETRY);
                warn!(
                    id = %upload.id,
                    attempts = upload.attempts,
                    reason = %reason,
                    "Upload will be retried"
                );
                if let Err(e) = self.pending.set_attempts(upload.id, upload.attempts) {
                    warn!(id = %upload.id, error = %e, "Failed to persist upload attempts");
                }
                return AttemptResult::Completed(outcome);
            }
            UploadOutcome::Failure(reason) => {
                self.metrics.increment(UPLOAD_FAILURE);
                error!(
                    id = %upload.id,
                    kind = upload.metadata.kind(),
                    reason = %reason,
                    "Upload failed permanently"
                );
            }
        }

        if let Some(path) = &upload.path {
            delete_upload_file(path).await;
        }
        if let Err(e) = self.pending.remove(upload.id) {
            warn!(id = %upload.id, error = %e, "Failed to remove pending upload record");
        }
        AttemptResult::Completed(outcome)
    }
}
