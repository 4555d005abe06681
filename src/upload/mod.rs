//! Reliable file uploads.
//!
//! An upload is a prepare/put/commit exchange with the files API. Each attempt
//! resolves to an [`UploadOutcome`]; retries are bounded by
//! `max_upload_attempts` and driven by the [`UploadWorker`] with exponential
//! backoff. Pending uploads live under `<data_dir>/pending_uploads` and in the
//! key-value store until they reach a terminal outcome.

mod client;
mod enqueue;
mod pending;
mod task;
mod worker;

use std::io;
use std::path::Path;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::reboot::RebootEvent;

pub use client::{ClientError, PrepareResponse, PreparedUploader, UploadService};
pub use enqueue::{EnqueueError, EnqueueUpload, UploadEnqueuer, UploadHandle};
pub use pending::{PendingUpload, PendingUploads, PENDING_UPLOADS_KEY};
pub use task::{AttemptResult, FileUploadTask};
pub use worker::{calculate_backoff_delay, UploadWorker};

/// Why an attempt should be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryReason {
    #[error("server returned {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

/// Why an upload failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("server rejected upload with {0}")]
    Status(u16),

    #[error("no file path")]
    NullPath,

    #[error("file does not exist")]
    FileMissing,

    #[error("could not read file: {0}")]
    Unreadable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("uploads are disabled")]
    SdkDisabled,

    #[error("client misconfigured: {0}")]
    Client(String),

    #[error("no attempts left after {0}")]
    AttemptsExhausted(u32),

    #[error("giving up after {attempts} attempts ({last})")]
    MaxAttemptsReached { attempts: u32, last: RetryReason },
}

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Retry(RetryReason),
    Failure(FailureReason),
}

impl UploadOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadOutcome::Retry(_))
    }
}

/// Map an HTTP status to an outcome: 2xx succeeds, 408 and 5xx retry,
/// everything else fails.
pub fn classify_status(status: StatusCode) -> UploadOutcome {
    if status.is_success() {
        UploadOutcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        UploadOutcome::Retry(RetryReason::Status(status.as_u16()))
    } else {
        UploadOutcome::Failure(FailureReason::Status(status.as_u16()))
    }
}

/// Count one attempt and coerce a retry into a failure once `max_attempts`
/// is reached. Returns the new attempt count alongside the final outcome.
pub fn apply_attempt_policy(
    prior_attempts: u32,
    outcome: UploadOutcome,
    max_attempts: u32,
) -> (u32, UploadOutcome) {
    let attempts = prior_attempts.saturating_add(1);
    match outcome {
        UploadOutcome::Retry(last) if attempts >= max_attempts => (
            attempts,
            UploadOutcome::Failure(FailureReason::MaxAttemptsReached { attempts, last }),
        ),
        other => (attempts, other),
    }
}

/// What an uploaded file contains. Decides how the upload is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadMetadata {
    BugReport,

    /// Multiple artifact record
    Mar,

    DropBoxEntry {
        family: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },

    /// Metadata-only upload; the metadata itself becomes the file body.
    Reboot { event: RebootEvent },
}

impl UploadMetadata {
    /// Path segment after `/api/v0/upload/` used for the commit.
    pub fn commit_path(&self) -> String {
        match self {
            UploadMetadata::BugReport => "bugreport".to_string(),
            UploadMetadata::Mar | UploadMetadata::Reboot { .. } => "mar".to_string(),
            UploadMetadata::DropBoxEntry { family, .. } => {
                format!("android-dropbox-manager-entry/{}", family)
            }
        }
    }

    /// Bug reports are zip archives already; everything else is worth
    /// gzipping.
    pub fn should_compress(&self) -> bool {
        !matches!(self, UploadMetadata::BugReport)
    }

    /// Short name used in logs and job names.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadMetadata::BugReport => "bugreport",
            UploadMetadata::Mar => "mar",
            UploadMetadata::DropBoxEntry { .. } => "dropbox",
            UploadMetadata::Reboot { .. } => "reboot",
        }
    }
}

/// Delete an upload's file. A file that is already gone is fine.
pub(crate) async fn delete_upload_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete upload file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (200, UploadOutcome::Success),
            (204, UploadOutcome::Success),
            (408, UploadOutcome::Retry(RetryReason::Status(408))),
            (500, UploadOutcome::Retry(RetryReason::Status(500))),
            (503, UploadOutcome::Retry(RetryReason::Status(503))),
            (400, UploadOutcome::Failure(FailureReason::Status(400))),
            (404, UploadOutcome::Failure(FailureReason::Status(404))),
            (429, UploadOutcome::Failure(FailureReason::Status(429))),
        ];
        for (code, expected) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), expected, "status {}", code);
        }
    }

    #[test]
    fn test_retry_below_max_stays_retry() {
        let retry = UploadOutcome::Retry(RetryReason::Timeout);
        let (attempts, outcome) = apply_attempt_policy(0, retry.clone(), 3);
        assert_eq!(attempts, 1);
        assert_eq!(outcome, retry);
    }

    #[test]
    fn test_retry_at_max_becomes_failure() {
        let (attempts, outcome) =
            apply_attempt_policy(2, UploadOutcome::Retry(RetryReason::Status(500)), 3);
        assert_eq!(attempts, 3);
        assert_eq!(
            outcome,
            UploadOutcome::Failure(FailureReason::MaxAttemptsReached {
                attempts: 3,
                last: RetryReason::Status(500),
            })
        );
        assert!(outcome.is_terminal());
    }

    #[test]
    fn test_terminal_outcomes_pass_through() {
        let (_, outcome) = apply_attempt_policy(5, UploadOutcome::Success, 3);
        assert_eq!(outcome, UploadOutcome::Success);

        let failure = UploadOutcome::Failure(FailureReason::Status(404));
        let (_, outcome) = apply_attempt_policy(0, failure.clone(), 3);
        assert_eq!(outcome, failure);
    }

    #[test]
    fn test_commit_paths() {
        assert_eq!(UploadMetadata::BugReport.commit_path(), "bugreport");
        assert_eq!(UploadMetadata::Mar.commit_path(), "mar");
        let dropbox = UploadMetadata::DropBoxEntry {
            family: "tombstone".to_string(),
            metadata: serde_json::Value::Null,
        };
        assert_eq!(
            dropbox.commit_path(),
            "android-dropbox-manager-entry/tombstone"
        );
    }

    #[test]
    fn test_bug_reports_are_not_recompressed() {
        assert!(!UploadMetadata::BugReport.should_compress());
        assert!(UploadMetadata::Mar.should_compress());
    }

    #[test]
    fn test_metadata_is_tagged() {
        let json = serde_json::to_value(&UploadMetadata::BugReport).unwrap();
        assert_eq!(json["type"], "bug_report");
    }
}
