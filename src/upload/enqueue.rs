//! Entry point for handing files to the upload queue.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PendingUpload, PendingUploads, UploadMetadata, UploadWorker};
use crate::storage::StorageError;
use crate::time::CombinedTime;

/// Directory under the data dir that owns queued files.
pub const PENDING_UPLOADS_DIR: &str = "pending_uploads";

/// Identifies a queued upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub id: Uuid,
    pub name: String,
}

/// Errors that can occur while enqueuing an upload.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("file to upload does not exist: {0}")]
    FileMissing(PathBuf),

    #[error("failed to move file into the upload queue: {0}")]
    Io(#[from] io::Error),

    #[error("failed to persist pending upload: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode upload metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Accepts files for upload. Ownership of the file passes to the queue once
/// this returns `Ok`.
#[async_trait]
pub trait UploadEnqueuer: Send + Sync {
    async fn enqueue_upload(
        &self,
        file: PathBuf,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<UploadHandle, EnqueueError>;

    /// Queue an upload whose body is the JSON encoding of `metadata`.
    async fn enqueue_metadata(
        &self,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<UploadHandle, EnqueueError>;
}

/// Moves files into `<data_dir>/pending_uploads`, records them, and submits
/// them to the [`UploadWorker`].
pub struct EnqueueUpload {
    pending_dir: PathBuf,
    pending: Arc<PendingUploads>,
    worker: Arc<UploadWorker>,
}

impl EnqueueUpload {
    pub fn new(data_dir: &Path, pending: Arc<PendingUploads>, worker: Arc<UploadWorker>) -> Self {
        Self {
            pending_dir: data_dir.join(PENDING_UPLOADS_DIR),
            pending,
            worker,
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    /// Delete files in the pending directory that no record refers to.
    /// Returns the number removed.
    pub async fn remove_orphans(&self) -> usize {
        let owned: HashSet<PathBuf> = self
            .pending
            .all()
            .into_iter()
            .filter_map(|upload| upload.path)
            .collect();

        let mut entries = match tokio::fs::read_dir(&self.pending_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = %self.pending_dir.display(), error = %e, "Failed to list pending uploads");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read pending upload entry");
                    break;
                }
            };
            let path = entry.path();
            if owned.contains(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned upload file"),
            }
        }
        if removed > 0 {
            info!(removed = removed, "Removed orphaned upload files");
        }
        removed
    }

    fn record(
        &self,
        id: Uuid,
        dest: &Path,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<PendingUpload, StorageError> {
        let upload = PendingUpload {
            id,
            name: format!("upload.{}.{}", metadata.kind(), id),
            path: Some(dest.to_path_buf()),
            metadata,
            collection_time,
            attempts: 0,
        };
        self.pending.put(&upload)?;
        Ok(upload)
    }

    fn submit(&self, upload: PendingUpload) -> UploadHandle {
        let handle = UploadHandle {
            id: upload.id,
            name: upload.name.clone(),
        };
        info!(id = %upload.id, kind = upload.metadata.kind(), "Upload enqueued");
        self.worker.submit(upload);
        handle
    }
}

#[async_trait]
impl UploadEnqueuer for EnqueueUpload {
    async fn enqueue_upload(
        &self,
        file: PathBuf,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<UploadHandle, EnqueueError> {
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return Err(EnqueueError::FileMissing(file));
        }

        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(&self.pending_dir).await?;
        let dest = self.pending_dir.join(id.to_string());
        move_file(&file, &dest).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EnqueueError::FileMissing(file.clone()),
            _ => EnqueueError::Io(e),
        })?;
        debug!(from = %file.display(), to = %dest.display(), "Moved file into upload queue");

        match self.record(id, &dest, metadata, collection_time) {
            Ok(upload) => Ok(self.submit(upload)),
            Err(e) => {
                // The caller keeps ownership of the file on error.
                if let Err(restore) = move_file(&dest, &file).await {
                    warn!(file = %file.display(), error = %restore, "Failed to return file, deleting it");
                    let _ = tokio::fs::remove_file(&dest).await;
                }
                Err(e.into())
            }
        }
    }

    async fn enqueue_metadata(
        &self,
        metadata: UploadMetadata,
        collection_time: CombinedTime,
    ) -> Result<UploadHandle, EnqueueError> {
        let body = serde_json::to_vec(&metadata)?;
        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(&self.pending_dir).await?;
        let dest = self.pending_dir.join(id.to_string());
        tokio::fs::write(&dest, body).await?;

        match self.record(id, &dest, metadata, collection_time) {
            Ok(upload) => Ok(self.submit(upload)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e.into())
            }
        }
    }
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlag, Settings, SettingsHandle};
    use crate::metrics::BuiltinMetrics;
    use crate::storage::{KeyValueStore, MemoryKeyValueStore};
    use crate::time::FakeClock;
    use crate::upload::task::tests::FakeUploadService;
    use crate::upload::FileUploadTask;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Reads as empty and refuses every write.
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn enqueuer(dir: &TempDir, service: FakeUploadService) -> (EnqueueUpload, Arc<PendingUploads>) {
        enqueuer_with_store(dir, service, Arc::new(MemoryKeyValueStore::new()))
    }

    fn enqueuer_with_store(
        dir: &TempDir,
        service: FakeUploadService,
        store: Arc<dyn KeyValueStore>,
    ) -> (EnqueueUpload, Arc<PendingUploads>) {
        let pending = Arc::new(PendingUploads::new(store));
        let task = Arc::new(FileUploadTask::new(
            Arc::new(service),
            pending.clone(),
            SettingsHandle::new(Settings::default()),
            FeatureFlag::new(true),
            Arc::new(BuiltinMetrics::new()),
        ));
        let worker = UploadWorker::new(task, pending.clone(), Duration::from_secs(60), Duration::from_secs(60));
        (EnqueueUpload::new(dir.path(), pending.clone(), worker), pending)
    }

    fn now() -> CombinedTime {
        CombinedTime::now(&FakeClock::default(), "boot", 1)
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (enqueuer, pending) = enqueuer(&dir, FakeUploadService::with_statuses(&[200]));

        let err = enqueuer
            .enqueue_upload(dir.path().join("nope"), UploadMetadata::Mar, now())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::FileMissing(_)));
        assert!(pending.all().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_moves_file_and_uploads() {
        let dir = TempDir::new().unwrap();
        let (enqueuer, pending) = enqueuer(&dir, FakeUploadService::with_statuses(&[200]));
        let source = dir.path().join("bugreport.zip");
        std::fs::write(&source, b"zip").unwrap();

        let handle = enqueuer
            .enqueue_upload(source.clone(), UploadMetadata::BugReport, now())
            .await
            .unwrap();
        assert!(!source.exists());
        assert!(handle.name.starts_with("upload.bugreport."));

        // The worker uploads and then removes the record and the file.
        let queued = enqueuer.pending_dir().join(handle.id.to_string());
        tokio::time::timeout(Duration::from_secs(5), async {
            while pending.get(handle.id).is_some() || queued.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload should complete");
    }

    #[tokio::test]
    async fn test_enqueue_metadata_writes_body() {
        let dir = TempDir::new().unwrap();
        // The hanging service keeps the upload pending.
        let (enqueuer, pending) = enqueuer(&dir, FakeUploadService::hanging());

        let handle = enqueuer
            .enqueue_metadata(UploadMetadata::Mar, now())
            .await
            .unwrap();
        let record = pending.get(handle.id).unwrap();
        let body = std::fs::read_to_string(record.path.unwrap()).unwrap();
        assert_eq!(body, r#"{"type":"mar"}"#);
    }

    fn pending_files(enqueuer: &EnqueueUpload) -> Vec<PathBuf> {
        match std::fs::read_dir(enqueuer.pending_dir()) {
            Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unpersisted_upload_returns_file_to_caller() {
        let dir = TempDir::new().unwrap();
        let (enqueuer, pending) =
            enqueuer_with_store(&dir, FakeUploadService::with_statuses(&[200]), Arc::new(FailingStore));
        let source = dir.path().join("bugreport.zip");
        std::fs::write(&source, b"zip").unwrap();

        let err = enqueuer
            .enqueue_upload(source.clone(), UploadMetadata::BugReport, now())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Storage(_)));
        assert_eq!(std::fs::read(&source).unwrap(), b"zip");
        assert!(pending_files(&enqueuer).is_empty());
        assert!(pending.all().is_empty());
    }

    #[tokio::test]
    async fn test_unpersisted_metadata_leaves_no_body() {
        let dir = TempDir::new().unwrap();
        let (enqueuer, _) =
            enqueuer_with_store(&dir, FakeUploadService::with_statuses(&[200]), Arc::new(FailingStore));

        let err = enqueuer
            .enqueue_metadata(UploadMetadata::Mar, now())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Storage(_)));
        assert!(pending_files(&enqueuer).is_empty());
    }

    #[tokio::test]
    async fn test_remove_orphans_keeps_recorded_files() {
        let dir = TempDir::new().unwrap();
        let (enqueuer, _) = enqueuer(&dir, FakeUploadService::hanging());
        assert_eq!(enqueuer.remove_orphans().await, 0);

        let handle = enqueuer
            .enqueue_metadata(UploadMetadata::Mar, now())
            .await
            .unwrap();
        let recorded = enqueuer.pending_dir().join(handle.id.to_string());
        let stray = enqueuer.pending_dir().join(Uuid::new_v4().to_string());
        std::fs::write(&stray, b"left behind").unwrap();

        assert_eq!(enqueuer.remove_orphans().await, 1);
        assert!(!stray.exists());
        assert!(recorded.exists());
        assert_eq!(pending_files(&enqueuer), vec![recorded]);
    }
}
