use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UploadMetadata;
use crate::storage::{get_json_or_default, set_json, KeyValueStore, StorageError};
use crate::time::CombinedTime;

/// Storage key of the pending upload records.
pub const PENDING_UPLOADS_KEY: &str = "pending_uploads";

/// A file queued for upload, persisted until it reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub id: Uuid,

    /// Unique work name; a new job under the same name replaces a pending one
    pub name: String,

    /// File owned by the upload queue, `None` if the producer gave none
    pub path: Option<PathBuf>,

    pub metadata: UploadMetadata,

    pub collection_time: CombinedTime,

    /// Completed attempts that ended in a retry
    #[serde(default)]
    pub attempts: u32,
}

/// Repository over the persisted pending upload records.
pub struct PendingUploads {
    storage: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl PendingUploads {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Insert or replace the record for `upload.id`.
    pub fn put(&self, upload: &PendingUpload) -> Result<(), StorageError> {
        self.edit(|map| {
            map.insert(upload.id, upload.clone());
        })
    }

    pub fn set_attempts(&self, id: Uuid, attempts: u32) -> Result<(), StorageError> {
        self.edit(|map| {
            if let Some(upload) = map.get_mut(&id) {
                upload.attempts = attempts;
            }
        })
    }

    pub fn remove(&self, id: Uuid) -> Result<(), StorageError> {
        self.edit(|map| {
            map.remove(&id);
        })
    }

    pub fn get(&self, id: Uuid) -> Option<PendingUpload> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load().remove(&id)
    }

    /// Every pending record, oldest collection first.
    pub fn all(&self) -> Vec<PendingUpload> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut uploads: Vec<_> = self.load().into_values().collect();
        uploads.sort_by_key(|u| u.collection_time.timestamp);
        uploads
    }

    fn load(&self) -> BTreeMap<Uuid, PendingUpload> {
        get_json_or_default(self.storage.as_ref(), PENDING_UPLOADS_KEY)
    }

    fn edit(
        &self,
        f: impl FnOnce(&mut BTreeMap<Uuid, PendingUpload>),
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.load();
        f(&mut map);
        if map.is_empty() {
            self.storage.delete(PENDING_UPLOADS_KEY)
        } else {
            set_json(self.storage.as_ref(), PENDING_UPLOADS_KEY, &map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use crate::time::FakeClock;
    use std::time::Duration;

    fn upload(name: &str, secs: u64) -> PendingUpload {
        let clock = FakeClock::at(Duration::from_secs(secs));
        let mut time = CombinedTime::now(&clock, "boot", 1);
        time.timestamp += chrono::Duration::seconds(secs as i64);
        PendingUpload {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: Some(PathBuf::from(format!("/tmp/{}", name))),
            metadata: UploadMetadata::Mar,
            collection_time: time,
            attempts: 0,
        }
    }

    #[test]
    fn test_put_update_remove() {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let pending = PendingUploads::new(storage.clone());

        let first = upload("first", 1);
        pending.put(&first).unwrap();
        pending.set_attempts(first.id, 2).unwrap();
        assert_eq!(pending.get(first.id).unwrap().attempts, 2);

        pending.remove(first.id).unwrap();
        assert!(pending.get(first.id).is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_all_survives_reopen_in_collection_order() {
        let storage = Arc::new(MemoryKeyValueStore::new());
        let later = upload("later", 20);
        let earlier = upload("earlier", 10);
        {
            let pending = PendingUploads::new(storage.clone());
            pending.put(&later).unwrap();
            pending.put(&earlier).unwrap();
        }

        let pending = PendingUploads::new(storage);
        let names: Vec<_> = pending.all().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["earlier", "later"]);
    }
}
