//! Resumable progress markers, one per entity type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{CheckpointError, EntityType};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entity: String,
    /// Upper bound of the last committed bucket.
    pub last_completed_key: i64,
    pub bucket_size: i64,
    pub transform_fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A checkpoint is only reusable under the same bucket geometry and field mapping.
    pub fn matches(&self, bucket_size: i64, transform_fingerprint: &str) -> bool {
        self.bucket_size == bucket_size && self.transform_fingerprint == transform_fingerprint
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, entity: EntityType) -> Result<Option<Checkpoint>, CheckpointError>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    async fn clear(&self, entity: EntityType) -> Result<(), CheckpointError>;
}

/// JSON files under a root directory, replaced atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{entity}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, entity: EntityType) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(entity.as_str());
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let final_path = self.path_for(&checkpoint.entity);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", checkpoint.entity, Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn clear(&self, entity: EntityType) -> Result<(), CheckpointError> {
        match fs::remove_file(self.path_for(entity.as_str())).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<HashMap<String, Checkpoint>>>,
    saves: Arc<Mutex<Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint ever saved, in order.
    pub async fn history(&self) -> Vec<Checkpoint> {
        self.saves.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, entity: EntityType) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.inner.lock().await.get(entity.as_str()).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.inner
            .lock()
            .await
            .insert(checkpoint.entity.clone(), checkpoint.clone());
        self.saves.lock().await.push(checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, entity: EntityType) -> Result<(), CheckpointError> {
        self.inner.lock().await.remove(entity.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VACANCY: EntityType = EntityType::new("vacancy");

    fn checkpoint(last: i64) -> Checkpoint {
        Checkpoint {
            entity: VACANCY.to_string(),
            last_completed_key: last,
            bucket_size: 5000,
            transform_fingerprint: "abc".into(),
            updated_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));

        assert_eq!(store.load(VACANCY).await.expect("load"), None);
        store.save(&checkpoint(4999)).await.expect("save");
        store.save(&checkpoint(9999)).await.expect("save again");
        assert_eq!(
            store.load(VACANCY).await.expect("load"),
            Some(checkpoint(9999))
        );

        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.clear(VACANCY).await.expect("clear");
        store.clear(VACANCY).await.expect("clear is idempotent");
        assert_eq!(store.load(VACANCY).await.expect("load"), None);
    }

    #[test]
    fn checkpoint_match_requires_same_geometry_and_fingerprint() {
        let cp = checkpoint(10);
        assert!(cp.matches(5000, "abc"));
        assert!(!cp.matches(100, "abc"));
        assert!(!cp.matches(5000, "def"));
    }
}
