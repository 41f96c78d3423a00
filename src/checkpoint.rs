//! Checkpoint creation and restore.
//!
//! A checkpoint is an atomic snapshot of the content location database
//! together with the event-stream sequence point at which it was taken.
//! The master publishes one at most once per `create_checkpoint_interval`;
//! every node restores from the newest one when its role or staleness
//! demands it. Artifacts live in central storage as an opaque blob plus a
//! JSON manifest, with a well-known `latest` manifest pointing at the
//! newest lineage member.

use crate::database::ContentLocationDatabase;
use crate::error::{LocusError, Result};
use crate::storage::CentralStorage;
use crate::types::SequencePoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Manifest published next to every checkpoint blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub checkpoint_id: String,
    pub checkpoint_time: DateTime<Utc>,
    pub sequence_point: SequencePoint,
}

impl CheckpointManifest {
    /// Age of this checkpoint relative to `now`, saturating at zero for
    /// clocks that disagree.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.checkpoint_time).max(chrono::Duration::zero())
    }
}

/// Creates and restores checkpoints of the content location database.
pub struct CheckpointManager {
    storage: Arc<dyn CentralStorage>,
    db: Arc<ContentLocationDatabase>,
    prefix: String,
    /// Restores are serialized; concurrent restores of different
    /// checkpoints would interleave snapshot installs.
    restore_lock: tokio::sync::Mutex<()>,
}

impl CheckpointManager {
    pub fn new(
        storage: Arc<dyn CentralStorage>,
        db: Arc<ContentLocationDatabase>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            db,
            prefix: prefix.into(),
            restore_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot the database and publish it with the given sequence point.
    pub async fn create_checkpoint(
        &self,
        sequence_point: SequencePoint,
    ) -> Result<CheckpointManifest> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let manifest = CheckpointManifest {
            checkpoint_id: checkpoint_id.clone(),
            checkpoint_time: Utc::now(),
            sequence_point,
        };

        let snapshot = self.db.snapshot()?;
        let size = snapshot.len();
        self.storage.put(&self.blob_key(&checkpoint_id), snapshot).await?;

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        self.storage
            .put(&self.manifest_key(&checkpoint_id), manifest_bytes.clone())
            .await?;
        self.storage.put(&self.latest_key(), manifest_bytes).await?;

        info!(
            checkpoint_id = %checkpoint_id,
            sequence_point,
            size,
            "created checkpoint"
        );
        Ok(manifest)
    }

    /// The newest checkpoint known to central storage, if any.
    pub async fn latest_checkpoint(&self) -> Result<Option<CheckpointManifest>> {
        match self.storage.get(&self.latest_key()).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(manifest) => Ok(Some(manifest)),
                Err(e) => {
                    warn!(error = %e, "undecodable latest-checkpoint manifest");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fetch the identified checkpoint and install it into the database.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointManifest> {
        let _serialized = self.restore_lock.lock().await;

        let manifest_bytes = self
            .storage
            .get(&self.manifest_key(checkpoint_id))
            .await?
            .ok_or_else(|| {
                LocusError::Checkpoint(format!("manifest for {:?} not found", checkpoint_id))
            })?;
        let manifest: CheckpointManifest = serde_json::from_slice(&manifest_bytes)?;

        let snapshot = self
            .storage
            .get(&self.blob_key(checkpoint_id))
            .await?
            .ok_or_else(|| {
                LocusError::Checkpoint(format!("blob for {:?} not found", checkpoint_id))
            })?;

        self.db.install_snapshot(&snapshot)?;
        info!(checkpoint_id, sequence_point = manifest.sequence_point, "restored checkpoint");
        Ok(manifest)
    }

    fn blob_key(&self, checkpoint_id: &str) -> String {
        format!("{}/checkpoints/{}.db", self.prefix, checkpoint_id)
    }

    fn manifest_key(&self, checkpoint_id: &str) -> String {
        format!("{}/checkpoints/{}.manifest", self.prefix, checkpoint_id)
    }

    fn latest_key(&self) -> String {
        format!("{}/checkpoints/latest", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{ContentHash, HashWithSize};

    fn hash(prefix: u8) -> ContentHash {
        let mut bytes = [0u8; 32];
        bytes[0] = prefix;
        ContentHash::from_bytes(bytes)
    }

    fn manager_with_db() -> (CheckpointManager, Arc<ContentLocationDatabase>) {
        let storage = Arc::new(MemoryStorage::new());
        let db = Arc::new(ContentLocationDatabase::new());
        db.set_writeable(true);
        let manager = CheckpointManager::new(storage, Arc::clone(&db), "test");
        (manager, db)
    }

    #[tokio::test]
    async fn test_create_and_restore_round_trip() {
        let (manager, db) = manager_with_db();
        db.apply_add(
            2,
            &[HashWithSize {
                hash: hash(1),
                size: 64,
            }],
            true,
            1_000,
        )
        .unwrap();

        let manifest = manager.create_checkpoint(42).await.unwrap();
        assert_eq!(manifest.sequence_point, 42);

        // Wipe and restore into a fresh database via a second manager.
        let storage_view = manager.storage.clone();
        let fresh_db = Arc::new(ContentLocationDatabase::new());
        let restorer = CheckpointManager::new(storage_view, Arc::clone(&fresh_db), "test");
        let restored = restorer
            .restore_checkpoint(&manifest.checkpoint_id)
            .await
            .unwrap();

        assert_eq!(restored.sequence_point, 42);
        assert_eq!(fresh_db.get(&hash(1)).unwrap().size, 64);
    }

    #[tokio::test]
    async fn test_latest_tracks_newest() {
        let (manager, _db) = manager_with_db();
        assert!(manager.latest_checkpoint().await.unwrap().is_none());

        manager.create_checkpoint(1).await.unwrap();
        let second = manager.create_checkpoint(2).await.unwrap();

        let latest = manager.latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.sequence_point, 2);
    }

    #[tokio::test]
    async fn test_restore_missing_checkpoint_fails() {
        let (manager, _db) = manager_with_db();
        let err = manager.restore_checkpoint("nope").await.unwrap_err();
        assert!(matches!(err, LocusError::Checkpoint(_)));
    }

    #[test]
    fn test_manifest_age_saturates() {
        let manifest = CheckpointManifest {
            checkpoint_id: "c".into(),
            checkpoint_time: Utc::now() + chrono::Duration::seconds(30),
            sequence_point: 0,
        };
        assert_eq!(manifest.age(Utc::now()), chrono::Duration::zero());
    }
}
