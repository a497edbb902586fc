//! File persistent storage
//!
//! Persists index metadata, including in-sync allocation ids, so that a
//! restarted coordinator can recover primaries from existing stores.
//! Routing itself is never persisted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::AllocationError;
use crate::metadata::{ClusterState, Metadata};

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Cannot rebuild cluster state: {0}")]
    Recovery(#[from] AllocationError),
}

/// On-disk document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMetadata {
    pub cluster_name: String,
    pub saved_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// File storage
#[derive(Debug)]
pub struct FileStorage {
    data_dir: PathBuf,
    metadata_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let metadata_path = data_dir.join("cluster_metadata.json");
        Self {
            data_dir,
            metadata_path,
        }
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Ensure data directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !fs::try_exists(&self.data_dir).await? {
            fs::create_dir_all(&self.data_dir).await?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<PersistedMetadata>, StorageError> {
        if !fs::try_exists(&self.metadata_path).await? {
            info!("Metadata file not found, will create new cluster");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.metadata_path).await?;
        let persisted: PersistedMetadata =
            serde_json::from_str(&content).map_err(|e| StorageError::Serialization(e.to_string()))?;

        info!(
            "Loaded metadata of cluster '{}': {} indices, metadata version {}",
            persisted.cluster_name,
            persisted.metadata.indices().count(),
            persisted.metadata.version
        );
        Ok(Some(persisted))
    }

    /// Save the metadata of `state`
    pub async fn save(&self, state: &ClusterState) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let persisted = PersistedMetadata {
            cluster_name: state.cluster_name.clone(),
            saved_at: Utc::now(),
            metadata: state.metadata.clone(),
        };

        // Write to temp file first, then atomically rename
        let temp_path = self.metadata_path.with_extension("json.tmp");
        let content =
            serde_json::to_string_pretty(&persisted).map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.metadata_path).await?;

        info!("Saved cluster metadata: metadata version {}", state.metadata.version);
        Ok(())
    }

    /// Recovered state from disk, or an empty cluster when nothing is stored
    pub async fn load_or_create(&self, cluster_name: &str) -> Result<ClusterState, StorageError> {
        match self.load().await? {
            Some(persisted) => {
                let state = ClusterState::recovered(persisted.cluster_name, persisted.metadata)?;
                info!(
                    "Recovered cluster '{}' with {} unassigned shard copies",
                    state.cluster_name,
                    state.routing_table.all_shards().count()
                );
                Ok(state)
            }
            None => {
                let state = ClusterState::new(cluster_name);
                self.save(&state).await?;
                info!("Created new cluster '{}'", cluster_name);
                Ok(state)
            }
        }
    }

    /// Backup current metadata
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        if !fs::try_exists(&self.metadata_path).await? {
            return Err(StorageError::NotFound(self.metadata_path.clone()));
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.data_dir.join(format!("cluster_metadata_{}.json.bak", timestamp));

        fs::copy(&self.metadata_path, &backup_path).await?;
        info!("Backed up metadata to {:?}", backup_path);

        Ok(backup_path)
    }
}
