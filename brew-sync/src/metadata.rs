//! Sync metadata document and its local/remote persistence.
//!
//! One [`SyncMetadata`] exists per provider connection. It is rebuilt
//! wholesale after every successful sync and written to both sides: the
//! remote copy lives next to the data blob as `sync-metadata.json`, the
//! local copy in the key-value store under `sync-metadata:<provider>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageClient;
use crate::utils::{Result, SyncError};
use crate::vault::KeyValueStore;

/// Schema tag checked on load; documents carrying any other version are
/// treated as absent rather than partially interpreted.
pub const METADATA_VERSION: &str = "2.0.0";

/// Remote object key of the metadata document
pub const METADATA_KEY: &str = "sync-metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: u64,
    pub hash: String,
    pub last_modified: DateTime<Utc>,
}

/// One rotated backup of the main data blob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub version: String,
    pub last_sync_time: DateTime<Utc>,
    pub device_id: String,
    pub files: BTreeMap<String, FileMetadata>,
    /// Tombstoned keys, reserved for incremental sync. Currently always empty.
    #[serde(default)]
    pub deleted_files: Vec<String>,
    /// Backup history; the last entry's hash drives the skip-if-unchanged
    /// check on the next upload.
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
}

impl SyncMetadata {
    pub fn new(device_id: &str) -> Self {
        SyncMetadata {
            version: METADATA_VERSION.to_string(),
            last_sync_time: Utc::now(),
            device_id: device_id.to_string(),
            files: BTreeMap::new(),
            deleted_files: Vec::new(),
            backups: Vec::new(),
        }
    }

    pub fn last_backup_hash(&self) -> Option<&str> {
        self.backups.last().map(|b| b.hash.as_str())
    }

    fn parse(json: &str) -> Option<SyncMetadata> {
        let parsed: SyncMetadata = match serde_json::from_str(json) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Unreadable sync metadata, treating as absent: {}", e);
                return None;
            }
        };
        if parsed.version != METADATA_VERSION {
            tracing::warn!(
                "Unknown sync metadata version {:?}, treating as absent",
                parsed.version
            );
            return None;
        }
        Some(parsed)
    }
}

/// Persists the metadata document on both sides of a provider connection.
pub struct MetadataStore {
    client: Arc<dyn StorageClient>,
    kv: Arc<dyn KeyValueStore>,
    local_key: String,
}

impl MetadataStore {
    pub fn new(client: Arc<dyn StorageClient>, kv: Arc<dyn KeyValueStore>, provider: &str) -> Self {
        MetadataStore {
            client,
            kv,
            local_key: format!("sync-metadata:{provider}"),
        }
    }

    pub async fn remote(&self) -> Result<Option<SyncMetadata>> {
        let Some(json) = self.client.download_file(METADATA_KEY).await? else {
            return Ok(None);
        };
        Ok(SyncMetadata::parse(&json))
    }

    pub async fn local(&self) -> Result<Option<SyncMetadata>> {
        let Some(json) = self.kv.get(&self.local_key).await? else {
            return Ok(None);
        };
        Ok(SyncMetadata::parse(&json))
    }

    pub async fn save_remote(&self, metadata: &SyncMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)?;
        if !self.client.upload_file(METADATA_KEY, &json).await? {
            return Err(SyncError::Metadata(
                "metadata upload rejected by storage backend".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn save_local(&self, metadata: &SyncMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)?;
        self.kv.set(&self.local_key, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryKv, MemoryStorageClient};

    #[test]
    fn test_unknown_version_treated_as_absent() {
        let mut metadata = SyncMetadata::new("device-1");
        metadata.version = "1.0.0".to_string();
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(SyncMetadata::parse(&json).is_none());

        let metadata = SyncMetadata::new("device-1");
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(SyncMetadata::parse(&json).is_some());
    }

    #[test]
    fn test_garbage_treated_as_absent() {
        assert!(SyncMetadata::parse("not json").is_none());
        assert!(SyncMetadata::parse("{}").is_none());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let metadata = SyncMetadata::new("device-1");
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"lastSyncTime\""));
        assert!(json.contains("\"deviceId\""));
        assert!(json.contains("\"deletedFiles\""));
    }

    #[tokio::test]
    async fn test_save_remote_rejection_is_an_error() {
        let client = Arc::new(MemoryStorageClient::new());
        client.reject_uploads().await;
        let store = MetadataStore::new(client.clone(), Arc::new(MemoryKv::new()), "s3");

        let result = store.save_remote(&SyncMetadata::new("device-1")).await;
        assert!(matches!(result, Err(SyncError::Metadata(_))));
        assert!(store.remote().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_both_sides() {
        let client = Arc::new(MemoryStorageClient::new());
        let kv = Arc::new(MemoryKv::new());
        let store = MetadataStore::new(client.clone(), kv.clone(), "s3");

        assert!(store.remote().await.unwrap().is_none());
        assert!(store.local().await.unwrap().is_none());

        let metadata = SyncMetadata::new("device-1");
        store.save_remote(&metadata).await.unwrap();
        store.save_local(&metadata).await.unwrap();

        assert_eq!(store.remote().await.unwrap().unwrap(), metadata);
        assert_eq!(store.local().await.unwrap().unwrap(), metadata);
    }
}
