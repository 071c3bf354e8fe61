//! Local collaborators: the application data vault and key-value store.
//!
//! The sync core treats the application dataset as an opaque JSON blob — it
//! has no knowledge of the brewing domain schema behind it. [`DataVault`]
//! is the export/import contract; [`KeyValueStore`] persists small pieces of
//! sync state (device id, local metadata copy).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::utils::{Result, SyncError};

/// Fixed key of the primary data blob on the remote backend
pub const DATA_FILE_KEY: &str = "brew-guide-data.json";

/// KV key under which the per-installation device id is persisted
const DEVICE_ID_KEY: &str = "device-id";

/// Export/import contract for the full application dataset.
#[async_trait]
pub trait DataVault: Send + Sync {
    /// Serialize the full local dataset to one JSON blob
    async fn export_all_data(&self) -> Result<String>;

    /// Replace the local dataset wholesale
    async fn import_all_data(&self, json: &str) -> Result<()>;

    /// Persist one downloaded file by its remote key. The primary key
    /// replaces the dataset; other inventory keys are stored beside it.
    async fn import_file(&self, key: &str, content: &str) -> Result<()>;
}

/// Small-string persistence for sync bookkeeping.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Stable per-installation identifier, generated once and persisted. Used to
/// attribute changes in metadata, never as a lock token.
pub async fn ensure_device_id(kv: &Arc<dyn KeyValueStore>) -> Result<String> {
    if let Some(id) = kv.get(DEVICE_ID_KEY).await? {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    kv.set(DEVICE_ID_KEY, &id).await?;
    tracing::info!("Generated device id {}", id);
    Ok(id)
}

/// File-backed vault used by the CLI: the dataset is one JSON file on disk,
/// non-primary downloads land under a `synced/` sibling directory.
pub struct FileVault {
    data_path: PathBuf,
}

impl FileVault {
    pub fn new(data_path: PathBuf) -> Self {
        FileVault { data_path }
    }

    fn side_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.data_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join("synced")
            .join(name)
    }
}

#[async_trait]
impl DataVault for FileVault {
    async fn export_all_data(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.data_path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn import_all_data(&self, json: &str) -> Result<()> {
        if let Some(parent) = self.data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.data_path, json).await?;
        Ok(())
    }

    async fn import_file(&self, key: &str, content: &str) -> Result<()> {
        if key == DATA_FILE_KEY {
            return self.import_all_data(content).await;
        }
        let path = self.side_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}

/// File-backed key-value store: one JSON object on disk.
pub struct FileKv {
    path: PathBuf,
    entries: tokio::sync::Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl FileKv {
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| SyncError::Vault(format!("corrupt kv store {path:?}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(FileKv {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    async fn flush(&self, entries: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        self.flush(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        self.flush(&entries).await
    }
}
