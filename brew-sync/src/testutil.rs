//! In-memory test doubles for the storage client and local collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{Provider, S3Config, SyncSettings};
use crate::service::ClientBuilder;
use crate::storage::{RemoteObject, StorageClient};
use crate::utils::{Result, SyncError};
use crate::vault::{DataVault, KeyValueStore, DATA_FILE_KEY};

/// Settings with a verified S3 section, ready to resolve as active.
pub fn verified_s3_settings(bucket: &str) -> SyncSettings {
    SyncSettings {
        active: Provider::S3,
        s3: Some(S3Config {
            endpoint: None,
            region: "auto".to_string(),
            bucket: bucket.to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            prefix: String::new(),
            verified: true,
        }),
        webdav: None,
        supabase: None,
    }
}

#[derive(Default)]
struct MemoryStoreState {
    objects: BTreeMap<String, String>,
    upload_calls: u32,
    download_calls: u32,
    connection_tests: u32,
    reject_uploads: bool,
    fail_connection: bool,
    fail_copies: bool,
    failing_downloads: HashSet<String>,
    rejected_uploads: HashSet<String>,
    upload_delay: Option<Duration>,
}

/// HashMap-backed storage client with failure injection and call counters.
/// Listed objects carry no `lastModified` so timestamp parsing from backup
/// filenames gets exercised.
pub struct MemoryStorageClient {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStorageClient {
    pub fn new() -> Self {
        MemoryStorageClient {
            state: Mutex::new(MemoryStoreState::default()),
        }
    }

    pub async fn put(&self, key: &str, content: &str) {
        self.state
            .lock()
            .await
            .objects
            .insert(key.to_string(), content.to_string());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn upload_calls(&self) -> u32 {
        self.state.lock().await.upload_calls
    }

    pub async fn download_calls(&self) -> u32 {
        self.state.lock().await.download_calls
    }

    pub async fn connection_tests(&self) -> u32 {
        self.state.lock().await.connection_tests
    }

    pub async fn reject_uploads(&self) {
        self.state.lock().await.reject_uploads = true;
    }

    pub async fn fail_connection(&self, fail: bool) {
        self.state.lock().await.fail_connection = fail;
    }

    pub async fn fail_copies(&self) {
        self.state.lock().await.fail_copies = true;
    }

    pub async fn reject_upload_of(&self, key: &str) {
        self.state
            .lock()
            .await
            .rejected_uploads
            .insert(key.to_string());
    }

    pub async fn fail_download_of(&self, key: &str) {
        self.state
            .lock()
            .await
            .failing_downloads
            .insert(key.to_string());
    }

    pub async fn delay_uploads(&self, delay: Duration) {
        self.state.lock().await.upload_delay = Some(delay);
    }
}

#[async_trait]
impl StorageClient for MemoryStorageClient {
    async fn test_connection(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.connection_tests += 1;
        if state.fail_connection {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        Ok(true)
    }

    async fn upload_file(&self, key: &str, content: &str) -> Result<bool> {
        let delay = {
            let mut state = self.state.lock().await;
            state.upload_calls += 1;
            if state.reject_uploads || state.rejected_uploads.contains(key) {
                return Ok(false);
            }
            state.upload_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .await
            .objects
            .insert(key.to_string(), content.to_string());
        Ok(true)
    }

    async fn download_file(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.download_calls += 1;
        if state.failing_downloads.contains(key) {
            return Err(SyncError::Network(format!("download of {key} failed")));
        }
        Ok(state.objects.get(key).cloned())
    }

    async fn delete_file(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().await.objects.remove(key).is_some())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().await.objects.contains_key(key))
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| RemoteObject {
                key: k.clone(),
                last_modified: None,
            })
            .collect())
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.fail_copies {
            return Err(SyncError::Storage("copy refused".to_string()));
        }
        let Some(content) = state.objects.get(source).cloned() else {
            return Ok(false);
        };
        state.objects.insert(destination.to_string(), content);
        Ok(true)
    }
}

/// In-memory vault: one main blob plus side files keyed by remote key.
pub struct MemoryVault {
    data: Mutex<String>,
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryVault {
    pub fn with_data(data: &str) -> Self {
        MemoryVault {
            data: Mutex::new(data.to_string()),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn exported(&self) -> String {
        self.data.lock().await.clone()
    }

    pub async fn set_data(&self, data: &str) {
        *self.data.lock().await = data.to_string();
    }

    pub async fn file(&self, key: &str) -> Option<String> {
        self.files.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl DataVault for MemoryVault {
    async fn export_all_data(&self) -> Result<String> {
        Ok(self.data.lock().await.clone())
    }

    async fn import_all_data(&self, json: &str) -> Result<()> {
        *self.data.lock().await = json.to_string();
        Ok(())
    }

    async fn import_file(&self, key: &str, content: &str) -> Result<()> {
        if key == DATA_FILE_KEY {
            return self.import_all_data(content).await;
        }
        self.files
            .lock()
            .await
            .insert(key.to_string(), content.to_string());
        Ok(())
    }
}

pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Client builder handing out one shared in-memory client for every provider.
pub struct StaticClientBuilder {
    client: Arc<MemoryStorageClient>,
}

impl StaticClientBuilder {
    pub fn new(client: Arc<MemoryStorageClient>) -> Self {
        StaticClientBuilder { client }
    }
}

#[async_trait]
impl ClientBuilder for StaticClientBuilder {
    async fn build(
        &self,
        _settings: &SyncSettings,
        _provider: Provider,
    ) -> Result<Arc<dyn StorageClient>> {
        Ok(self.client.clone())
    }
}
