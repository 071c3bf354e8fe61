//! The synchronization protocol engine.
//!
//! [`SyncEngine`] drives one explicit-direction sync against a provider's
//! [`StorageClient`], delegating backup rotation to [`BackupManager`] and
//! metadata persistence to [`MetadataStore`]. Its public contract is
//! exception-free: every internal error is converted into a failed
//! [`SyncResult`] carrying the accumulated debug log.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::backup::{BackupEntry, BackupManager, MAX_BACKUPS};
use crate::config::Provider;
use crate::metadata::{FileMetadata, MetadataStore, SyncMetadata};
use crate::storage::StorageClient;
use crate::utils::{Result, SyncError};
use crate::vault::{DataVault, KeyValueStore, DATA_FILE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Upload,
    Download,
}

/// Options for one sync call. There is no automatic bidirectional merge;
/// the direction must be explicit.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub direction: Option<SyncDirection>,
}

/// Outcome of one sync call. Produced fresh every time, never persisted.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub uploaded_files: u32,
    pub downloaded_files: u32,
    pub errors: Vec<String>,
    pub debug_logs: Vec<String>,
}

impl SyncResult {
    fn failure(message: impl Into<String>, logs: Vec<String>) -> Self {
        let message = message.into();
        SyncResult {
            success: false,
            errors: vec![message.clone()],
            message,
            uploaded_files: 0,
            downloaded_files: 0,
            debug_logs: logs,
        }
    }
}

/// Timestamped, human-readable log lines returned to the caller for
/// diagnostics. A deliberate observability contract, not incidental logging.
struct DebugLog {
    lines: Vec<String>,
}

impl DebugLog {
    fn new() -> Self {
        DebugLog { lines: Vec::new() }
    }

    fn add(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!("{}", message);
        self.lines
            .push(format!("[{}] {}", Utc::now().format("%H:%M:%S%.3f"), message));
    }
}

fn content_hash(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Clears the in-progress flag when dropped, so a caller cancelling the
/// `sync()` future mid-await (e.g. through a timeout) cannot leave the
/// engine wedged.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    provider: Provider,
    client: Arc<dyn StorageClient>,
    metadata: MetadataStore,
    vault: Arc<dyn DataVault>,
    device_id: String,
    sync_in_progress: AtomicBool,
    disconnected: AtomicBool,
    disconnect_calls: AtomicU32,
}

impl SyncEngine {
    pub fn new(
        provider: Provider,
        client: Arc<dyn StorageClient>,
        kv: Arc<dyn KeyValueStore>,
        vault: Arc<dyn DataVault>,
        device_id: String,
    ) -> Self {
        let metadata = MetadataStore::new(client.clone(), kv, &provider.to_string());
        SyncEngine {
            provider,
            client,
            metadata,
            vault,
            device_id,
            sync_in_progress: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            disconnect_calls: AtomicU32::new(0),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Run one sync in the given direction. Never panics or returns `Err`;
    /// every failure mode comes back as a failed result.
    pub async fn sync(&self, options: SyncOptions) -> SyncResult {
        if self.is_disconnected() {
            return SyncResult::failure("sync manager is disconnected", Vec::new());
        }

        let Some(direction) = options.direction else {
            return SyncResult::failure("sync direction not specified", Vec::new());
        };

        // Set synchronously before the first await so a second call in the
        // same tick is already rejected.
        if self.sync_in_progress.swap(true, Ordering::SeqCst) {
            return SyncResult::failure("sync already in progress", Vec::new());
        }
        let _in_progress = InProgressGuard(&self.sync_in_progress);

        let mut log = DebugLog::new();
        let outcome = match direction {
            SyncDirection::Upload => self.run_upload(&mut log).await,
            SyncDirection::Download => self.run_download(&mut log).await,
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                log.add(format!("sync aborted: {e}"));
                SyncResult::failure(format!("sync failed: {e}"), log.lines)
            }
        }
    }

    async fn run_upload(&self, log: &mut DebugLog) -> Result<SyncResult> {
        log.add(format!("starting upload to {}", self.provider));

        let data = self.vault.export_all_data().await?;
        if data.trim().is_empty() {
            log.add("local dataset is empty, refusing to upload");
            return Ok(SyncResult::failure(
                "local dataset is empty, nothing to upload",
                std::mem::take(&mut log.lines),
            ));
        }

        let hash = content_hash(&data);
        log.add(format!("exported {} bytes, hash {}", data.len(), &hash[..12]));

        // Previous remote metadata feeds the backup skip check; an
        // unreadable document is the same as no document.
        let previous = match self.metadata.remote().await {
            Ok(previous) => previous,
            Err(e) => {
                log.add(format!("remote metadata unavailable: {e}"));
                None
            }
        };

        let uploaded = self.client.upload_file(DATA_FILE_KEY, &data).await?;
        if !uploaded {
            log.add("storage backend rejected the upload");
            return Ok(SyncResult::failure(
                "upload rejected by storage backend",
                std::mem::take(&mut log.lines),
            ));
        }
        log.add(format!("uploaded {DATA_FILE_KEY}"));

        let mut backups = previous.map(|m| m.backups).unwrap_or_default();
        let last_backup_hash = backups.last().map(|b| b.hash.clone());
        if let Some(record) = BackupManager::perform_backup_after_upload(
            self.client.as_ref(),
            DATA_FILE_KEY,
            &hash,
            last_backup_hash.as_deref(),
        )
        .await
        {
            log.add(format!("backup created at {}", record.key));
            backups.push(record);
        } else {
            log.add("no new backup created");
        }
        if backups.len() > MAX_BACKUPS {
            let excess = backups.len() - MAX_BACKUPS;
            backups.drain(..excess);
        }

        let mut metadata = SyncMetadata::new(&self.device_id);
        metadata.files.insert(
            DATA_FILE_KEY.to_string(),
            FileMetadata {
                size: data.len() as u64,
                hash,
                last_modified: Utc::now(),
            },
        );
        metadata.backups = backups;

        self.metadata.save_local(&metadata).await?;
        self.metadata.save_remote(&metadata).await?;
        log.add("metadata overwritten locally and remotely");

        Ok(SyncResult {
            success: true,
            message: "upload completed".to_string(),
            uploaded_files: 1,
            downloaded_files: 0,
            errors: Vec::new(),
            debug_logs: std::mem::take(&mut log.lines),
        })
    }

    async fn run_download(&self, log: &mut DebugLog) -> Result<SyncResult> {
        log.add(format!("starting download from {}", self.provider));

        let remote = self.metadata.remote().await?;
        let Some(remote) = remote.filter(|m| !m.files.is_empty()) else {
            log.add("remote metadata missing or empty");
            return Ok(SyncResult::failure(
                "cloud has no data to download",
                std::mem::take(&mut log.lines),
            ));
        };

        let mut downloaded = 0u32;
        let mut errors = Vec::new();

        // Per-file failures are recorded but never abort the loop; files
        // that did arrive are committed.
        for key in remote.files.keys() {
            match self.client.download_file(key).await {
                Ok(Some(content)) => match self.vault.import_file(key, &content).await {
                    Ok(()) => {
                        downloaded += 1;
                        log.add(format!("downloaded {key} ({} bytes)", content.len()));
                    }
                    Err(e) => {
                        log.add(format!("importing {key} failed: {e}"));
                        errors.push(format!("importing {key} failed: {e}"));
                    }
                },
                Ok(None) => {
                    log.add(format!("{key} listed in metadata but missing on server"));
                    errors.push(format!("{key} missing on server"));
                }
                Err(e) => {
                    log.add(format!("downloading {key} failed: {e}"));
                    errors.push(format!("downloading {key} failed: {e}"));
                }
            }
        }

        // Local metadata reflects the remote file set that was attempted,
        // even after partial failures.
        self.metadata.save_local(&remote).await?;
        log.add("local metadata updated from remote");

        let success = errors.is_empty();
        let message = if success {
            "download completed".to_string()
        } else {
            format!("download finished with {} error(s)", errors.len())
        };
        Ok(SyncResult {
            success,
            message,
            uploaded_files: 0,
            downloaded_files: downloaded,
            errors,
            debug_logs: std::mem::take(&mut log.lines),
        })
    }

    pub async fn test_connection(&self) -> Result<bool> {
        if self.is_disconnected() {
            return Err(SyncError::Sync("sync manager is disconnected".to_string()));
        }
        self.client.test_connection().await
    }

    pub async fn list_backups(&self) -> Vec<BackupEntry> {
        if self.is_disconnected() {
            return Vec::new();
        }
        BackupManager::list_backups(self.client.as_ref()).await
    }

    pub async fn restore_from_backup(&self, backup_key: &str) -> bool {
        if self.is_disconnected() {
            return false;
        }
        let Some(content) = BackupManager::restore_backup(self.client.as_ref(), backup_key).await
        else {
            return false;
        };
        match self.vault.import_all_data(&content).await {
            Ok(()) => {
                tracing::info!("Restored local dataset from {}", backup_key);
                true
            }
            Err(e) => {
                tracing::warn!("Importing restored backup failed: {}", e);
                false
            }
        }
    }

    /// Release this engine. Called by the service before a replacement
    /// engine is constructed for a changed config.
    pub fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            tracing::info!("Sync engine for {} disconnected", self.provider);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}
