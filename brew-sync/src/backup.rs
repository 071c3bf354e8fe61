//! Backup rotation and restore.
//!
//! Backups are server-side copies of the just-uploaded main blob, stored
//! under the `backups/` prefix and rotated oldest-first once the count
//! exceeds [`MAX_BACKUPS`]. Every failure in here is logged and swallowed:
//! a backup problem must never block the primary sync operation.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::metadata::BackupRecord;
use crate::storage::StorageClient;

pub const MAX_BACKUPS: usize = 5;

const BACKUP_PREFIX: &str = "backups/";

/// A backup discovered on the server. The content hash is only known for
/// backups recorded in metadata at creation time, not for listed ones.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// Provider-independent backup rotation over a [`StorageClient`].
pub struct BackupManager;

impl BackupManager {
    /// Deterministic backup key: `backups/backup-<ISO8601-dashed>.json`.
    /// Millisecond resolution is enough — calls are serialized by the
    /// enclosing sync operation.
    pub fn generate_backup_key() -> String {
        let timestamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        format!("{BACKUP_PREFIX}backup-{timestamp}.json")
    }

    /// Copy the already-uploaded main file to a fresh backup key server-side.
    /// Returns `None` on any failure so the caller can continue the sync.
    pub async fn create_backup_by_copy(
        client: &dyn StorageClient,
        source_key: &str,
        hash: &str,
    ) -> Option<BackupRecord> {
        let backup_key = Self::generate_backup_key();
        match client.copy_file(source_key, &backup_key).await {
            Ok(true) => {
                tracing::info!("Created backup {}", backup_key);
                Some(BackupRecord {
                    timestamp: Utc::now(),
                    key: backup_key,
                    hash: hash.to_string(),
                })
            }
            Ok(false) => {
                tracing::warn!("Backup copy to {} refused by server", backup_key);
                None
            }
            Err(e) => {
                tracing::warn!("Backup copy to {} failed: {}", backup_key, e);
                None
            }
        }
    }

    /// List server-side backups, oldest first. Timestamps come from the
    /// provider's `lastModified` when present, otherwise from the filename.
    pub async fn list_backups(client: &dyn StorageClient) -> Vec<BackupEntry> {
        let objects = match client.list_files(BACKUP_PREFIX).await {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!("Listing backups failed: {}", e);
                return Vec::new();
            }
        };

        let mut entries: Vec<BackupEntry> = objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.key.rsplit('/').next().unwrap_or(&obj.key);
                if !name.starts_with("backup-") || !name.ends_with(".json") {
                    return None;
                }
                let timestamp = obj
                    .last_modified
                    .or_else(|| parse_backup_timestamp(name))?;
                Some(BackupEntry {
                    key: obj.key.clone(),
                    timestamp,
                })
            })
            .collect();

        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Delete the oldest backups beyond [`MAX_BACKUPS`]. Best-effort: a
    /// failed deletion is logged and the rest of the cleanup continues.
    pub async fn cleanup_old_backups(client: &dyn StorageClient) {
        let entries = Self::list_backups(client).await;
        if entries.len() <= MAX_BACKUPS {
            return;
        }

        let excess = entries.len() - MAX_BACKUPS;
        for entry in entries.into_iter().take(excess) {
            match client.delete_file(&entry.key).await {
                Ok(true) => tracing::info!("Removed old backup {}", entry.key),
                Ok(false) => tracing::warn!("Old backup {} was already gone", entry.key),
                Err(e) => tracing::warn!("Deleting old backup {} failed: {}", entry.key, e),
            }
        }
    }

    /// Backup step after a successful upload. Skipped entirely when the
    /// content hash matches the last known backup hash.
    pub async fn perform_backup_after_upload(
        client: &dyn StorageClient,
        source_key: &str,
        hash: &str,
        last_backup_hash: Option<&str>,
    ) -> Option<BackupRecord> {
        if last_backup_hash == Some(hash) {
            tracing::debug!("Data unchanged since last backup, skipping");
            return None;
        }

        let record = Self::create_backup_by_copy(client, source_key, hash).await;
        Self::cleanup_old_backups(client).await;
        record
    }

    /// Download a backup's content. `None` means the file is missing or the
    /// download failed; the caller decides the fallback.
    pub async fn restore_backup(client: &dyn StorageClient, backup_key: &str) -> Option<String> {
        match client.download_file(backup_key).await {
            Ok(Some(content)) => Some(content),
            Ok(None) => {
                tracing::warn!("Backup {} not found on server", backup_key);
                None
            }
            Err(e) => {
                tracing::warn!("Restoring backup {} failed: {}", backup_key, e);
                None
            }
        }
    }
}

/// Recover a timestamp from `backup-<ISO8601-with-dashes>.json`. The dashed
/// form replaced `:` and `.`, so the time portion needs them put back.
fn parse_backup_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_prefix("backup-")?.strip_suffix(".json")?;
    let (date, time) = stem.split_once('T')?;

    let parts: Vec<&str> = time.trim_end_matches('Z').split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let rfc3339 = format!(
        "{date}T{}:{}:{}.{}Z",
        parts[0], parts[1], parts[2], parts[3]
    );
    DateTime::parse_from_rfc3339(&rfc3339)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
