//! Storage backend abstraction.
//!
//! Every cloud provider implements [`StorageClient`]: a minimal capability
//! surface over blobs addressed by string keys. The sync engine and the
//! backup manager only ever talk to this trait; the wire protocol behind it
//! (S3, WebDAV, Supabase Storage REST) is each client's own business.

pub mod s3;
pub mod supabase;
pub mod webdav;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::utils::Result;

/// A listed remote object. `last_modified` is best-effort — not every
/// backend reports it.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Capability interface each cloud backend must implement.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Verify credentials and reachability
    async fn test_connection(&self) -> Result<bool>;

    /// Upload a blob, overwriting any existing object at `key`
    async fn upload_file(&self, key: &str, content: &str) -> Result<bool>;

    /// Download a blob. A missing object is `Ok(None)`, not an error.
    async fn download_file(&self, key: &str) -> Result<Option<String>>;

    async fn delete_file(&self, key: &str) -> Result<bool>;

    async fn file_exists(&self, key: &str) -> Result<bool>;

    /// List objects under a key prefix
    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Server-side copy; no bytes travel through the client
    async fn copy_file(&self, source: &str, destination: &str) -> Result<bool>;
}
