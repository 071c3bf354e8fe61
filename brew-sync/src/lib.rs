//! Brew Sync Library
//!
//! Multi-provider cloud backup/sync engine for the brew guide data vault.
//! The application dataset is one opaque JSON blob pushed to or pulled from
//! an S3-compatible store, a WebDAV server, or Supabase Storage, with
//! rotated server-side backups and a silent reconnection layer on top.

pub mod backup;
pub mod config;
pub mod engine;
pub mod metadata;
pub mod reconnect;
pub mod service;
pub mod status;
pub mod storage;
pub mod utils;
pub mod vault;

#[cfg(test)]
pub mod testutil;

// Re-export commonly used types
pub use config::{Provider, SyncSettings};
pub use engine::{SyncDirection, SyncEngine, SyncOptions, SyncResult};
pub use reconnect::{LifecycleEvent, ReconnectConfig, ReconnectManager, SyncKind};
pub use service::SyncService;
pub use status::{SyncPhase, SyncStatusStore};
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
