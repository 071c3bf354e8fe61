//! Utility modules for the sync engine.

pub mod errors;
pub mod logger;

pub use errors::{Result, SyncError};
