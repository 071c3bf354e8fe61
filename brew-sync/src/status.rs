//! Process-wide observable sync status.
//!
//! The reconnection engine writes here; UI layers subscribe through a watch
//! receiver. Status changes never throw — failures only flip the snapshot.

use serde::Serialize;
use tokio::sync::watch;

use crate::config::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub phase: SyncPhase,
    pub provider: Provider,
    pub is_reconnecting: bool,
    pub retry_count: u32,
    pub pending_changes: u32,
}

impl Default for SyncStatusSnapshot {
    fn default() -> Self {
        SyncStatusSnapshot {
            phase: SyncPhase::Idle,
            provider: Provider::None,
            is_reconnecting: false,
            retry_count: 0,
            pending_changes: 0,
        }
    }
}

#[derive(Clone)]
pub struct SyncStatusStore {
    tx: watch::Sender<SyncStatusSnapshot>,
}

impl SyncStatusStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatusSnapshot::default());
        SyncStatusStore { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStatusSnapshot)) {
        self.tx.send_modify(f);
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        self.update(|s| s.phase = phase);
    }
}

impl Default for SyncStatusStore {
    fn default() -> Self {
        Self::new()
    }
}
