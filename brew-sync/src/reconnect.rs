//! Reconnection and retry engine.
//!
//! An event-driven controller layered above [`SyncService`]: it reacts to
//! app foreground/background transitions and network online/offline events,
//! coalesces rapid sync requests into one debounced execution, and performs
//! silent reconnection with bounded exponential backoff. Failures never
//! surface to the user — after exhausting retries the status simply resets
//! to idle.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::{Provider, SyncSettings};
use crate::engine::SyncDirection;
use crate::service::SyncService;
use crate::status::{SyncPhase, SyncStatusStore};
use crate::utils::{Result, SyncError};

/// Backoff table shared by silent reconnection and [`with_retry`]
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Native app resumed from background
    AppResumed,
    /// Page/window became visible again
    BecameVisible,
    NetworkOnline,
    NetworkOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Upload,
    Download,
    /// Upload then download; the download is skipped if the upload fails
    Full,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Debounce before reconnecting on app resume
    pub reconnect_delay: Duration,
    /// Debounce before reconnecting when the network comes back
    pub network_recovery_delay: Duration,
    /// Debounce window coalescing rapid sync requests
    pub sync_debounce: Duration,
    pub max_retries: u32,
    /// Resume events within this interval of the last sync are ignored
    pub min_resume_interval: Duration,
    pub connection_test_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            reconnect_delay: Duration::from_millis(300),
            network_recovery_delay: Duration::from_millis(1000),
            sync_debounce: Duration::from_millis(500),
            max_retries: 3,
            min_resume_interval: Duration::from_secs(30),
            connection_test_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

struct PendingSync {
    kind: SyncKind,
    done: oneshot::Sender<bool>,
}

#[derive(Default)]
struct ManagerState {
    initialized: bool,
    reconnecting: bool,
    retry_count: u32,
    last_sync: Option<Instant>,
    pending: Option<PendingSync>,
    debounce_timer: Option<AbortHandle>,
    reconnect_timer: Option<AbortHandle>,
}

pub struct ReconnectManager {
    service: Arc<SyncService>,
    settings: Arc<RwLock<SyncSettings>>,
    config: ReconnectConfig,
    status: SyncStatusStore,
    state: Mutex<ManagerState>,
}

impl ReconnectManager {
    pub fn new(
        service: Arc<SyncService>,
        settings: Arc<RwLock<SyncSettings>>,
        config: ReconnectConfig,
    ) -> Arc<Self> {
        Arc::new(ReconnectManager {
            service,
            settings,
            config,
            status: SyncStatusStore::new(),
            state: Mutex::new(ManagerState::default()),
        })
    }

    /// Idempotent: a second call is a no-op with a log.
    pub fn initialize(&self) {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            tracing::debug!("Reconnect manager already initialized");
            return;
        }
        state.initialized = true;
        tracing::info!("Reconnect manager initialized");
    }

    pub fn status(&self) -> &SyncStatusStore {
        &self.status
    }

    /// Feed an app-lifecycle or network event into the state machine.
    pub async fn handle_event(self: &Arc<Self>, event: LifecycleEvent) {
        if !self.state.lock().unwrap().initialized {
            tracing::debug!("Ignoring {:?} before initialization", event);
            return;
        }

        match event {
            LifecycleEvent::AppResumed | LifecycleEvent::BecameVisible => {
                let provider = self.settings.read().await.active_provider();
                if provider == Provider::None {
                    return;
                }
                {
                    let state = self.state.lock().unwrap();
                    if state.reconnecting {
                        tracing::debug!("Already reconnecting, ignoring resume");
                        return;
                    }
                    // Guard against redundant reconnects on rapid
                    // foreground flicker
                    if let Some(last) = state.last_sync {
                        if last.elapsed() < self.config.min_resume_interval {
                            tracing::debug!("Synced recently, skipping resume reconnect");
                            return;
                        }
                    }
                }
                self.schedule_reconnect(self.config.reconnect_delay);
            }
            LifecycleEvent::NetworkOnline => {
                let provider = self.settings.read().await.active_provider();
                if provider == Provider::None {
                    return;
                }
                self.schedule_reconnect(self.config.network_recovery_delay);
            }
            LifecycleEvent::NetworkOffline => {
                // Cancel everything in flight; deliberately no user-visible
                // offline state.
                let mut state = self.state.lock().unwrap();
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                if let Some(timer) = state.debounce_timer.take() {
                    timer.abort();
                }
                if let Some(pending) = state.pending.take() {
                    let _ = pending.done.send(false);
                }
                state.reconnecting = false;
                drop(state);
                self.status.update(|s| {
                    s.is_reconnecting = false;
                    s.pending_changes = 0;
                });
                tracing::debug!("Network offline, pending sync timers cancelled");
            }
        }
    }

    /// Request a sync, debounced. Only the most recent request in the
    /// debounce window executes; superseded requests resolve `false`
    /// immediately ("not performed", distinct from "failed").
    pub async fn request_sync(self: &Arc<Self>, kind: SyncKind) -> bool {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if !state.initialized {
                tracing::warn!("request_sync before initialization");
                return false;
            }
            if let Some(previous) = state.pending.take() {
                let _ = previous.done.send(false);
            }
            if let Some(timer) = state.debounce_timer.take() {
                timer.abort();
            }

            let (tx, rx) = oneshot::channel();
            state.pending = Some(PendingSync { kind, done: tx });

            let manager = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(manager.config.sync_debounce).await;
                manager.run_pending_sync().await;
            });
            state.debounce_timer = Some(handle.abort_handle());
            rx
        };

        self.status.update(|s| s.pending_changes = 1);
        rx.await.unwrap_or(false)
    }

    async fn run_pending_sync(self: Arc<Self>) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.debounce_timer = None;
            state.pending.take()
        };
        let Some(pending) = pending else {
            return;
        };
        self.status.update(|s| s.pending_changes = 0);
        let ok = self.execute_sync(pending.kind).await;
        let _ = pending.done.send(ok);
    }

    async fn execute_sync(&self, kind: SyncKind) -> bool {
        let settings = self.settings.read().await.clone();
        let provider = settings.active_provider();
        self.status.update(|s| {
            s.phase = SyncPhase::Syncing;
            s.provider = provider;
        });

        let ok = match kind {
            SyncKind::Upload => {
                self.service
                    .sync(&settings, SyncDirection::Upload)
                    .await
                    .success
            }
            SyncKind::Download => {
                self.service
                    .sync(&settings, SyncDirection::Download)
                    .await
                    .success
            }
            SyncKind::Full => {
                let upload = self.service.sync(&settings, SyncDirection::Upload).await;
                if upload.success {
                    self.service
                        .sync(&settings, SyncDirection::Download)
                        .await
                        .success
                } else {
                    false
                }
            }
        };

        if ok {
            self.state.lock().unwrap().last_sync = Some(Instant::now());
        }
        self.status
            .set_phase(if ok { SyncPhase::Success } else { SyncPhase::Error });
        ok
    }

    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(previous) = state.reconnect_timer.take() {
            previous.abort();
        }
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.silent_reconnect().await;
        });
        state.reconnect_timer = Some(handle.abort_handle());
    }

    /// One silent reconnection attempt: connection test, then pull the
    /// latest data. On failure, reschedules itself with exponential backoff
    /// until the retry budget runs out, then resets to idle without
    /// surfacing anything.
    async fn silent_reconnect(self: Arc<Self>) {
        let retry_count = {
            let mut state = self.state.lock().unwrap();
            state.reconnect_timer = None;
            state.reconnecting = true;
            state.retry_count
        };
        self.status.update(|s| {
            s.is_reconnecting = true;
            s.retry_count = retry_count;
        });

        let settings = self.settings.read().await.clone();
        let provider = settings.active_provider();
        if provider == Provider::None {
            self.finish_reconnect(false);
            return;
        }

        match self.try_reconnect(&settings, provider).await {
            Ok(()) => {
                tracing::info!("Silent reconnect to {} succeeded", provider);
                {
                    let mut state = self.state.lock().unwrap();
                    state.last_sync = Some(Instant::now());
                }
                self.finish_reconnect(true);
                self.status.update(|s| s.provider = provider);
            }
            Err(e) => {
                let next = {
                    let mut state = self.state.lock().unwrap();
                    state.retry_count += 1;
                    if state.retry_count <= self.config.max_retries {
                        Some(state.retry_count)
                    } else {
                        None
                    }
                };
                match next {
                    Some(count) => {
                        let delay = RETRY_DELAYS[(count as usize - 1).min(RETRY_DELAYS.len() - 1)];
                        tracing::debug!(
                            "Silent reconnect failed ({}), retry {}/{} in {:?}",
                            e,
                            count,
                            self.config.max_retries,
                            delay
                        );
                        self.status.update(|s| s.retry_count = count);
                        self.schedule_reconnect(delay);
                    }
                    None => {
                        // Retry budget exhausted: give up silently
                        tracing::debug!(
                            "Silent reconnect gave up after {} retries: {}",
                            self.config.max_retries,
                            e
                        );
                        self.finish_reconnect(false);
                    }
                }
            }
        }
    }

    async fn try_reconnect(&self, settings: &SyncSettings, provider: Provider) -> Result<()> {
        let connected = with_timeout(
            self.service.test_connection(settings, provider),
            self.config.connection_test_timeout,
            "connection test timed out",
        )
        .await??;
        if !connected {
            return Err(SyncError::Network("connection test failed".to_string()));
        }

        // Supabase syncs through its realtime channel; connectivity is all
        // this engine re-establishes for it.
        if provider == Provider::Supabase {
            return Ok(());
        }

        let result = with_timeout(
            self.service.sync(settings, SyncDirection::Download),
            self.config.transfer_timeout,
            "download timed out",
        )
        .await?;
        if !result.success {
            return Err(SyncError::Sync(result.message));
        }
        Ok(())
    }

    fn finish_reconnect(&self, _succeeded: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.reconnecting = false;
            state.retry_count = 0;
        }
        self.status.update(|s| {
            s.is_reconnecting = false;
            s.retry_count = 0;
            s.phase = SyncPhase::Idle;
        });
    }
}

/// Race a future against a rejecting timer. This only stops *waiting* — a
/// still-running underlying request is not cancelled, its result is ignored.
pub async fn with_timeout<F, T>(future: F, duration: Duration, message: &str) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| SyncError::Timeout(message.to_string()))
}

/// Generic bounded-retry helper over the shared backoff table. Rethrows the
/// last error only after exhausting all attempts.
pub async fn with_retry<F, Fut, T>(operation: F, name: &str, max_retries: Option<u32>) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = max_retries.unwrap_or(3);
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_retries {
                    tracing::debug!("{} failed after {} attempts: {}", name, attempt + 1, e);
                    return Err(e);
                }
                let delay = RETRY_DELAYS[(attempt as usize).min(RETRY_DELAYS.len() - 1)];
                tracing::debug!(
                    "{} attempt {} failed: {}; retrying in {:?}",
                    name,
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FileMetadata, SyncMetadata, METADATA_KEY};
    use crate::testutil::{
        verified_s3_settings, MemoryKv, MemoryStorageClient, MemoryVault, StaticClientBuilder,
    };
    use crate::vault::DATA_FILE_KEY;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::task::yield_now;
    use tokio::time::sleep;

    fn manager_with(client: Arc<MemoryStorageClient>) -> Arc<ReconnectManager> {
        let service = Arc::new(crate::service::SyncService::with_client_builder(
            Arc::new(MemoryVault::with_data(r#"{"a":1}"#)),
            Arc::new(MemoryKv::new()),
            Box::new(StaticClientBuilder::new(client)),
        ));
        let settings = Arc::new(RwLock::new(verified_s3_settings("brew")));
        ReconnectManager::new(service, settings, ReconnectConfig::default())
    }

    async fn seed_remote(client: &MemoryStorageClient) {
        let content = r#"{"a":1}"#;
        let mut metadata = SyncMetadata::new("device-remote");
        metadata.files.insert(
            DATA_FILE_KEY.to_string(),
            FileMetadata {
                size: content.len() as u64,
                hash: "h".to_string(),
                last_modified: Utc::now(),
            },
        );
        client.put(DATA_FILE_KEY, content).await;
        client
            .put(METADATA_KEY, &serde_json::to_string(&metadata).unwrap())
            .await;
    }

    async fn settle() {
        for _ in 0..10 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_silent_reset() {
        let client = Arc::new(MemoryStorageClient::new());
        client.fail_connection(true).await;
        let manager = manager_with(client.clone());
        manager.initialize();

        manager.handle_event(LifecycleEvent::NetworkOnline).await;

        // First attempt after the 1000ms network recovery delay
        sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 1);

        // Retries at +1s, +2s, +4s
        sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 2);

        sleep(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 3);

        sleep(Duration::from_millis(4000)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 4);

        // Budget exhausted: no further retry, silent reset to idle
        sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 4);
        let snapshot = manager.status().snapshot();
        assert!(!snapshot.is_reconnecting);
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.phase, SyncPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalescing() {
        let client = Arc::new(MemoryStorageClient::new());
        seed_remote(&client).await;
        let manager = manager_with(client.clone());
        manager.initialize();

        let m1 = manager.clone();
        let first = tokio::spawn(async move { m1.request_sync(SyncKind::Download).await });
        yield_now().await;
        let m2 = manager.clone();
        let second = tokio::spawn(async move { m2.request_sync(SyncKind::Download).await });
        yield_now().await;
        let m3 = manager.clone();
        let third = tokio::spawn(async move { m3.request_sync(SyncKind::Download).await });

        // First two are superseded and resolve false; only the last runs
        assert!(!first.await.unwrap());
        assert!(!second.await.unwrap());
        assert!(third.await.unwrap());

        // Exactly one sync executed: metadata + data blob
        assert_eq!(client.download_calls().await, 2);
        assert_eq!(manager.status().snapshot().phase, SyncPhase::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_cancels_pending_timers() {
        let client = Arc::new(MemoryStorageClient::new());
        let manager = manager_with(client.clone());
        manager.initialize();

        manager.handle_event(LifecycleEvent::NetworkOnline).await;
        manager.handle_event(LifecycleEvent::NetworkOffline).await;

        sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_guard_within_interval() {
        let client = Arc::new(MemoryStorageClient::new());
        seed_remote(&client).await;
        let manager = manager_with(client.clone());
        manager.initialize();

        manager.handle_event(LifecycleEvent::AppResumed).await;
        sleep(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 1);

        // Resumed again right away: last sync is recent, no reconnect
        manager.handle_event(LifecycleEvent::AppResumed).await;
        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 1);

        // After the 30s guard expires a resume reconnects again
        sleep(Duration::from_secs(31)).await;
        manager.handle_event(LifecycleEvent::AppResumed).await;
        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_ignored_before_initialize() {
        let client = Arc::new(MemoryStorageClient::new());
        let manager = manager_with(client.clone());

        manager.handle_event(LifecycleEvent::NetworkOnline).await;
        sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(client.connection_tests().await, 0);
        assert!(!manager.request_sync(SyncKind::Download).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_and_rethrows() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SyncError::Network("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
            "flaky-op",
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Exhaustion rethrows the last error
        let result: Result<u32> = with_retry(
            || async { Err(SyncError::Network("down".to_string())) },
            "doomed-op",
            Some(1),
        )
        .await;
        assert!(matches!(result, Err(SyncError::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let result = with_timeout(
            async {
                sleep(Duration::from_secs(60)).await;
                1u32
            },
            Duration::from_secs(1),
            "operation timed out",
        )
        .await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));

        let result = with_timeout(async { 1u32 }, Duration::from_secs(1), "never").await;
        assert_eq!(result.unwrap(), 1);
    }
}
