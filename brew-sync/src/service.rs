//! Provider-selection and engine-lifecycle façade.
//!
//! [`SyncService`] maps user settings to a live, correctly configured
//! [`SyncEngine`]: it resolves the active provider, memoizes at most one
//! engine per process keyed by provider + config fingerprint, and
//! disconnects a stale engine before constructing its replacement. All
//! entry points return structured failures instead of throwing past the
//! service boundary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Provider, SyncSettings};
use crate::engine::{SyncDirection, SyncEngine, SyncOptions, SyncResult};
use crate::storage::s3::S3StorageClient;
use crate::storage::supabase::SupabaseClient;
use crate::storage::webdav::WebdavClient;
use crate::storage::StorageClient;
use crate::utils::{Result, SyncError};
use crate::vault::{ensure_device_id, DataVault, KeyValueStore};

/// Seam for constructing provider clients; tests substitute in-memory ones.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build(
        &self,
        settings: &SyncSettings,
        provider: Provider,
    ) -> Result<Arc<dyn StorageClient>>;
}

/// Default builder wiring the three real provider clients.
pub struct ProviderClientBuilder;

#[async_trait]
impl ClientBuilder for ProviderClientBuilder {
    async fn build(
        &self,
        settings: &SyncSettings,
        provider: Provider,
    ) -> Result<Arc<dyn StorageClient>> {
        match provider {
            Provider::S3 => {
                let config = settings
                    .s3
                    .as_ref()
                    .ok_or_else(|| SyncError::Config("S3 is not configured".to_string()))?;
                Ok(Arc::new(S3StorageClient::new(config).await?))
            }
            Provider::Webdav => {
                let config = settings
                    .webdav
                    .as_ref()
                    .ok_or_else(|| SyncError::Config("WebDAV is not configured".to_string()))?;
                Ok(Arc::new(WebdavClient::new(config)?))
            }
            Provider::Supabase => {
                let config = settings
                    .supabase
                    .as_ref()
                    .ok_or_else(|| SyncError::Config("Supabase is not configured".to_string()))?;
                Ok(Arc::new(SupabaseClient::new(config)?))
            }
            Provider::None => Err(SyncError::Config(
                "no cloud sync provider configured".to_string(),
            )),
        }
    }
}

struct CachedEngine {
    provider: Provider,
    fingerprint: String,
    engine: Arc<SyncEngine>,
}

pub struct SyncService {
    vault: Arc<dyn DataVault>,
    kv: Arc<dyn KeyValueStore>,
    clients: Box<dyn ClientBuilder>,
    cache: tokio::sync::Mutex<Option<CachedEngine>>,
}

impl SyncService {
    pub fn new(vault: Arc<dyn DataVault>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_client_builder(vault, kv, Box::new(ProviderClientBuilder))
    }

    pub fn with_client_builder(
        vault: Arc<dyn DataVault>,
        kv: Arc<dyn KeyValueStore>,
        clients: Box<dyn ClientBuilder>,
    ) -> Self {
        SyncService {
            vault,
            kv,
            clients,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolve the active provider from settings (only verified configs
    /// count, see [`SyncSettings::active_provider`]).
    pub fn active_provider(&self, settings: &SyncSettings) -> Provider {
        settings.active_provider()
    }

    /// Get or build the engine for `provider`. Returns `Ok(None)` when the
    /// provider has no pull/push engine: Supabase syncs through its own
    /// realtime channel, not through this protocol.
    pub async fn get_engine(
        &self,
        settings: &SyncSettings,
        provider: Provider,
    ) -> Result<Option<Arc<SyncEngine>>> {
        if matches!(provider, Provider::None | Provider::Supabase) {
            return Ok(None);
        }

        let fingerprint = settings.fingerprint(provider).ok_or_else(|| {
            SyncError::Config(format!("provider {provider} has no configuration"))
        })?;

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.provider == provider
                && cached.fingerprint == fingerprint
                && !cached.engine.is_disconnected()
            {
                return Ok(Some(cached.engine.clone()));
            }
        }

        // Config changed or provider switched: release the old engine
        // before any new one touches shared remote state.
        if let Some(stale) = cache.take() {
            tracing::info!(
                "Sync config changed, disconnecting {} engine",
                stale.provider
            );
            stale.engine.disconnect();
        }

        let client = self.clients.build(settings, provider).await?;
        let device_id = ensure_device_id(&self.kv).await?;
        let engine = Arc::new(SyncEngine::new(
            provider,
            client,
            self.kv.clone(),
            self.vault.clone(),
            device_id,
        ));
        *cache = Some(CachedEngine {
            provider,
            fingerprint,
            engine: engine.clone(),
        });
        Ok(Some(engine))
    }

    /// Single sync entry point. Never throws; every short-circuit comes
    /// back as a structured failure result.
    pub async fn sync(&self, settings: &SyncSettings, direction: SyncDirection) -> SyncResult {
        let provider = self.active_provider(settings);
        if provider == Provider::None {
            return failure("no cloud sync provider configured");
        }

        let engine = match self.get_engine(settings, provider).await {
            Ok(Some(engine)) => engine,
            Ok(None) => return failure("sync manager initialization failed"),
            Err(e) => return failure(format!("sync manager initialization failed: {e}")),
        };

        engine
            .sync(SyncOptions {
                direction: Some(direction),
            })
            .await
    }

    /// Test connectivity for a provider without requiring it to be active
    /// or verified yet — this is how a config becomes verified.
    pub async fn test_connection(
        &self,
        settings: &SyncSettings,
        provider: Provider,
    ) -> Result<bool> {
        if provider == Provider::None {
            return Ok(false);
        }
        let client = self.clients.build(settings, provider).await?;
        client.test_connection().await
    }

    pub async fn list_backups(
        &self,
        settings: &SyncSettings,
    ) -> Result<Vec<crate::backup::BackupEntry>> {
        let provider = self.active_provider(settings);
        match self.get_engine(settings, provider).await? {
            Some(engine) => Ok(engine.list_backups().await),
            None => Ok(Vec::new()),
        }
    }

    pub async fn restore_from_backup(&self, settings: &SyncSettings, backup_key: &str) -> bool {
        let provider = self.active_provider(settings);
        match self.get_engine(settings, provider).await {
            Ok(Some(engine)) => engine.restore_from_backup(backup_key).await,
            _ => false,
        }
    }
}

fn failure(message: impl Into<String>) -> SyncResult {
    let message = message.into();
    SyncResult {
        success: false,
        errors: vec![message.clone()],
        message,
        uploaded_files: 0,
        downloaded_files: 0,
        debug_logs: Vec::new(),
    }
}
