//! Sync settings and provider configuration.
//!
//! Loads settings from a TOML file. Each provider carries a `verified` flag
//! set by a successful connection test; a provider that was never verified
//! is not treated as active even when its fields are fully populated.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Cloud backend selector. `None` means sync is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    None,
    S3,
    Webdav,
    Supabase,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::None => "none",
            Provider::S3 => "s3",
            Provider::Webdav => "webdav",
            Provider::Supabase => "supabase",
        };
        f.write_str(name)
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Provider selected by the user
    #[serde(default)]
    pub active: Provider,

    #[serde(default)]
    pub s3: Option<S3Config>,

    #[serde(default)]
    pub webdav: Option<WebdavConfig>,

    #[serde(default)]
    pub supabase: Option<SupabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible stores (R2, MinIO). Empty = AWS.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,

    /// Key prefix under which all objects live
    #[serde(default)]
    pub prefix: String,

    /// Set after a successful connection test
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebdavConfig {
    /// Base URL of the WebDAV server
    pub url: String,
    pub username: String,
    pub password: String,

    /// Collection under the base URL holding the synced objects
    #[serde(default = "default_webdav_root")]
    pub root: String,

    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Project URL, e.g. https://xyz.supabase.co
    pub url: String,
    pub anon_key: String,

    #[serde(default = "default_supabase_bucket")]
    pub bucket: String,

    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub verified: bool,
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_webdav_root() -> String {
    "brew-guide".to_string()
}

fn default_supabase_bucket() -> String {
    "brew-guide".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            active: Provider::None,
            s3: None,
            webdav: None,
            supabase: None,
        }
    }
}

impl SyncSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: SyncSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Persist settings back to a TOML file (used after connection tests
    /// flip the `verified` flag)
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the active provider. A provider counts only if its config is
    /// present and has passed a connection test; unverified credentials
    /// resolve to `Provider::None`.
    pub fn active_provider(&self) -> Provider {
        match self.active {
            Provider::S3 if self.s3.as_ref().is_some_and(|c| c.verified) => Provider::S3,
            Provider::Webdav if self.webdav.as_ref().is_some_and(|c| c.verified) => {
                Provider::Webdav
            }
            Provider::Supabase if self.supabase.as_ref().is_some_and(|c| c.verified) => {
                Provider::Supabase
            }
            _ => Provider::None,
        }
    }

    /// Content fingerprint of the given provider's config, used to detect
    /// config changes for manager-cache invalidation. serde_json maps keep
    /// keys sorted, so the digest is insensitive to field order.
    pub fn fingerprint(&self, provider: Provider) -> Option<String> {
        let value = match provider {
            Provider::S3 => serde_json::to_value(self.s3.as_ref()?).ok()?,
            Provider::Webdav => serde_json::to_value(self.webdav.as_ref()?).ok()?,
            Provider::Supabase => serde_json::to_value(self.supabase.as_ref()?).ok()?,
            Provider::None => return None,
        };
        let canonical = serde_json::to_string(&value).ok()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Some(hex::encode(&digest[..8]))
    }
}
