//! Supabase Storage client.
//!
//! Talks to the Storage REST API (`/storage/v1/...`) with the project's
//! anon key. Note that this provider's actual data sync runs over its
//! realtime channel outside the pull/push protocol — this client exists for
//! connection testing and for the shared backup machinery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{RemoteObject, StorageClient};
use crate::config::SupabaseConfig;
use crate::utils::{Result, SyncError};

pub struct SupabaseClient {
    http: reqwest::Client,
    base: String,
    bucket: String,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    updated_at: Option<String>,
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let key_value = config
            .anon_key
            .parse()
            .map_err(|_| SyncError::Config("invalid Supabase anon key".to_string()))?;
        let bearer = format!("Bearer {}", config.anon_key)
            .parse()
            .map_err(|_| SyncError::Config("invalid Supabase anon key".to_string()))?;
        headers.insert("apikey", key_value);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(SyncError::Http)?;

        Ok(SupabaseClient {
            http,
            base: config.url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base,
            self.bucket,
            self.full_key(key)
        )
    }
}

#[async_trait]
impl StorageClient for SupabaseClient {
    async fn test_connection(&self) -> Result<bool> {
        let url = format!("{}/storage/v1/bucket/{}", self.base, self.bucket);
        let response = self.http.get(&url).send().await?;
        if response.status().is_success() {
            Ok(true)
        } else {
            tracing::warn!("Supabase connection test failed: {}", response.status());
            Ok(false)
        }
    }

    async fn upload_file(&self, key: &str, content: &str) -> Result<bool> {
        let response = self
            .http
            .post(self.object_url(key))
            .header("x-upsert", "true")
            .header("Content-Type", "application/json")
            .body(content.to_string())
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn download_file(&self, key: &str) -> Result<Option<String>> {
        let response = self.http.get(self.object_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(SyncError::Storage(format!(
                "Supabase GET {key} failed: {status}"
            ))),
        }
    }

    async fn delete_file(&self, key: &str) -> Result<bool> {
        let response = self.http.delete(self.object_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SyncError::Storage(format!(
                "Supabase DELETE {key} failed: {status}"
            ))),
        }
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let response = self.http.head(self.object_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SyncError::Storage(format!(
                "Supabase HEAD {key} failed: {status}"
            ))),
        }
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let url = format!("{}/storage/v1/object/list/{}", self.base, self.bucket);
        let folder = self.full_key(prefix.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "prefix": folder,
                "limit": 1000,
                "sortBy": { "column": "name", "order": "asc" },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Storage(format!(
                "Supabase list {prefix} failed: {}",
                response.status()
            )));
        }

        let listed: Vec<ListedObject> = response.json().await?;
        let dir = prefix.trim_end_matches('/');
        Ok(listed
            .into_iter()
            .map(|object| {
                let key = if dir.is_empty() {
                    object.name.clone()
                } else {
                    format!("{dir}/{}", object.name)
                };
                let last_modified = object
                    .updated_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                RemoteObject { key, last_modified }
            })
            .collect())
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<bool> {
        let url = format!("{}/storage/v1/object/copy", self.base);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "bucketId": self.bucket,
                "sourceKey": self.full_key(source),
                "destinationKey": self.full_key(destination),
            }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}
