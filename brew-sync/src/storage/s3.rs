//! S3-compatible object storage client (AWS, Cloudflare R2, MinIO).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsClient;
use chrono::{DateTime, Utc};

use super::{RemoteObject, StorageClient};
use crate::config::S3Config;
use crate::utils::{Result, SyncError};

pub struct S3StorageClient {
    client: AwsClient,
    bucket: String,
    prefix: String,
}

impl S3StorageClient {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "brew-sync",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            // Path-style addressing for S3-compatible stores
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = AwsClient::from_conf(builder.build());

        Ok(S3StorageClient {
            client,
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

    fn relative_key(&self, full: &str) -> String {
        if self.prefix.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(&format!("{}/", self.prefix))
                .unwrap_or(full)
                .to_string()
        }
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn test_connection(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("S3 connection test failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn upload_file(&self, key: &str, content: &str) -> Result<bool> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type("application/json")
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(true)
    }

    async fn download_file(&self, key: &str) -> Result<Option<String>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                return Err(SyncError::Storage(service_error.to_string()));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .into_bytes();
        let content = String::from_utf8(bytes.to_vec())
            .map_err(|e| SyncError::Storage(format!("non-UTF8 object {key}: {e}")))?;
        Ok(Some(content))
    }

    async fn delete_file(&self, key: &str) -> Result<bool> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(true)
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(SyncError::Storage(service_error.to_string()))
                }
            }
        }
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.full_key(prefix));
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SyncError::Storage(e.to_string()))?;

            for object in response.contents() {
                let Some(full) = object.key() else { continue };
                let last_modified = object.last_modified().and_then(|dt| {
                    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
                });
                objects.push(RemoteObject {
                    key: self.relative_key(full),
                    last_modified,
                });
            }

            continuation = response.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<bool> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.full_key(source)))
            .key(self.full_key(destination))
            .send()
            .await
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(prefix: &str) -> S3StorageClient {
        // Key mapping is pure; no network involved
        let credentials = Credentials::new("k", "s", None, None, "test");
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .build();
        S3StorageClient {
            client: AwsClient::from_conf(config),
            bucket: "brew".to_string(),
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn test_key_mapping_with_prefix() {
        let client = client_for("app/data");
        assert_eq!(client.full_key("brew-guide-data.json"), "app/data/brew-guide-data.json");
        assert_eq!(
            client.relative_key("app/data/backups/backup-x.json"),
            "backups/backup-x.json"
        );
    }

    #[test]
    fn test_key_mapping_without_prefix() {
        let client = client_for("");
        assert_eq!(client.full_key("a.json"), "a.json");
        assert_eq!(client.relative_key("a.json"), "a.json");
    }
}
