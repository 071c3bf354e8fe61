//! WebDAV storage client.
//!
//! Plain HTTP verbs against a DAV collection: PUT/GET/DELETE for blobs,
//! PROPFIND Depth:1 for listing, server-side COPY with a `Destination`
//! header for backups. Collection creation (MKCOL) is best-effort — many
//! servers answer 405 for a collection that already exists.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode, Url};

use super::{RemoteObject, StorageClient};
use crate::config::WebdavConfig;
use crate::utils::{Result, SyncError};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:getlastmodified/></d:prop>
</d:propfind>"#;

pub struct WebdavClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
    root_ensured: AtomicBool,
}

impl WebdavClient {
    pub fn new(config: &WebdavConfig) -> Result<Self> {
        let joined = format!(
            "{}/{}/",
            config.url.trim_end_matches('/'),
            config.root.trim_matches('/')
        );
        let base = Url::parse(&joined)
            .map_err(|e| SyncError::Config(format!("invalid WebDAV URL {joined}: {e}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(SyncError::Http)?;
        Ok(WebdavClient {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            root_ensured: AtomicBool::new(false),
        })
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        self.base
            .join(key)
            .map_err(|e| SyncError::Config(format!("invalid object key {key}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn dav_method(name: &str) -> Result<Method> {
        Method::from_bytes(name.as_bytes())
            .map_err(|e| SyncError::Network(format!("unsupported method {name}: {e}")))
    }

    async fn mkcol(&self, url: Url) {
        let Ok(method) = Self::dav_method("MKCOL") else {
            return;
        };
        match self.request(method, url.clone()).send().await {
            Ok(response) => {
                tracing::debug!("MKCOL {} -> {}", url, response.status());
            }
            Err(e) => {
                tracing::debug!("MKCOL {} failed: {}", url, e);
            }
        }
    }

    /// Create the root collection and any intermediate collections for
    /// `key`. Best-effort; existing collections commonly yield 405.
    async fn ensure_collections(&self, key: &str) -> Result<()> {
        if !self.root_ensured.swap(true, Ordering::SeqCst) {
            self.mkcol(self.base.clone()).await;
        }
        let segments: Vec<&str> = key.split('/').collect();
        let mut path = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            path.push_str(segment);
            path.push('/');
            self.mkcol(self.url_for(&path)?).await;
        }
        Ok(())
    }

    /// Path of the base collection on the server, used to relativize hrefs
    fn base_path(&self) -> &str {
        self.base.path()
    }
}

#[async_trait]
impl StorageClient for WebdavClient {
    async fn test_connection(&self) -> Result<bool> {
        let method = Self::dav_method("PROPFIND")?;
        let response = self
            .request(method, self.base.clone())
            .header("Depth", "0")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() || status == StatusCode::MULTI_STATUS => Ok(true),
            StatusCode::NOT_FOUND => {
                // Root collection missing: create it and call that a pass
                self.mkcol(self.base.clone()).await;
                self.root_ensured.store(true, Ordering::SeqCst);
                Ok(true)
            }
            status => {
                tracing::warn!("WebDAV connection test failed: {}", status);
                Ok(false)
            }
        }
    }

    async fn upload_file(&self, key: &str, content: &str) -> Result<bool> {
        self.ensure_collections(key).await?;
        let response = self
            .request(Method::PUT, self.url_for(key)?)
            .header("Content-Type", "application/json")
            .body(content.to_string())
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn download_file(&self, key: &str) -> Result<Option<String>> {
        let response = self.request(Method::GET, self.url_for(key)?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(SyncError::Storage(format!(
                "WebDAV GET {key} failed: {status}"
            ))),
        }
    }

    async fn delete_file(&self, key: &str) -> Result<bool> {
        let response = self
            .request(Method::DELETE, self.url_for(key)?)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SyncError::Storage(format!(
                "WebDAV DELETE {key} failed: {status}"
            ))),
        }
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let response = self.request(Method::HEAD, self.url_for(key)?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SyncError::Storage(format!(
                "WebDAV HEAD {key} failed: {status}"
            ))),
        }
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let method = Self::dav_method("PROPFIND")?;
        let response = self
            .request(method, self.url_for(prefix)?)
            .header("Depth", "1")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() || status == StatusCode::MULTI_STATUS => {
                let xml = response.text().await?;
                Ok(parse_multistatus(&xml, self.base_path()))
            }
            status => Err(SyncError::Storage(format!(
                "WebDAV PROPFIND {prefix} failed: {status}"
            ))),
        }
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<bool> {
        self.ensure_collections(destination).await?;
        let method = Self::dav_method("COPY")?;
        let destination_url = self.url_for(destination)?;
        let response = self
            .request(method, self.url_for(source)?)
            .header("Destination", destination_url.as_str())
            .header("Overwrite", "T")
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

/// Extract `(key, lastModified)` pairs from a PROPFIND multistatus
/// response. Collections (hrefs ending in `/`) are skipped; hrefs are
/// relativized against the base collection path.
fn parse_multistatus(xml: &str, base_path: &str) -> Vec<RemoteObject> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut objects = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut href: Option<String> = None;
    let mut last_modified: Option<DateTime<Utc>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = local_name(e.name().as_ref());
                if local == "response" {
                    href = None;
                    last_modified = None;
                }
                current_tag = Some(local);
            }
            Ok(Event::Text(t)) => {
                let Some(tag) = current_tag.as_deref() else {
                    continue;
                };
                let Ok(text) = t.unescape() else { continue };
                match tag {
                    "href" => href = Some(text.into_owned()),
                    "getlastmodified" => {
                        last_modified = DateTime::parse_from_rfc2822(text.as_ref())
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc));
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if local_name(e.name().as_ref()) == "response" {
                    if let Some(path) = href.take() {
                        if !path.ends_with('/') {
                            let key = path
                                .strip_prefix(base_path)
                                .unwrap_or(&path)
                                .trim_start_matches('/')
                                .to_string();
                            objects.push(RemoteObject {
                                key,
                                last_modified: last_modified.take(),
                            });
                        }
                    }
                }
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!("Unparseable multistatus response: {}", e);
                break;
            }
            _ => {}
        }
    }

    objects
}

fn local_name(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/brew-guide/backups/</d:href>
    <d:propstat><d:prop><d:getlastmodified>Tue, 25 Aug 2026 08:00:00 GMT</d:getlastmodified></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/brew-guide/backups/backup-2026-08-25T08-00-00-000Z.json</d:href>
    <d:propstat><d:prop><d:getlastmodified>Tue, 25 Aug 2026 08:00:01 GMT</d:getlastmodified></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/brew-guide/backups/backup-2026-08-26T08-00-00-000Z.json</d:href>
    <d:propstat><d:prop></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus_skips_collections() {
        let objects = parse_multistatus(SAMPLE, "/dav/brew-guide/");
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "backups/backup-2026-08-25T08-00-00-000Z.json");
        assert!(objects[0].last_modified.is_some());
        assert!(objects[1].last_modified.is_none());
    }

    #[test]
    fn test_parse_multistatus_garbage() {
        assert!(parse_multistatus("not xml at all", "/").is_empty());
    }

    #[test]
    fn test_base_url_joining() {
        let client = WebdavClient::new(&WebdavConfig {
            url: "https://dav.example.com/".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            root: "/brew-guide/".to_string(),
            verified: false,
        })
        .unwrap();
        assert_eq!(client.base.as_str(), "https://dav.example.com/brew-guide/");
        assert_eq!(
            client.url_for("backups/backup-x.json").unwrap().as_str(),
            "https://dav.example.com/brew-guide/backups/backup-x.json"
        );
    }
}
