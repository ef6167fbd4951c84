//! Publishing rendered tracks and fetching remote assets.
//!
//! [`HttpBlobStorage`] talks to a Supabase-style object store with one
//! bucket per [`StorageLocation`]. [`LocalBlobStorage`] writes into a
//! directory and backs the `render` subcommand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::job::StorageLocation;
use crate::tts::{RetryPolicy, retry};

/// Where an uploaded object ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedObject {
    pub url: String,
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        location: StorageLocation,
        content_type: &str,
    ) -> Result<UploadedObject, StorageError>;
}

/// Bucket names for each storage location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buckets {
    #[serde(default = "default_public_bucket")]
    pub public: String,
    #[serde(default = "default_private_bucket")]
    pub private: String,
}

fn default_public_bucket() -> String {
    "audio-public".to_string()
}

fn default_private_bucket() -> String {
    "audio-private".to_string()
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            public: default_public_bucket(),
            private: default_private_bucket(),
        }
    }
}

impl Buckets {
    fn for_location(&self, location: StorageLocation) -> &str {
        match location {
            StorageLocation::Public => &self.public,
            StorageLocation::Private => &self.private,
        }
    }
}

pub struct HttpBlobStorage {
    client: Client,
    base_url: String,
    api_key: String,
    buckets: Buckets,
    retry: RetryPolicy,
}

impl HttpBlobStorage {
    pub fn new(base_url: String, api_key: String, buckets: Buckets) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            buckets,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn object_url(&self, bucket: &str, key: &str, location: StorageLocation) -> String {
        match location {
            StorageLocation::Public => {
                format!("{}/storage/v1/object/public/{bucket}/{key}", self.base_url)
            }
            StorageLocation::Private => {
                format!("{}/storage/v1/object/authenticated/{bucket}/{key}", self.base_url)
            }
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .post(format!("{}/storage/v1/object/{bucket}/{key}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("content-type", content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        location: StorageLocation,
        content_type: &str,
    ) -> Result<UploadedObject, StorageError> {
        let body = tokio::fs::read(local).await?;
        let size = body.len() as u64;
        let bucket = self.buckets.for_location(location);

        retry(
            &self.retry,
            "upload",
            StorageError::is_transient,
            |_: &StorageError| None,
            || self.put(bucket, key, body.clone(), content_type),
        )
        .await?;

        debug!(bucket, key, size, "uploaded");
        Ok(UploadedObject {
            url: self.object_url(bucket, key, location),
            key: key.to_string(),
            size,
        })
    }
}

/// Stores objects under `{root}/{public|private}/{key}`.
pub struct LocalBlobStorage {
    root: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        location: StorageLocation,
        _content_type: &str,
    ) -> Result<UploadedObject, StorageError> {
        let sub = match location {
            StorageLocation::Public => "public",
            StorageLocation::Private => "private",
        };
        let dest = self.root.join(sub).join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = tokio::fs::copy(local, &dest).await?;
        Ok(UploadedObject {
            url: format!("file://{}", dest.display()),
            key: key.to_string(),
            size,
        })
    }
}

/// Whether `url` is fetched over the network rather than read from disk.
pub fn is_remote_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Stream `url` into `dest`. `file://` URLs and bare paths are copied;
/// callers decide whether local sources are acceptable.
pub async fn download_to(client: &Client, url: &str, dest: &Path) -> Result<u64, StorageError> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(tokio::fs::copy(path, dest).await?);
    }
    if !is_remote_url(url) {
        return Ok(tokio::fs::copy(url, dest).await?);
    }

    let mut response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(StorageError::Rejected {
            status: status.as_u16(),
            message: format!("GET {url}"),
        });
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_ms: 0,
        }
    }

    fn track(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, b"ID3 fake mp3").unwrap();
        path
    }

    #[tokio::test]
    async fn upload_posts_to_private_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/audio-private/owner-1/job-1.mp3"))
            .and(header("content-type", "audio/mpeg"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Key": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let storage = HttpBlobStorage::new(server.uri(), "service-key".into(), Buckets::default());
        let obj = storage
            .upload(&track(&dir), "owner-1/job-1.mp3", StorageLocation::Private, "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(obj.size, 12);
        assert_eq!(obj.key, "owner-1/job-1.mp3");
        assert!(obj.url.ends_with("/storage/v1/object/authenticated/audio-private/owner-1/job-1.mp3"));
    }

    #[tokio::test]
    async fn public_upload_returns_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/audio-public/a.mp3"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let storage = HttpBlobStorage::new(server.uri(), "k".into(), Buckets::default());
        let obj = storage
            .upload(&track(&dir), "a.mp3", StorageLocation::Public, "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(
            obj.url,
            format!("{}/storage/v1/object/public/audio-public/a.mp3", server.uri())
        );
    }

    #[tokio::test]
    async fn transient_upload_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let storage = HttpBlobStorage::new(server.uri(), "k".into(), Buckets::default())
            .with_retry(fast_retry());
        assert!(
            storage
                .upload(&track(&dir), "a.mp3", StorageLocation::Private, "audio/mpeg")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn forbidden_upload_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let storage = HttpBlobStorage::new(server.uri(), "k".into(), Buckets::default())
            .with_retry(fast_retry());
        let err = storage
            .upload(&track(&dir), "a.mp3", StorageLocation::Private, "audio/mpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn local_storage_copies_into_location_dir() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let storage = LocalBlobStorage::new(out.path());
        let obj = storage
            .upload(&track(&dir), "me/job.mp3", StorageLocation::Public, "audio/mpeg")
            .await
            .unwrap();
        let dest = out.path().join("public/me/job.mp3");
        assert_eq!(std::fs::read(&dest).unwrap(), b"ID3 fake mp3");
        assert_eq!(obj.size, 12);
    }

    #[tokio::test]
    async fn download_streams_body_to_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bg.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("bg.mp3");
        let n = download_to(&Client::new(), &format!("{}/bg.mp3", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(n, 4096);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
    }

    #[test]
    fn only_http_urls_are_remote() {
        assert!(is_remote_url("https://cdn.example.com/ocean.mp3"));
        assert!(is_remote_url("http://10.0.0.2/rain.mp3"));
        assert!(!is_remote_url("file:///etc/hostname"));
        assert!(!is_remote_url("/etc/hostname"));
        assert!(!is_remote_url("ftp://example.com/a.mp3"));
    }

    #[tokio::test]
    async fn download_missing_asset_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let err = download_to(
            &Client::new(),
            &format!("{}/missing.mp3", server.uri()),
            &dir.path().join("x"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Rejected { status: 404, .. }));
    }
}
