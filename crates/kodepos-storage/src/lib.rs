//! Page staging store + HTTP fetch utilities for the kodepos harvester.
//!
//! The harvest stage writes every fetched page's extracted rows to durable
//! staging keyed by `(entity kind, page index, optional parent)`, so the
//! build stage can re-run without touching the network. Writes are atomic
//! (temp file + rename) and each completed scope gets a manifest recording
//! content hashes of its pages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kodepos_core::EntityKind;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kodepos-storage";

/// Address of one staged page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub kind: EntityKind,
    pub page: usize,
    /// Parent province name, for regency pages only.
    pub parent: Option<String>,
}

impl PageKey {
    pub fn new(kind: EntityKind, page: usize) -> Self {
        Self {
            kind,
            page,
            parent: None,
        }
    }

    pub fn with_parent(kind: EntityKind, page: usize, parent: impl Into<String>) -> Self {
        Self {
            kind,
            page,
            parent: Some(parent.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staged page missing: {path}")]
    Missing { path: PathBuf },
    #[error("reading staged page {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing staging file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding staging manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Receipt for one staged page write.
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub page: usize,
    pub relative_path: PathBuf,
    pub content_hash: String,
    pub row_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StagingManifest {
    pub kind: EntityKind,
    pub parent: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub pages: Vec<ManifestPage>,
}

#[derive(Debug, Serialize)]
pub struct ManifestPage {
    pub page: usize,
    pub sha256: String,
    pub rows: usize,
}

/// Filesystem-backed staging store rooted at one directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn scope_dir(&self, kind: EntityKind, parent: Option<&str>) -> PathBuf {
        let mut dir = self.root.join(kind.dir_name());
        if let Some(parent) = parent {
            dir = dir.join(slugify(parent));
        }
        dir
    }

    pub fn page_path(&self, key: &PageKey) -> PathBuf {
        self.scope_dir(key.kind, key.parent.as_deref())
            .join(format!("page_{:04}.txt", key.page))
    }

    /// Write one page's rows atomically via a temp file + rename.
    ///
    /// Concurrent writers are safe as long as their keys differ, which the
    /// batch scheduler guarantees by construction.
    pub async fn write_page(
        &self,
        key: &PageKey,
        rows: &[String],
    ) -> Result<StoredPage, StagingError> {
        let path = self.page_path(key);
        let parent = path.parent().expect("page path always has a parent dir");
        fs::create_dir_all(parent).await.map_err(|source| StagingError::Write {
            path: parent.to_path_buf(),
            source,
        })?;

        let mut body = rows.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        let bytes = body.into_bytes();
        let content_hash = Self::sha256_hex(&bytes);

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write = |source| StagingError::Write {
            path: temp_path.clone(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write)?;
        file.write_all(&bytes).await.map_err(write)?;
        file.flush().await.map_err(write)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StagingError::Write { path, source });
        }

        let relative_path = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
        Ok(StoredPage {
            page: key.page,
            relative_path,
            content_hash,
            row_count: rows.len(),
        })
    }

    /// Read one staged page back as rows, exactly as written.
    pub async fn read_page(&self, key: &PageKey) -> Result<Vec<String>, StagingError> {
        let path = self.page_path(key);
        let body = match fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(StagingError::Missing { path });
            }
            Err(source) => return Err(StagingError::Read { path, source }),
        };
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let mut rows: Vec<String> = body.split('\n').map(str::to_string).collect();
        // Drop the single empty fragment produced by the trailing newline.
        if rows.last().is_some_and(String::is_empty) {
            rows.pop();
        }
        Ok(rows)
    }

    /// Read every page of one scope in index order.
    pub async fn read_pages(
        &self,
        kind: EntityKind,
        parent: Option<&str>,
        page_count: usize,
    ) -> Result<Vec<Vec<String>>, StagingError> {
        let mut pages = Vec::with_capacity(page_count);
        for page in 0..page_count {
            let key = PageKey {
                kind,
                page,
                parent: parent.map(str::to_string),
            };
            pages.push(self.read_page(&key).await?);
        }
        Ok(pages)
    }

    /// Record hashes and row counts for a completed scope harvest.
    pub async fn write_manifest(
        &self,
        kind: EntityKind,
        parent: Option<&str>,
        pages: &[StoredPage],
    ) -> Result<PathBuf, StagingError> {
        let manifest = StagingManifest {
            kind,
            parent: parent.map(str::to_string),
            generated_at: Utc::now(),
            pages: pages
                .iter()
                .map(|p| ManifestPage {
                    page: p.page,
                    sha256: p.content_hash.clone(),
                    rows: p.row_count,
                })
                .collect(),
        };
        let path = self.scope_dir(kind, parent).join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, bytes)
            .await
            .map_err(|source| StagingError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Directory-safe form of a province name used in staging paths.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff for transient fetch failures.
///
/// Only transport-level faults are retried; every other fault kind in the
/// pipeline is structural and aborts the run on first occurrence.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper with retry classification and backoff.
///
/// Concurrency bounding is not this type's job; the batch scheduler owns
/// how many fetches are in flight.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: reqwest::Url) -> Result<String, FetchError> {
        let span = info_span!("fetch_page", url = %url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop always captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rows(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn page_round_trip_preserves_rows_and_order() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());
        let key = PageKey::new(EntityKind::Province, 0);

        let written = rows(&["21", "Jawa Barat", "", " Jakarta", "17"]);
        let stored = store.write_page(&key, &written).await.expect("write");
        assert_eq!(stored.page, 0);
        assert_eq!(stored.row_count, 5);

        let read = store.read_page(&key).await.expect("read");
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn missing_page_is_a_typed_fault() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());
        let key = PageKey::new(EntityKind::Village, 7);

        let err = store.read_page(&key).await.expect_err("page absent");
        assert!(matches!(err, StagingError::Missing { .. }));
    }

    #[tokio::test]
    async fn regency_pages_are_keyed_under_their_parent_province() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        let a = PageKey::with_parent(EntityKind::Regency, 0, "Jawa Barat");
        let b = PageKey::with_parent(EntityKind::Regency, 0, "Jawa Timur");
        store.write_page(&a, &rows(&["x"])).await.expect("write a");
        store.write_page(&b, &rows(&["y"])).await.expect("write b");

        assert_eq!(store.read_page(&a).await.expect("read a"), rows(&["x"]));
        assert_eq!(store.read_page(&b).await.expect("read b"), rows(&["y"]));
        assert_ne!(store.page_path(&a), store.page_path(&b));
    }

    #[tokio::test]
    async fn read_pages_returns_index_order() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());

        for page in [2usize, 0, 1] {
            let key = PageKey::new(EntityKind::Village, page);
            store
                .write_page(&key, &rows(&[&format!("row-{page}")]))
                .await
                .expect("write");
        }

        let pages = store
            .read_pages(EntityKind::Village, None, 3)
            .await
            .expect("read all");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], rows(&["row-0"]));
        assert_eq!(pages[2], rows(&["row-2"]));
    }

    #[tokio::test]
    async fn manifest_records_stable_hashes() {
        let dir = tempdir().expect("tempdir");
        let store = PageStore::new(dir.path());
        let key = PageKey::new(EntityKind::Province, 0);

        let first = store.write_page(&key, &rows(&["a", "b"])).await.expect("write");
        let second = store.write_page(&key, &rows(&["a", "b"])).await.expect("rewrite");
        assert_eq!(first.content_hash, second.content_hash);

        let manifest_path = store
            .write_manifest(EntityKind::Province, None, &[second])
            .await
            .expect("manifest");
        let text = std::fs::read_to_string(manifest_path).expect("read manifest");
        assert!(text.contains("\"province\""));
        assert!(text.contains(&first.content_hash));
    }

    #[test]
    fn slugify_flattens_province_names() {
        assert_eq!(slugify("Jawa Barat"), "jawa-barat");
        assert_eq!(slugify("  D.I. Yogyakarta "), "d-i-yogyakarta");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
