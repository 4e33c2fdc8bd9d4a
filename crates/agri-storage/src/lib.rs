//! Upstream HTTP client + content-addressed archive for raw API responses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agri_core::Dataset;
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agri-storage";

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Keeps every successful upstream body on disk, addressed by its sha256.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
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

    pub fn relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        dataset: Dataset,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(dataset.as_str())
            .join(format!("{content_hash}.json"))
    }

    /// Writes `bytes` through a temp file + rename; an existing file with the same hash is reused.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        dataset: Dataset,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(fetched_at, dataset, &content_hash);
        let target = self.root.join(&relative_path);
        let dir = match target.parent() {
            Some(dir) => dir.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let already_present = fs::try_exists(&target)
            .await
            .with_context(|| format!("probing {}", target.display()))?;
        let deduplicated = already_present || write_atomically(&dir, &target, bytes).await?;

        Ok(ArchivedResponse {
            content_hash,
            relative_path,
            absolute_path: target,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Returns `true` when another writer won the rename race.
async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let staging = dir.join(format!(".partial-{}", Uuid::new_v4().simple()));
    let mut out = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .await
        .with_context(|| format!("creating {}", staging.display()))?;
    out.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    out.sync_all()
        .await
        .with_context(|| format!("syncing {}", staging.display()))?;
    drop(out);

    let renamed = fs::rename(&staging, target).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    match renamed {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(true),
        Err(err) => Err(err).with_context(|| format!("publishing archive {}", target.display())),
    }
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

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
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Timed GET client shared by every upstream source.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GETs `url` with `query`, retrying retryable failures per the backoff policy.
    ///
    /// Only a 200 response counts as success; anything else is returned as
    /// [`FetchError::HttpStatus`] once retries are exhausted.
    pub async fn fetch(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let (error, disposition) = match self.client.get(url).query(query).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    let final_url = resp.url().to_string();
                    return Ok(FetchedResponse {
                        status: StatusCode::OK,
                        final_url,
                        body: resp.bytes().await?.to_vec(),
                    });
                }
                Ok(resp) => {
                    let disposition = classify_status(resp.status());
                    let error = FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    };
                    (error, disposition)
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    (FetchError::Request(err), disposition)
                }
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(error);
            }
            let pause = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?pause, error = %error, "upstream request failed; retrying");
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }
}
