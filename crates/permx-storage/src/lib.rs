//! Snapshot storage + shared HTTP fetch utilities for permx.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "permx-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub record_count: usize,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {} does not exist", path.display())]
    Missing { path: PathBuf },
    #[error("snapshot {} is not a JSON array: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Flat-file cache of raw provider records, one JSON array per file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Loads a snapshot. An absent file is `Missing`; an empty array is `Ok(vec![])`.
    pub async fn load(&self, file_name: &str) -> Result<Vec<JsonValue>, SnapshotError> {
        let path = self.path_for(file_name);
        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?;
        if !exists {
            return Err(SnapshotError::Missing { path });
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<JsonValue>(&bytes) {
            Ok(JsonValue::Array(records)) => Ok(records),
            Ok(other) => Err(SnapshotError::Malformed {
                path,
                reason: format!("top-level value is {}", json_kind(&other)),
            }),
            Err(err) => Err(SnapshotError::Malformed {
                path,
                reason: err.to_string(),
            }),
        }
    }

    /// Writes a snapshot through a temp file and an atomic rename.
    pub async fn store(&self, file_name: &str, records: &[JsonValue]) -> anyhow::Result<StoredSnapshot> {
        let path = self.path_for(file_name);
        let bytes = serde_json::to_vec_pretty(records).context("serializing snapshot records")?;
        let content_hash = Self::sha256_hex(&bytes);

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            content_hash,
            path,
            byte_size: bytes.len(),
            record_count: records.len(),
        })
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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

/// Per-operation timeout and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RequestProfile {
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl RequestProfile {
    /// Upstream provider queries: heavy, retried with a 2s base backoff.
    pub fn provider() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy {
                max_retries: 4,
                base_delay: Duration::from_millis(2000),
                max_delay: Duration::from_secs(16),
            },
        }
    }

    /// Permit-detail sub-resources: light and numerous.
    pub fn sub_resource() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(1),
            },
        }
    }

    pub fn page() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(70),
            user_agent: None,
            pool_max_idle_per_host: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unusable payload from {url}: {reason}")]
    Payload { url: String, reason: String },
}

/// Keep-alive HTTP client shared by every concurrent task of a process.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET with retries. `Ok(None)` means the resource does not exist (HTTP 404).
    pub async fn fetch_text(&self, url: &str, profile: &RequestProfile) -> Result<Option<String>, FetchError> {
        self.fetch_decoded(url, &[], profile, |body| Ok(String::from_utf8_lossy(body).into_owned()))
            .await
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        profile: &RequestProfile,
    ) -> Result<Option<JsonValue>, FetchError> {
        self.fetch_json_checked(url, query, profile, |_| Ok(())).await
    }

    /// Like `fetch_json`, but a body rejected by `check` is retried as a
    /// transient failure (ArcGIS reports errors inside 200 responses).
    pub async fn fetch_json_checked<F>(
        &self,
        url: &str,
        query: &[(&str, String)],
        profile: &RequestProfile,
        check: F,
    ) -> Result<Option<JsonValue>, FetchError>
    where
        F: Fn(&JsonValue) -> Result<(), String>,
    {
        self.fetch_decoded(url, query, profile, |body| {
            let value: JsonValue =
                serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;
            check(&value)?;
            Ok(value)
        })
        .await
    }

    async fn fetch_decoded<T, D>(
        &self,
        url: &str,
        query: &[(&str, String)],
        profile: &RequestProfile,
        decode: D,
    ) -> Result<Option<T>, FetchError>
    where
        D: Fn(&[u8]) -> Result<T, String>,
    {
        let span = info_span!("http_fetch", url);
        async {
            let backoff = profile.backoff;
            let mut attempt = 0usize;
            loop {
                let last_attempt = attempt >= backoff.max_retries;
                let failure = match self
                    .client
                    .get(url)
                    .query(query)
                    .timeout(profile.timeout)
                    .send()
                    .await
                {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status == StatusCode::NOT_FOUND {
                            debug!(%final_url, "resource not found");
                            return Ok(None);
                        }
                        if status.is_success() {
                            let body = match resp.bytes().await {
                                Ok(bytes) => bytes.to_vec(),
                                Err(err) if !last_attempt && classify_reqwest_error(&err) == RetryDisposition::Retryable => {
                                    warn!(attempt, error = %err, "body read failed; retrying");
                                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                                    attempt += 1;
                                    continue;
                                }
                                Err(err) => return Err(FetchError::Request(err)),
                            };
                            match decode(&body[..]) {
                                Ok(value) => return Ok(Some(value)),
                                Err(reason) => (
                                    RetryDisposition::Retryable,
                                    FetchError::Payload { url: final_url, reason },
                                ),
                            }
                        } else {
                            (
                                classify_status(status),
                                FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: final_url,
                                },
                            )
                        }
                    }
                    Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
                };

                let (disposition, error) = failure;
                if disposition == RetryDisposition::NonRetryable || last_attempt {
                    return Err(error);
                }
                let delay = backoff.delay_for_attempt(attempt);
                warn!(attempt, ?delay, %error, "fetch failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}
