//! Engine config persistence + retrying HTTP delivery utilities for listwatch.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use listwatch_core::EngineConfig;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing engine config: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("parsing engine config {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid notifier name {0:?}")]
    InvalidName(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable save of one engine's config.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save(&self, config: &EngineConfig) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per engine, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for the notifier called `name` under `state_dir`.
    pub fn for_notifier(state_dir: impl AsRef<Path>, name: &str) -> Result<Self, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(Self::new(state_dir.as_ref().join(format!("{name}.json"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored config, or `None` if nothing was saved yet.
    pub async fn load(&self) -> Result<Option<EngineConfig>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Deserialize {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn load_or_default(&self) -> Result<EngineConfig, StoreError> {
        Ok(self.load().await?.unwrap_or_default())
    }

    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io(&parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn save(&self, config: &EngineConfig) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(config).map_err(StoreError::Serialize)?;
        self.write_atomically(&bytes).await?;
        debug!(path = %self.path.display(), "saved engine config");
        Ok(())
    }
}

/// Keeps the last saved config in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    state: Mutex<(Option<EngineConfig>, usize)>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_saved(&self) -> Option<EngineConfig> {
        self.state.lock().map(|s| s.0.clone()).unwrap_or(None)
    }

    pub fn save_count(&self) -> usize {
        self.state.lock().map(|s| s.1).unwrap_or(0)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, config: &EngineConfig) -> Result<(), StoreError> {
        if let Ok(mut state) = self.state.lock() {
            state.0 = Some(config.clone());
            state.1 += 1;
        }
        Ok(())
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
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
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PostError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl PostError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            PostError::Client(_) => RetryDisposition::NonRetryable,
            PostError::Request(err) => classify_reqwest_error(err),
            PostError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// JSON poster with bounded exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpPoster {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpPoster {
    pub fn new(config: HttpClientConfig) -> Result<Self, PostError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(PostError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<StatusCode, PostError> {
        let span = info_span!("http_post", url);
        async {
            let mut attempt = 0usize;
            loop {
                let result = self.send_once(url, body).await;
                match result {
                    Ok(status) => return Ok(status),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(attempt, ?delay, error = %err, "retrying post");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<StatusCode, PostError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(PostError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            })
        }
    }
}
