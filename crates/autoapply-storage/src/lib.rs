//! Durable state for the application engine: fingerprint store, cycle statistics,
//! content-addressed outbox packets, and the outbound HTTP client.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod fingerprint;
pub mod http;
pub mod stats;

pub use fingerprint::{FingerprintStore, LoadSummary};
pub use http::{
    classify_reqwest_error, classify_status, classify_status_code, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RateLimiter, RetryDisposition,
};
pub use stats::{FinalReport, StatsSnapshot, StatsStore, TotalsFile};

pub const CRATE_NAME: &str = "autoapply-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("fingerprint scheme mismatch: store uses {found}, engine uses {expected}")]
    SchemeMismatch { found: String, expected: String },
    #[error("blocking store task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers and
/// crash recovery only ever observe the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = async {
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
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StoreError::io(path, e))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[derive(Debug, Clone)]
pub struct StoredPacket {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Hash-addressed directory of application packets.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    root: PathBuf,
}

impl OutboxStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packet_relative_path(
        written_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(written_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_packet(
        &self,
        written_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> Result<StoredPacket, StoreError> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::packet_relative_path(written_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .map_err(|e| StoreError::io(&absolute_path, e))?;
        if !exists {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredPacket {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated: exists,
        })
    }
}
