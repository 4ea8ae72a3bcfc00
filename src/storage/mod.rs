// dbbackup/src/storage/mod.rs
pub(crate) mod local;
pub(crate) mod retry;
pub(crate) mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::credentials::StorageCredentials;

pub use local::LocalStore;
pub use retry::RetryPolicy;
pub use s3::S3Store;

/// Failures reported by an object storage backend, already classified so the
/// uploader knows whether backing off can help.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("transient storage failure on {key}: {message}")]
    Transient { key: String, message: String },

    #[error("precondition failed on {0}")]
    PreconditionFailed(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage rejected {key}: {message}")]
    Permanent { key: String, message: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub(crate) fn transient(key: &str, message: impl Into<String>) -> Self {
        StoreError::Transient {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn permanent(key: &str, message: impl Into<String>) -> Self {
        StoreError::Permanent {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Conditional write guard used for leases and manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    None,
    /// Fails with `PreconditionFailed` if the key already exists.
    IfAbsent,
    /// Fails with `PreconditionFailed` unless the stored version matches.
    IfMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the content, when the backend knows it.
    pub sha256: Option<String>,
    /// Opaque version token (ETag for S3) usable with `Precondition::IfMatch`.
    pub version: Option<String>,
}

/// Remote object storage as seen by the uploader, the retention manager and
/// the lease. Every call is individually atomic and safe to repeat.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams a local file to `key`. When `sha256_hex` is given the backend
    /// must reject the write if the received bytes hash differently.
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        sha256_hex: Option<&str>,
    ) -> Result<ObjectMeta, StoreError>;

    /// Writes a small object with an optional atomic check-and-set guard.
    /// Returns the new version token.
    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, StoreError>;

    /// Downloads `key` into `dest`, returning the byte count.
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64, StoreError>;

    /// Reads a small object together with its version token.
    async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, String), StoreError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;

    /// Server-side copy; the destination appears atomically.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Creates the bucket or root directory if it is missing.
    async fn ensure_container(&self) -> Result<(), StoreError>;
}

/// Builds the configured backend. Credentials are only held by the returned
/// store, which lives for a single command.
pub async fn connect(
    config: &StorageConfig,
    credentials: Option<StorageCredentials>,
) -> Result<Arc<dyn ObjectStore>, StoreError> {
    match config {
        StorageConfig::S3(s3_config) => {
            let store = S3Store::connect(s3_config, credentials).await;
            Ok(Arc::new(store))
        }
        StorageConfig::Local { root } => Ok(Arc::new(LocalStore::new(root.clone()))),
    }
}

/// Joins key segments with `/`, ignoring empty ones.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_skips_empty_segments() {
        assert_eq!(join_key(&["", "main", "lock.json"]), "main/lock.json");
        assert_eq!(join_key(&["backups/", "/main", "manifests"]), "backups/main/manifests");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::transient("k", "timeout").is_transient());
        assert!(!StoreError::permanent("k", "403").is_transient());
        assert!(!StoreError::PreconditionFailed("k".into()).is_transient());
        assert!(!StoreError::NotFound("k".into()).is_transient());
    }
}
