// dbbackup/src/restore/download.rs
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::BackupError;
use crate::storage::retry::{RetryError, retry};
use crate::storage::{ObjectStore, RetryPolicy};
use crate::utils::checksum::sha256_file;

/// Downloads `key` to `dest`, retrying transient failures, and returns the
/// hex SHA-256 and size of what landed on disk.
pub async fn download_and_hash(
    store: &Arc<dyn ObjectStore>,
    policy: &RetryPolicy,
    key: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(String, u64), BackupError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    info!(key, dest = %dest.display(), "downloading artifact");

    retry(policy, cancel, "download", || async move {
        store.get_to_file(key, dest).await
    })
    .await
    .map_err(|e| match e {
        RetryError::Cancelled => BackupError::Cancelled("download".to_string()),
        RetryError::Failed { error, .. } => BackupError::Storage(error),
    })?;

    let (digest, size) = sha256_file(dest).await?;
    info!(key, size_bytes = size, sha256 = %digest, "download finished");
    Ok((digest, size))
}
