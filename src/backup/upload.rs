// dbbackup/src/backup/upload.rs
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::archive::PackagedArtifact;
use crate::errors::BackupError;
use crate::storage::retry::{RetryError, retry};
use crate::storage::{ObjectStore, RetryPolicy, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Uploaded,
    /// The final key already held these exact bytes; nothing was written.
    AlreadyPresent,
}

/// Moves packaged artifacts into object storage so that the final key either
/// holds the complete payload or nothing at all.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Uploads to `staging_key`, confirms the stored size and digest, then
    /// promotes to `final_key`. Transient failures are retried per policy.
    pub async fn publish(
        &self,
        payload: &PackagedArtifact,
        staging_key: &str,
        final_key: &str,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, BackupError> {
        let store = &self.store;

        let existing = self
            .retrying(cancel, "head final", || async move { store.head(final_key).await })
            .await?;
        if let Some(meta) = existing {
            if meta.size == payload.size && meta.sha256.as_deref() == Some(payload.sha256.as_str()) {
                info!(key = final_key, "artifact already published with identical content");
                return Ok(PublishOutcome::AlreadyPresent);
            }
            warn!(key = final_key, "final key holds different content, overwriting");
        }

        info!(
            key = staging_key,
            size_bytes = payload.size,
            sha256 = %payload.sha256,
            "uploading artifact to staging"
        );
        let staged = self
            .retrying(cancel, "upload staging", || async move {
                store
                    .put_file(staging_key, &payload.path, Some(&payload.sha256))
                    .await?;
                confirm_staged(&**store, staging_key, payload).await
            })
            .await;
        if let Err(e) = staged {
            self.discard(&[staging_key]).await;
            return Err(e);
        }

        let promoted = self
            .retrying(cancel, "promote", || async move {
                store.copy(staging_key, final_key).await
            })
            .await;
        if let Err(e) = promoted {
            self.discard(&[staging_key, final_key]).await;
            return Err(e);
        }

        self.discard(&[staging_key]).await;
        info!(key = final_key, "artifact published");
        Ok(PublishOutcome::Uploaded)
    }

    /// Best-effort removal of keys left behind by a failed or finished run.
    pub async fn discard(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.store.delete(key).await {
                warn!(key = %key, error = %e, "failed to remove object");
            }
        }
    }

    async fn retrying<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation_name: &str,
        operation: F,
    ) -> Result<T, BackupError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        retry(&self.policy, cancel, operation_name, operation)
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => BackupError::Cancelled(operation_name.to_string()),
                RetryError::Failed { attempts, error } => BackupError::Upload(format!(
                    "{} failed after {} attempt(s): {}",
                    operation_name, attempts, error
                )),
            })
    }
}

/// The store acknowledged the write; make sure what it holds is what we sent.
async fn confirm_staged(
    store: &dyn ObjectStore,
    staging_key: &str,
    payload: &PackagedArtifact,
) -> Result<(), StoreError> {
    let meta = store
        .head(staging_key)
        .await?
        .ok_or_else(|| StoreError::transient(staging_key, "staged object not visible after upload"))?;
    if meta.size != payload.size {
        return Err(StoreError::transient(
            staging_key,
            format!("staged {} bytes, expected {}", meta.size, payload.size),
        ));
    }
    match meta.sha256.as_deref() {
        Some(stored) if stored != payload.sha256 => Err(StoreError::transient(
            staging_key,
            format!("staged digest {} differs from {}", stored, payload.sha256),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::package_dump;
    use crate::config::CompressionConfig;
    use crate::testing::FaultyStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(30),
            jitter: false,
        }
    }

    fn packaged(dir: &TempDir) -> PackagedArtifact {
        let dump = dir.path().join("main.dump");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&dump, content).unwrap();
        package_dump(
            &dump,
            dir.path(),
            CompressionConfig {
                enabled: false,
                level: 0,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_publishes_identical_bytes() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(remote.path().to_path_buf()));
        store.fail_next_put_files(2);
        let payload = packaged(&work);

        let uploader = Uploader::new(store.clone(), policy(3));
        let outcome = uploader
            .publish(&payload, "main/staging/x.dump", "main/artifacts/a.dump", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Uploaded);
        assert_eq!(store.put_file_calls(), 3);
        let published = std::fs::read(remote.path().join("main/artifacts/a.dump")).unwrap();
        assert_eq!(published, std::fs::read(&payload.path).unwrap());
        assert!(store.head("main/staging/x.dump").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_leave_no_final_object() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(remote.path().to_path_buf()));
        store.fail_next_put_files(5);
        let payload = packaged(&work);

        let uploader = Uploader::new(store.clone(), policy(3));
        let err = uploader
            .publish(&payload, "main/staging/x.dump", "main/artifacts/a.dump", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "UploadError");
        assert_eq!(store.put_file_calls(), 3);
        assert!(store.keys_under("main").is_empty());
    }

    #[tokio::test]
    async fn republishing_the_same_artifact_is_a_no_op() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(remote.path().to_path_buf()));
        let payload = packaged(&work);
        let uploader = Uploader::new(store.clone(), policy(3));
        let cancel = CancellationToken::new();

        let first = uploader
            .publish(&payload, "main/staging/x.dump", "main/artifacts/a.dump", &cancel)
            .await
            .unwrap();
        let second = uploader
            .publish(&payload, "main/staging/x.dump", "main/artifacts/a.dump", &cancel)
            .await
            .unwrap();

        assert_eq!(first, PublishOutcome::Uploaded);
        assert_eq!(second, PublishOutcome::AlreadyPresent);
        assert_eq!(store.put_file_calls(), 1);
        assert_eq!(store.keys_under("main"), vec!["main/artifacts/a.dump".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_publish_reports_cancellation() {
        let work = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::new(remote.path().to_path_buf()));
        let payload = packaged(&work);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Uploader::new(store.clone(), policy(3))
            .publish(&payload, "main/staging/x.dump", "main/artifacts/a.dump", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Cancelled");
        assert_eq!(store.put_file_calls(), 0);
    }
}
