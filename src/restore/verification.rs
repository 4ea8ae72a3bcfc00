// dbbackup/src/restore/verification.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::download::download_and_hash;
use crate::backup::artifact::{ArtifactStatus, BackupArtifact};
use crate::errors::BackupError;
use crate::storage::{ObjectStore, RetryPolicy};

/// A payload on local disk whose digest matched its manifest.
#[derive(Debug)]
pub struct VerifiedPayload {
    pub path: PathBuf,
    pub size: u64,
}

/// Only complete artifacts with a recorded payload and digest can be read back.
pub fn ensure_restorable(artifact: &BackupArtifact) -> Result<(&str, &str), BackupError> {
    let not_restorable = || BackupError::NotRestorable {
        name: artifact.name.clone(),
        status: artifact.status.to_string(),
    };
    if artifact.status != ArtifactStatus::Complete {
        return Err(not_restorable());
    }
    match (artifact.payload_key.as_deref(), artifact.sha256.as_deref()) {
        (Some(key), Some(sha256)) => Ok((key, sha256)),
        _ => Err(not_restorable()),
    }
}

/// Downloads the artifact's payload into `dir` and checks its digest.
/// Nothing outside `dir` is touched, whatever the outcome.
pub async fn fetch_verified(
    store: &Arc<dyn ObjectStore>,
    policy: &RetryPolicy,
    artifact: &BackupArtifact,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<VerifiedPayload, BackupError> {
    let (key, expected) = ensure_restorable(artifact)?;
    let file_name = key.rsplit('/').next().unwrap_or(artifact.name.as_str());
    let dest = dir.join(file_name);

    let (actual, size) = download_and_hash(store, policy, key, &dest, cancel).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        error!(artifact = %artifact.name, expected, actual = %actual, "downloaded payload does not match manifest");
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(BackupError::Integrity {
            artifact: artifact.name.clone(),
            expected: expected.to_string(),
            actual,
        });
    }

    info!(artifact = %artifact.name, size_bytes = size, "payload digest verified");
    Ok(VerifiedPayload { path: dest, size })
}
