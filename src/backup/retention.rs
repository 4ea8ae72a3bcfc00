// dbbackup/src/backup/retention.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::artifact::{ArtifactIndex, ArtifactStatus, BackupArtifact};
use crate::errors::BackupError;
use crate::storage::ObjectStore;

/// Failed and deleted artifacts stay listed for this many days.
const RECORD_HORIZON_DAYS: i64 = 30;

/// How many complete artifacts to keep, and for how long.
///
/// An artifact is pruned when it violates either limit, except that the newest
/// complete artifact is always kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<chrono::Duration>,
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }

    /// `complete` must hold only complete artifacts, newest first.
    pub fn select_for_deletion<'a>(
        &self,
        complete: &'a [BackupArtifact],
        now: DateTime<Utc>,
    ) -> Vec<&'a BackupArtifact> {
        complete
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(position, artifact)| {
                let over_count = self.max_count.is_some_and(|max| *position >= max);
                let too_old = self
                    .max_age
                    .is_some_and(|max_age| now - artifact.created_at > max_age);
                over_count || too_old
            })
            .map(|(_, artifact)| artifact)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    /// One `BackupError::Prune` per artifact that could not be removed.
    pub errors: Vec<BackupError>,
}

pub struct RetentionManager {
    store: Arc<dyn ObjectStore>,
    index: ArtifactIndex,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn ObjectStore>, index: ArtifactIndex) -> Self {
        Self { store, index }
    }

    /// Deletes every artifact the policy selects. Failures are collected per
    /// artifact and never stop the remaining deletions.
    pub async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> PruneReport {
        let mut report = PruneReport::default();

        let all = match self.index.list().await {
            Ok(all) => all,
            Err(e) => {
                report.errors.push(BackupError::Prune {
                    artifact: "*".to_string(),
                    reason: format!("cannot list artifacts: {}", e),
                });
                return report;
            }
        };

        // Tombstones whose payload delete failed last time.
        for artifact in all
            .iter()
            .filter(|a| a.status == ArtifactStatus::Deleted && a.payload_key.is_some())
        {
            if let Err(e) = self.remove_payload(artifact.clone()).await {
                report.errors.push(e);
            }
        }

        for artifact in all.iter().filter(|a| record_expired(a, now)) {
            match self.forget(artifact).await {
                Ok(()) => info!(artifact = %artifact.name, status = %artifact.status, "dropped old manifest"),
                Err(e) => report.errors.push(e),
            }
        }

        if policy.is_unbounded() {
            return report;
        }

        let complete: Vec<BackupArtifact> = all
            .into_iter()
            .filter(|a| a.status == ArtifactStatus::Complete)
            .collect();

        for artifact in policy.select_for_deletion(&complete, now) {
            match self.delete_artifact(artifact, now).await {
                Ok(()) => {
                    info!(artifact = %artifact.name, created_at = %artifact.created_at, "pruned artifact");
                    report.deleted.push(artifact.name.clone());
                }
                Err(e) => {
                    warn!(artifact = %artifact.name, error = %e, "failed to prune artifact");
                    report.errors.push(e);
                }
            }
        }
        report
    }

    /// Tombstones the manifest first so no reader can resolve the artifact
    /// once its payload starts disappearing.
    async fn delete_artifact(&self, artifact: &BackupArtifact, now: DateTime<Utc>) -> Result<(), BackupError> {
        let mut tombstone = artifact.clone();
        tombstone.status = ArtifactStatus::Deleted;
        tombstone.deleted_at = Some(now);
        self.index
            .save(&tombstone)
            .await
            .map_err(|e| prune_error(&artifact.name, e))?;
        self.remove_payload(tombstone).await
    }

    /// Removes any bytes a failed run may have left, then the manifest itself.
    async fn forget(&self, artifact: &BackupArtifact) -> Result<(), BackupError> {
        for key in [artifact.staging_key.as_deref(), artifact.payload_key.as_deref()]
            .into_iter()
            .flatten()
        {
            self.store
                .delete(key)
                .await
                .map_err(|e| prune_error(&artifact.name, e.into()))?;
        }
        self.index
            .remove(&artifact.name)
            .await
            .map_err(|e| prune_error(&artifact.name, e))
    }

    async fn remove_payload(&self, mut tombstone: BackupArtifact) -> Result<(), BackupError> {
        if let Some(key) = tombstone.payload_key.take() {
            self.store
                .delete(&key)
                .await
                .map_err(|e| prune_error(&tombstone.name, e.into()))?;
        }
        self.index
            .save(&tombstone)
            .await
            .map_err(|e| prune_error(&tombstone.name, e))
    }
}

/// True for failed artifacts and finished tombstones older than the horizon.
fn record_expired(artifact: &BackupArtifact, now: DateTime<Utc>) -> bool {
    let since = match artifact.status {
        ArtifactStatus::Failed => artifact.created_at,
        ArtifactStatus::Deleted if artifact.payload_key.is_none() => {
            artifact.deleted_at.unwrap_or(artifact.created_at)
        }
        _ => return false,
    };
    now - since > chrono::Duration::days(RECORD_HORIZON_DAYS)
}

fn prune_error(artifact: &str, cause: BackupError) -> BackupError {
    BackupError::Prune {
        artifact: artifact.to_string(),
        reason: cause.to_string(),
    }
}
