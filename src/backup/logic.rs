// dbbackup/src/backup/logic.rs
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::archive::{PackagedArtifact, package_dump};
use super::artifact::{ArtifactIndex, ArtifactStatus, BackupArtifact, RemoteLayout};
use super::db_dump::{ConnectionInfo, DatabaseClient};
use super::lease::{Heartbeat, LeaseGuard};
use super::retention::{PruneReport, RetentionManager, RetentionPolicy};
use super::upload::{PublishOutcome, Uploader};
use crate::config::{AppConfig, CompressionConfig, LeaseConfig};
use crate::errors::BackupError;
use crate::restore::download::download_and_hash;
use crate::storage::{ObjectStore, RetryPolicy};
use crate::utils::cancellable;
use crate::utils::clock::Clock;

/// The parts of the configuration a backup run needs.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub folder_prefix: String,
    pub compression: CompressionConfig,
    pub lease: LeaseConfig,
    pub upload_retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub work_dir: PathBuf,
}

impl From<&AppConfig> for RunSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            folder_prefix: config.folder_prefix.clone(),
            compression: config.compression,
            lease: config.lease,
            upload_retry: config.upload_retry.clone(),
            retention: config.retention.clone(),
            work_dir: config.work_dir.clone(),
        }
    }
}

/// How one run ended. `artifact` is `None` only when the run never got far
/// enough to record one (lease refused, manifest write failed).
#[derive(Debug)]
pub struct RunResult {
    pub source_id: String,
    pub artifact: Option<BackupArtifact>,
    pub error: Option<BackupError>,
    pub prune: Option<PruneReport>,
}

impl RunResult {
    pub fn into_result(self) -> Result<BackupArtifact, BackupError> {
        match (self.error, self.artifact) {
            (Some(e), _) => Err(e),
            (None, Some(artifact)) => Ok(artifact),
            (None, None) => Err(BackupError::ArtifactNotFound(format!(
                "run for '{}' recorded no artifact",
                self.source_id
            ))),
        }
    }
}

/// Drives one backup run for one source from lease to release.
pub struct RunCoordinator {
    store: Arc<dyn ObjectStore>,
    database: Arc<dyn DatabaseClient>,
    clock: Arc<dyn Clock>,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        database: Arc<dyn DatabaseClient>,
        clock: Arc<dyn Clock>,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            database,
            clock,
            settings,
        }
    }

    /// Lease, dump, package, publish, verify, complete, prune, release.
    /// The lease is released on every path once acquired.
    pub async fn run_backup(&self, source_id: &str, conn: &ConnectionInfo, cancel: &CancellationToken) -> RunResult {
        let layout = RemoteLayout::new(&self.settings.folder_prefix, source_id);

        let guard = match LeaseGuard::acquire(
            self.store.clone(),
            self.clock.clone(),
            &layout,
            source_id,
            self.settings.lease.ttl,
        )
        .await
        {
            Ok(guard) => guard,
            Err(e) => {
                return RunResult {
                    source_id: source_id.to_string(),
                    artifact: None,
                    error: Some(e),
                    prune: None,
                };
            }
        };

        let run_cancel = cancel.child_token();
        let heartbeat = Heartbeat::start(guard, self.settings.lease.renew_interval, run_cancel.clone());
        let index = ArtifactIndex::new(self.store.clone(), layout);

        self.recover_abandoned(&index).await;

        let mut artifact = BackupArtifact::pending(source_id, self.clock.now());
        let mut recorded = false;
        let mut outcome = match index.create_pending(&artifact).await {
            Ok(()) => {
                recorded = true;
                info!(source = source_id, artifact = %artifact.name, "backup run started");
                self.execute(&index, &heartbeat, &mut artifact, conn, &run_cancel).await
            }
            Err(e) => Err(e),
        };

        if heartbeat.lease_lost() && matches!(outcome, Err(BackupError::Cancelled(_))) {
            outcome = Err(BackupError::LeaseLost(source_id.to_string()));
        }

        let mut prune = None;
        let error = match outcome {
            Ok(()) => {
                info!(
                    source = source_id,
                    artifact = %artifact.name,
                    size_bytes = artifact.size_bytes.unwrap_or_default(),
                    "backup complete"
                );
                let report = RetentionManager::new(self.store.clone(), index.clone())
                    .prune(&self.settings.retention, self.clock.now())
                    .await;
                for e in &report.errors {
                    warn!(source = source_id, error = %e, "retention left an artifact behind");
                }
                prune = Some(report);
                None
            }
            Err(e) => {
                error!(source = source_id, artifact = %artifact.name, kind = e.kind(), error = %e, "backup run failed");
                if recorded {
                    let reason = format!("{}: {}", e.kind(), e);
                    self.mark_failed(&index, &mut artifact, reason).await;
                }
                Some(e)
            }
        };

        heartbeat.stop_and_release().await;

        RunResult {
            source_id: source_id.to_string(),
            artifact: recorded.then_some(artifact),
            error,
            prune,
        }
    }

    async fn execute(
        &self,
        index: &ArtifactIndex,
        heartbeat: &Heartbeat,
        artifact: &mut BackupArtifact,
        conn: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let work = tempfile::Builder::new()
            .prefix(&format!("{}-", artifact.name))
            .tempdir_in(&self.settings.work_dir)?;

        let dump_path = work.path().join(format!("{}.dump", artifact.name));
        let dumped = cancellable(cancel, "dump", self.database.dump(conn, &dump_path)).await?;
        info!(artifact = %artifact.name, size_bytes = dumped, "dump finished");

        let packaged = cancellable(cancel, "package", self.package(dump_path, work.path().to_path_buf())).await?;
        let layout = index.layout();
        let staging_key = layout.staging_key(&packaged.sha256, packaged.extension());
        let payload_key = layout.payload_key(&artifact.name, packaged.extension());

        artifact.size_bytes = Some(packaged.size);
        artifact.sha256 = Some(packaged.sha256.clone());
        artifact.compressed = packaged.compressed;
        artifact.staging_key = Some(staging_key.clone());
        artifact.payload_key = Some(payload_key.clone());
        // Recovery after a crash finds the keys to clean up here.
        index.save(artifact).await?;

        let uploader = Uploader::new(self.store.clone(), self.settings.upload_retry.clone());
        if uploader.publish(&packaged, &staging_key, &payload_key, cancel).await? == PublishOutcome::AlreadyPresent {
            info!(artifact = %artifact.name, "payload was already in place");
        }

        let verify_path = work.path().join("verify").join(format!("{}{}", artifact.name, packaged.extension()));
        let (remote_sha256, _) =
            download_and_hash(&self.store, &self.settings.upload_retry, &payload_key, &verify_path, cancel).await?;
        if remote_sha256 != packaged.sha256 {
            return Err(BackupError::Verification {
                key: payload_key,
                expected: packaged.sha256,
                actual: remote_sha256,
            });
        }

        heartbeat.renew_now().await?;
        artifact.status = ArtifactStatus::Complete;
        artifact.completed_at = Some(self.clock.now());
        index.save(artifact).await?;
        Ok(())
    }

    async fn package(&self, dump_path: PathBuf, out_dir: PathBuf) -> Result<PackagedArtifact, BackupError> {
        let compression = self.settings.compression;
        tokio::task::spawn_blocking(move || package_dump(&dump_path, &out_dir, compression))
            .await
            .map_err(|e| BackupError::Package(format!("packaging task failed: {}", e)))?
    }

    /// Removes whatever the run put in storage and records why it failed.
    async fn mark_failed(&self, index: &ArtifactIndex, artifact: &mut BackupArtifact, reason: String) {
        let uploader = Uploader::new(self.store.clone(), self.settings.upload_retry.clone());
        let keys: Vec<&str> = [artifact.staging_key.as_deref(), artifact.payload_key.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        uploader.discard(&keys).await;

        artifact.status = ArtifactStatus::Failed;
        artifact.failure = Some(reason);
        if let Err(e) = index.save(artifact).await {
            error!(artifact = %artifact.name, error = %e, "could not record failed artifact");
        }
    }

    /// Pending artifacts seen while holding the lease belong to a run that
    /// died without cleaning up.
    async fn recover_abandoned(&self, index: &ArtifactIndex) {
        let artifacts = match index.list().await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!(error = %e, "could not list artifacts for recovery");
                return;
            }
        };
        for mut artifact in artifacts.into_iter().filter(|a| a.status == ArtifactStatus::Pending) {
            warn!(artifact = %artifact.name, created_at = %artifact.created_at, "cleaning up abandoned run");
            self.mark_failed(index, &mut artifact, "abandoned by an interrupted run".to_string())
                .await;
        }
    }
}
