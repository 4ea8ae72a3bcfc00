// dbbackup/src/restore/logic.rs
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::verification::fetch_verified;
use crate::backup::archive::unpack_payload;
use crate::backup::artifact::{ArtifactIndex, ArtifactRef, BackupArtifact, RemoteLayout};
use crate::backup::db_dump::{ConnectionInfo, DatabaseClient};
use crate::config::RestoreOptions;
use crate::errors::BackupError;
use crate::storage::{ObjectStore, RetryPolicy};
use crate::utils::cancellable;

/// One restore, discarded when it finishes.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Whose artifacts to read.
    pub source_id: String,
    pub artifact: ArtifactRef,
    /// The store that gets overwritten.
    pub target: ConnectionInfo,
    pub confirm_destructive: bool,
}

pub struct RestoreOrchestrator {
    store: Arc<dyn ObjectStore>,
    database: Arc<dyn DatabaseClient>,
    retry: RetryPolicy,
    folder_prefix: String,
    work_dir: PathBuf,
    options: RestoreOptions,
}

impl RestoreOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        database: Arc<dyn DatabaseClient>,
        retry: RetryPolicy,
        folder_prefix: String,
        work_dir: PathBuf,
        options: RestoreOptions,
    ) -> Self {
        Self {
            store,
            database,
            retry,
            folder_prefix,
            work_dir,
            options,
        }
    }

    /// Downloads, verifies and replays one artifact into the target.
    ///
    /// The target is not touched until the payload's digest has matched. A
    /// failed replay can leave the target partially written; only an empty
    /// target is guaranteed to end up identical to the snapshot.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact, BackupError> {
        if !request.confirm_destructive {
            return Err(BackupError::ConfirmationRequired);
        }

        let index = ArtifactIndex::new(
            self.store.clone(),
            RemoteLayout::new(&self.folder_prefix, &request.source_id),
        );
        let artifact = index.resolve(&request.artifact).await?;
        info!(
            source = %request.source_id,
            artifact = %artifact.name,
            target = %request.target.redacted(),
            "restore started"
        );

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let work = tempfile::Builder::new()
            .prefix(&format!("restore-{}-", artifact.name))
            .tempdir_in(&self.work_dir)?;

        let payload = fetch_verified(&self.store, &self.retry, &artifact, work.path(), cancel).await?;

        let dump_path = if artifact.compressed {
            let payload_path = payload.path.clone();
            let dest = work.path().join(format!("{}.dump", artifact.name));
            cancellable(cancel, "decompress", async move {
                tokio::task::spawn_blocking(move || unpack_payload(&payload_path, true, &dest))
                    .await
                    .map_err(|e| BackupError::Package(format!("decompression task failed: {}", e)))?
            })
            .await?
        } else {
            payload.path.clone()
        };

        cancellable(
            cancel,
            "prepare target",
            self.database.prepare_target(&request.target, &self.options),
        )
        .await?;
        let replayed = cancellable(cancel, "replay", self.database.restore(&request.target, &dump_path)).await;
        if let Err(e) = &replayed {
            warn!(
                artifact = %artifact.name,
                target = %request.target.redacted(),
                error = %e,
                "replay failed; the target may be partially written"
            );
        }
        replayed?;

        info!(artifact = %artifact.name, target = %request.target.redacted(), "restore complete");
        Ok(artifact)
    }
}
