pub(crate) mod db_restore;
pub(crate) mod download;
pub(crate) mod logic;
pub(crate) mod verification;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backup::CommandContext;
use crate::backup::artifact::{ArtifactRef, BackupArtifact};
use crate::backup::db_dump::PostgresClient;
use crate::config::AppConfig;
use crate::errors::BackupError;
use logic::{RestoreOrchestrator, RestoreRequest};
use verification::fetch_verified;

/// Restores an artifact of `source_id` into the configured `target_id`.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    source_id: &str,
    artifact: ArtifactRef,
    target_id: &str,
    confirm_destructive: bool,
    cancel: &CancellationToken,
) -> Result<BackupArtifact, BackupError> {
    if !confirm_destructive {
        return Err(BackupError::ConfirmationRequired);
    }
    app_config.source(source_id)?;
    let context = CommandContext::open(app_config).await?;
    let target = context.connection(app_config, target_id)?;

    let orchestrator = RestoreOrchestrator::new(
        context.store.clone(),
        Arc::new(PostgresClient::new(false)),
        app_config.upload_retry.clone(),
        app_config.folder_prefix.clone(),
        app_config.work_dir.clone(),
        app_config.restore_options,
    );
    let request = RestoreRequest {
        source_id: source_id.to_string(),
        artifact,
        target,
        confirm_destructive,
    };
    orchestrator.restore(&request, cancel).await
}

/// Downloads an artifact and checks its digest without touching any database.
pub async fn verify_flow(
    app_config: &AppConfig,
    source_id: &str,
    artifact: ArtifactRef,
    cancel: &CancellationToken,
) -> Result<BackupArtifact, BackupError> {
    let context = CommandContext::open(app_config).await?;
    let index = context.index(app_config, source_id)?;
    let artifact = index.resolve(&artifact).await?;

    tokio::fs::create_dir_all(&app_config.work_dir).await?;
    let scratch = tempfile::Builder::new()
        .prefix("verify-")
        .tempdir_in(&app_config.work_dir)?;
    let payload = fetch_verified(&context.store, &app_config.upload_retry, &artifact, scratch.path(), cancel).await?;
    info!(source = source_id, artifact = %artifact.name, size_bytes = payload.size, "artifact verified");
    Ok(artifact)
}
