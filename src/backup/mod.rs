pub(crate) mod archive;
pub(crate) mod artifact;
pub(crate) mod db_dump;
pub(crate) mod lease;
pub(crate) mod logic;
pub(crate) mod retention;
pub(crate) mod upload;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::credentials::{CredentialProvider, provider_for};
use crate::errors::BackupError;
use crate::storage::{self, ObjectStore};
use crate::utils::clock::{Clock, SystemClock};
use artifact::{ArtifactIndex, BackupArtifact, RemoteLayout};
use db_dump::{ConnectionInfo, PostgresClient};
use lease::LeaseGuard;
pub use logic::RunResult;
use logic::{RunCoordinator, RunSettings};
use retention::{PruneReport, RetentionManager};

/// Storage handle and credential source for one command.
pub(crate) struct CommandContext {
    pub store: Arc<dyn ObjectStore>,
    pub credentials: Box<dyn CredentialProvider>,
}

impl CommandContext {
    pub async fn open(app_config: &AppConfig) -> Result<Self, BackupError> {
        let credentials = provider_for(app_config.secrets_dir.as_deref());
        let store = storage::connect(&app_config.storage, credentials.storage_credentials()?).await?;
        Ok(Self { store, credentials })
    }

    pub fn connection(&self, app_config: &AppConfig, source_id: &str) -> Result<ConnectionInfo, BackupError> {
        let source = app_config.source(source_id)?;
        let credentials = self.credentials.database_credentials(source_id)?;
        Ok(ConnectionInfo::new(source, credentials))
    }

    pub fn index(&self, app_config: &AppConfig, source_id: &str) -> Result<ArtifactIndex, BackupError> {
        app_config.source(source_id)?;
        Ok(ArtifactIndex::new(
            self.store.clone(),
            RemoteLayout::new(&app_config.folder_prefix, source_id),
        ))
    }
}

/// Runs one backup of `source_id`. Setup failures come back as a failed
/// result like any other, so the caller reports them the same way.
pub async fn run_backup_flow(app_config: &AppConfig, source_id: &str, cancel: &CancellationToken) -> RunResult {
    let setup = async {
        let context = CommandContext::open(app_config).await?;
        let conn = context.connection(app_config, source_id)?;
        let source = app_config.source(source_id)?;
        Ok::<_, BackupError>((context, conn, source.serializable_deferrable))
    };
    let (context, conn, serializable_deferrable) = match setup.await {
        Ok(ready) => ready,
        Err(e) => {
            return RunResult {
                source_id: source_id.to_string(),
                artifact: None,
                error: Some(e),
                prune: None,
            };
        }
    };

    let coordinator = RunCoordinator::new(
        context.store,
        Arc::new(PostgresClient::new(serializable_deferrable)),
        Arc::new(SystemClock),
        RunSettings::from(app_config),
    );
    coordinator.run_backup(source_id, &conn, cancel).await
}

/// Artifacts of one source, newest first, read fresh from storage.
pub async fn list_artifacts(
    app_config: &AppConfig,
    source_id: &str,
    include_all: bool,
) -> Result<Vec<BackupArtifact>, BackupError> {
    let context = CommandContext::open(app_config).await?;
    let index = context.index(app_config, source_id)?;
    if include_all {
        index.list().await
    } else {
        index.list_complete().await
    }
}

/// Applies the retention policy outside a backup run, holding the source's
/// lease so it cannot overlap one.
pub async fn prune_flow(app_config: &AppConfig, source_id: &str) -> Result<PruneReport, BackupError> {
    let context = CommandContext::open(app_config).await?;
    let index = context.index(app_config, source_id)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let guard = LeaseGuard::acquire(
        context.store.clone(),
        clock.clone(),
        index.layout(),
        source_id,
        app_config.lease.ttl,
    )
    .await?;
    let report = RetentionManager::new(context.store.clone(), index)
        .prune(&app_config.retention, clock.now())
        .await;
    if let Err(e) = guard.release().await {
        warn!(source = source_id, error = %e, "failed to release lease after prune");
    }

    info!(source = source_id, deleted = report.deleted.len(), errors = report.errors.len(), "prune finished");
    Ok(report)
}

/// Creates the bucket or root directory backups are written to.
pub async fn init_storage(app_config: &AppConfig) -> Result<(), BackupError> {
    let context = CommandContext::open(app_config).await?;
    context.store.ensure_container().await?;
    info!("backup storage is ready");
    Ok(())
}
