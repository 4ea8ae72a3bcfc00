//! Database Backup/Restore Tool
//!
//! One invocation runs one command: back up a source, restore an artifact,
//! list, prune or verify artifacts, or prepare the storage bucket.

// dbbackup/src/main.rs
mod backup;
mod config;
mod credentials;
mod errors;
mod restore;
mod storage;
#[cfg(test)]
mod testing;
mod utils;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use backup::artifact::{ArtifactRef, BackupArtifact};
use config::AppConfig;
use errors::BackupError;

/// Consistent database snapshots shipped to object storage
#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long, global = true, default_value = "config.json", help = "Path to the JSON configuration file")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
#[clap(rename_all = "kebab-case")]
enum Command {
    /// Take one backup of a configured source.
    Backup {
        #[clap(long)]
        source: String,
    },
    /// Replay an artifact into a target database, overwriting it.
    Restore {
        /// Source whose artifacts to read.
        #[clap(long)]
        source: String,
        /// Artifact name, or `latest`.
        #[clap(long, default_value = "latest")]
        artifact: ArtifactRef,
        /// Configured source entry describing the database to overwrite.
        #[clap(long)]
        target: String,
        #[clap(long)]
        confirm_destructive: bool,
    },
    /// List artifacts of a source, newest first.
    List {
        #[clap(long)]
        source: String,
        /// Include pending, failed and deleted artifacts.
        #[clap(long)]
        all: bool,
    },
    /// Apply the retention policy now.
    Prune {
        #[clap(long)]
        source: String,
    },
    /// Download an artifact and check its digest without restoring it.
    Verify {
        #[clap(long)]
        source: String,
        #[clap(long, default_value = "latest")]
        artifact: ArtifactRef,
    },
    /// Create the backup bucket or root directory if it does not exist.
    Init,
}

impl Command {
    fn source(&self) -> Option<&str> {
        match self {
            Command::Backup { source }
            | Command::Restore { source, .. }
            | Command::List { source, .. }
            | Command::Prune { source }
            | Command::Verify { source, .. } => Some(source.as_str()),
            Command::Init => None,
        }
    }
}

/// A terminal failure with enough context for an operator to act on it.
struct Failure {
    error: BackupError,
    artifact: Option<String>,
}

impl From<BackupError> for Failure {
    fn from(error: BackupError) -> Self {
        Self { error, artifact: None }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let source = args.command.source().map(str::to_string);

    let app_config = match AppConfig::load_from_json(&args.config)
        .with_context(|| format!("Failed to load application configuration from {}", args.config.display()))
    {
        Ok(config) => config,
        Err(e) => {
            let error = BackupError::Config(format!("{:#}", e));
            eprintln!("❌ {}: {}", error.kind(), error);
            return ExitCode::from(error.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    watch_for_shutdown(cancel.clone());
    let deadline = {
        let cancel = cancel.clone();
        let run_timeout = app_config.run_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(run_timeout).await;
            warn!(timeout_secs = run_timeout.as_secs(), "run timeout reached, cancelling");
            cancel.cancel();
        })
    };

    let outcome = run_command(args.command, &app_config, &cancel).await;
    deadline.abort();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            let mut report = format!("❌ {}", failure.error.kind());
            if let Some(source) = &source {
                report.push_str(&format!(" source={}", source));
            }
            if let Some(artifact) = &failure.artifact {
                report.push_str(&format!(" artifact={}", artifact));
            }
            eprintln!("{}: {}", report, failure.error);
            ExitCode::from(failure.error.exit_code())
        }
    }
}

async fn run_command(command: Command, app_config: &AppConfig, cancel: &CancellationToken) -> Result<(), Failure> {
    match command {
        Command::Backup { source } => {
            println!("🚀 Starting backup of '{}'...", source);
            let result = backup::run_backup_flow(app_config, &source, cancel).await;
            if let Some(report) = &result.prune {
                for e in &report.errors {
                    println!("⚠️ {}: {}", e.kind(), e);
                }
                if !report.deleted.is_empty() {
                    println!("🧹 Pruned {} artifact(s): {}", report.deleted.len(), report.deleted.join(", "));
                }
            }
            let artifact_name = result.artifact.as_ref().map(|a| a.name.clone());
            match result.into_result() {
                Ok(artifact) => {
                    println!(
                        "✅ Backup complete: {} ({} bytes, sha256 {})",
                        artifact.name,
                        artifact.size_bytes.unwrap_or_default(),
                        artifact.sha256.as_deref().unwrap_or("-")
                    );
                    Ok(())
                }
                Err(error) => Err(Failure {
                    error,
                    artifact: artifact_name,
                }),
            }
        }
        Command::Restore {
            source,
            artifact,
            target,
            confirm_destructive,
        } => {
            println!("🔄 Restoring {} of '{}' into '{}'...", artifact, source, target);
            let requested = artifact.to_string();
            let restored = restore::run_restore_flow(app_config, &source, artifact, &target, confirm_destructive, cancel)
                .await
                .map_err(|error| Failure {
                    error,
                    artifact: Some(requested),
                })?;
            println!("✅ Restore complete: {} into '{}'", restored.name, target);
            Ok(())
        }
        Command::List { source, all } => {
            let artifacts = backup::list_artifacts(app_config, &source, all).await?;
            if artifacts.is_empty() {
                println!("No artifacts found for '{}'.", source);
            }
            for artifact in &artifacts {
                println!("{}", describe(artifact));
            }
            Ok(())
        }
        Command::Prune { source } => {
            let report = backup::prune_flow(app_config, &source).await?;
            for name in &report.deleted {
                println!("🧹 Deleted {}", name);
            }
            match report.errors.into_iter().next() {
                None => {
                    println!("✅ Prune complete: {} artifact(s) deleted.", report.deleted.len());
                    Ok(())
                }
                Some(first) => {
                    let artifact = match &first {
                        BackupError::Prune { artifact, .. } => Some(artifact.clone()),
                        _ => None,
                    };
                    Err(Failure { error: first, artifact })
                }
            }
        }
        Command::Verify { source, artifact } => {
            let requested = artifact.to_string();
            let verified = restore::verify_flow(app_config, &source, artifact, cancel)
                .await
                .map_err(|error| Failure {
                    error,
                    artifact: Some(requested),
                })?;
            println!("✅ {} matches its recorded sha256.", verified.name);
            Ok(())
        }
        Command::Init => {
            backup::init_storage(app_config).await?;
            println!("✅ Backup storage is ready.");
            Ok(())
        }
    }
}

fn describe(artifact: &BackupArtifact) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        artifact.name,
        artifact.status,
        artifact.created_at.to_rfc3339(),
        artifact
            .size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "-".to_string())
    )
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn watch_for_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        warn!("shutdown signal received, cancelling");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_restore_arguments() {
        let args = Args::try_parse_from([
            "dbbackup",
            "--config",
            "/etc/dbbackup.json",
            "restore",
            "--source",
            "main",
            "--target",
            "scratch",
            "--confirm-destructive",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/dbbackup.json"));
        match args.command {
            Command::Restore {
                source,
                artifact,
                target,
                confirm_destructive,
            } => {
                assert_eq!(source, "main");
                assert_eq!(artifact, ArtifactRef::Latest);
                assert_eq!(target, "scratch");
                assert!(confirm_destructive);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_defaults_to_local_file() {
        let args = Args::try_parse_from(["dbbackup", "backup", "--source", "main"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.command.source(), Some("main"));
    }

    #[test]
    fn rejects_path_like_artifact_names() {
        assert!(Args::try_parse_from(["dbbackup", "verify", "--source", "main", "--artifact", "../etc"]).is_err());
    }
}
