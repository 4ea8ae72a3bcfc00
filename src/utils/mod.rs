pub mod checksum;
pub mod clock;

use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use which::which;

use crate::errors::BackupError;

/// Finds a PostgreSQL client executable in the system PATH.
pub fn find_pg_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        )
    })
}

/// Races `future` against `cancel`; a fired token wins and the future is
/// dropped, which also kills any child process it spawned with `kill_on_drop`.
pub async fn cancellable<T, F>(
    cancel: &CancellationToken,
    stage: &str,
    future: F,
) -> Result<T, BackupError>
where
    F: Future<Output = Result<T, BackupError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled(stage.to_string())),
        outcome = future => outcome,
    }
}

/// Checks that an identifier is safe to embed in object keys and file names.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.trim().is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_separators() {
        assert!(is_valid_identifier("main_db-1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("a/b"));
        assert!(!is_valid_identifier("../x"));
        assert!(!is_valid_identifier("db name"));
    }

    #[tokio::test]
    async fn cancelled_token_wins_over_pending_future() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), BackupError> =
            cancellable(&cancel, "dump", std::future::pending()).await;
        assert!(matches!(result, Err(BackupError::Cancelled(stage)) if stage == "dump"));
    }
}
