use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::StoreError;

/// Every way a backup, restore or prune can end badly.
///
/// Each variant maps to its own process exit code so the scheduler can tell
/// "try again later" (`AlreadyRunning`) apart from "investigate now".
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("a run is already in progress for source '{source_id}' (held by {holder} until {expires_at})")]
    AlreadyRunning {
        source_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("dump failed: {0}")]
    Dump(String),

    #[error("packaging failed: {0}")]
    Package(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("verification failed for {key}: expected sha256 {expected}, remote has {actual}")]
    Verification {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("integrity check failed for artifact {artifact}: expected sha256 {expected}, downloaded {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("pruning artifact {artifact} failed: {reason}")]
    Prune { artifact: String, reason: String },

    #[error("replay into target failed: {0}")]
    Replay(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact {name} is not restorable (status: {status})")]
    NotRestorable { name: String, status: String },

    #[error("restore overwrites the target store and requires --confirm-destructive")]
    ConfirmationRequired,

    #[error("operation cancelled during {0}")]
    Cancelled(String),

    #[error("lease for source '{0}' was taken over by another holder")]
    LeaseLost(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Stable name of the error kind, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::AlreadyRunning { .. } => "AlreadyRunning",
            BackupError::Dump(_) => "DumpError",
            BackupError::Package(_) => "PackageError",
            BackupError::Upload(_) => "UploadError",
            BackupError::Verification { .. } => "VerificationError",
            BackupError::Integrity { .. } => "IntegrityError",
            BackupError::Prune { .. } => "PruneError",
            BackupError::Replay(_) => "ReplayError",
            BackupError::ArtifactNotFound(_) => "ArtifactNotFound",
            BackupError::NotRestorable { .. } => "NotRestorable",
            BackupError::ConfirmationRequired => "ConfirmationRequired",
            BackupError::Cancelled(_) => "Cancelled",
            BackupError::LeaseLost(_) => "LeaseLost",
            BackupError::Credentials(_) => "CredentialsError",
            BackupError::Config(_) => "ConfigError",
            BackupError::Storage(_) => "StorageError",
            BackupError::Io(_) => "IoError",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::Credentials(_) => 3,
            BackupError::Dump(_) => 10,
            BackupError::Package(_) => 11,
            BackupError::Upload(_) => 12,
            BackupError::Verification { .. } => 13,
            BackupError::Integrity { .. } => 14,
            BackupError::Prune { .. } => 15,
            BackupError::Replay(_) => 16,
            BackupError::ArtifactNotFound(_) => 17,
            BackupError::NotRestorable { .. } => 18,
            BackupError::ConfirmationRequired => 19,
            BackupError::Cancelled(_) => 20,
            BackupError::LeaseLost(_) => 21,
            BackupError::Storage(_) => 22,
            BackupError::Io(_) => 23,
            // EX_TEMPFAIL: the scheduler will fire again.
            BackupError::AlreadyRunning { .. } => 75,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = vec![
            BackupError::AlreadyRunning {
                source_id: "main".into(),
                holder: "h".into(),
                expires_at: Utc::now(),
            },
            BackupError::Dump("x".into()),
            BackupError::Package("x".into()),
            BackupError::Upload("x".into()),
            BackupError::Verification {
                key: "k".into(),
                expected: "a".into(),
                actual: "b".into(),
            },
            BackupError::Integrity {
                artifact: "a".into(),
                expected: "a".into(),
                actual: "b".into(),
            },
            BackupError::Prune {
                artifact: "a".into(),
                reason: "r".into(),
            },
            BackupError::Replay("x".into()),
            BackupError::ArtifactNotFound("x".into()),
            BackupError::NotRestorable {
                name: "n".into(),
                status: "pending".into(),
            },
            BackupError::ConfirmationRequired,
            BackupError::Cancelled("dump".into()),
            BackupError::LeaseLost("main".into()),
            BackupError::Credentials("x".into()),
            BackupError::Config("x".into()),
            BackupError::Storage(StoreError::NotFound("k".into())),
            BackupError::Io(std::io::Error::other("x")),
        ];

        let mut codes: Vec<u8> = errors.iter().map(BackupError::exit_code).collect();
        assert!(codes.iter().all(|code| *code != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
