//! Read-only access to database and object storage credentials.
//!
//! Secrets are looked up when a command starts and dropped with it; nothing
//! here caches them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::BackupError;

#[derive(Clone)]
pub struct DatabaseCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn database_credentials(&self, source_id: &str) -> Result<DatabaseCredentials, BackupError>;

    /// `None` means "use the storage SDK's default credential chain".
    fn storage_credentials(&self) -> Result<Option<StorageCredentials>, BackupError>;
}

/// Reads secrets mounted as files, one value per file.
///
/// Layout: `<dir>/<source>/username`, `<dir>/<source>/password`, falling back
/// to `<dir>/db-username` and `<dir>/db-password`; storage keys live in
/// `<dir>/s3-access-key-id` and `<dir>/s3-secret-access-key`.
pub struct SecretsDirProvider {
    dir: PathBuf,
}

impl SecretsDirProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn read_secret(path: &Path) -> Result<Option<String>, BackupError> {
        match std::fs::read_to_string(path) {
            Ok(value) => Ok(Some(value.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::Credentials(format!(
                "cannot read secret {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn first_secret(&self, candidates: &[PathBuf]) -> Result<Option<String>, BackupError> {
        for candidate in candidates {
            if let Some(value) = Self::read_secret(candidate)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl CredentialProvider for SecretsDirProvider {
    fn database_credentials(&self, source_id: &str) -> Result<DatabaseCredentials, BackupError> {
        let username = self
            .first_secret(&[
                self.dir.join(source_id).join("username"),
                self.dir.join("db-username"),
            ])?
            .ok_or_else(|| {
                BackupError::Credentials(format!(
                    "no database username for source '{}' under {}",
                    source_id,
                    self.dir.display()
                ))
            })?;
        let password = self
            .first_secret(&[
                self.dir.join(source_id).join("password"),
                self.dir.join("db-password"),
            ])?
            .unwrap_or_default();
        Ok(DatabaseCredentials { username, password })
    }

    fn storage_credentials(&self) -> Result<Option<StorageCredentials>, BackupError> {
        let key_id = Self::read_secret(&self.dir.join("s3-access-key-id"))?;
        let secret = Self::read_secret(&self.dir.join("s3-secret-access-key"))?;
        match (key_id, secret) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(Some(StorageCredentials {
                access_key_id,
                secret_access_key,
            })),
            (None, None) => Ok(None),
            _ => Err(BackupError::Credentials(
                "only one of s3-access-key-id / s3-secret-access-key is mounted".to_string(),
            )),
        }
    }
}

/// Reads credentials from environment variables.
///
/// `BACKUP_DB_USER_<SOURCE>` / `BACKUP_DB_PASSWORD_<SOURCE>` win over the
/// unsuffixed `BACKUP_DB_USER` / `BACKUP_DB_PASSWORD`.
pub struct EnvProvider {
    vars: HashMap<String, String>,
}

impl EnvProvider {
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    #[cfg(test)]
    pub fn from_vars(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn lookup(&self, base: &str, source_id: &str) -> Option<String> {
        let suffixed = format!("{}_{}", base, source_id.to_uppercase().replace('-', "_"));
        let present = |key: &str| self.vars.get(key).filter(|v| !v.is_empty());
        present(suffixed.as_str()).or_else(|| present(base)).cloned()
    }
}

impl CredentialProvider for EnvProvider {
    fn database_credentials(&self, source_id: &str) -> Result<DatabaseCredentials, BackupError> {
        let username = self.lookup("BACKUP_DB_USER", source_id).ok_or_else(|| {
            BackupError::Credentials(format!(
                "BACKUP_DB_USER must be set for source '{}'",
                source_id
            ))
        })?;
        let password = self.lookup("BACKUP_DB_PASSWORD", source_id).unwrap_or_default();
        Ok(DatabaseCredentials { username, password })
    }

    fn storage_credentials(&self) -> Result<Option<StorageCredentials>, BackupError> {
        let key_id = self.vars.get("AWS_ACCESS_KEY_ID").filter(|v| !v.is_empty());
        let secret = self.vars.get("AWS_SECRET_ACCESS_KEY").filter(|v| !v.is_empty());
        Ok(match (key_id, secret) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StorageCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            }),
            _ => None,
        })
    }
}

/// Picks the mounted-secrets provider when a directory is configured.
pub fn provider_for(secrets_dir: Option<&Path>) -> Box<dyn CredentialProvider> {
    match secrets_dir {
        Some(dir) => Box::new(SecretsDirProvider::new(dir.to_path_buf())),
        None => Box::new(EnvProvider::from_env()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn secrets_dir_prefers_source_specific_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("main")).unwrap();
        std::fs::write(dir.path().join("main/username"), "main_user\n").unwrap();
        std::fs::write(dir.path().join("db-username"), "shared_user").unwrap();
        std::fs::write(dir.path().join("db-password"), "shared_pw\n").unwrap();

        let provider = SecretsDirProvider::new(dir.path().to_path_buf());
        let main = provider.database_credentials("main").unwrap();
        assert_eq!(main.username, "main_user");
        assert_eq!(main.password, "shared_pw");

        let other = provider.database_credentials("other").unwrap();
        assert_eq!(other.username, "shared_user");
    }

    #[test]
    fn secrets_dir_storage_credentials_must_be_paired() {
        let dir = TempDir::new().unwrap();
        let provider = SecretsDirProvider::new(dir.path().to_path_buf());
        assert!(provider.storage_credentials().unwrap().is_none());

        std::fs::write(dir.path().join("s3-access-key-id"), "AKIA").unwrap();
        assert!(provider.storage_credentials().is_err());

        std::fs::write(dir.path().join("s3-secret-access-key"), "secret").unwrap();
        let creds = provider.storage_credentials().unwrap().unwrap();
        assert_eq!(creds.access_key_id, "AKIA");
    }

    #[test]
    fn env_provider_suffix_overrides_default() {
        let provider = EnvProvider::from_vars(&[
            ("BACKUP_DB_USER", "default"),
            ("BACKUP_DB_USER_REPORTING_DB", "reporter"),
            ("BACKUP_DB_PASSWORD", "pw"),
        ]);
        assert_eq!(provider.database_credentials("reporting-db").unwrap().username, "reporter");
        assert_eq!(provider.database_credentials("main").unwrap().username, "default");
        assert!(provider.storage_credentials().unwrap().is_none());
    }

    #[test]
    fn empty_suffixed_variable_falls_back_to_default() {
        let provider = EnvProvider::from_vars(&[
            ("BACKUP_DB_USER", "default"),
            ("BACKUP_DB_USER_MAIN", ""),
            ("BACKUP_DB_PASSWORD", "pw"),
            ("BACKUP_DB_PASSWORD_MAIN", ""),
        ]);
        let creds = provider.database_credentials("main").unwrap();
        assert_eq!(creds.username, "default");
        assert_eq!(creds.password, "pw");
    }

    #[test]
    fn missing_user_is_a_credentials_error() {
        let provider = EnvProvider::from_vars(&[]);
        let err = provider.database_credentials("main").unwrap_err();
        assert_eq!(err.kind(), "CredentialsError");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = DatabaseCredentials {
            username: "u".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
