// dbbackup/src/backup/db_dump.rs
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tokio::process::Command;
use tracing::info;
use url::Url;

use crate::config::{RestoreOptions, SourceConfig};
use crate::credentials::DatabaseCredentials;
use crate::errors::BackupError;
use crate::restore::db_restore;
use crate::utils::find_pg_executable;

/// Where to reach one database, with the credentials to do so.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    password: String,
}

impl ConnectionInfo {
    pub fn new(source: &SourceConfig, credentials: DatabaseCredentials) -> Self {
        Self {
            host: source.host.clone(),
            port: source.port,
            database: source.database.clone(),
            username: credentials.username,
            password: credentials.password,
        }
    }

    /// Same server and login, different database.
    pub fn for_database(&self, database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    /// Connection URL with credentials, for sqlx. Never log this.
    pub(crate) fn url(&self) -> Result<Url, BackupError> {
        let mut url = self.redacted_url()?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| BackupError::Config(format!("cannot set password on {}", url)))?;
        }
        Ok(url)
    }

    fn redacted_url(&self) -> Result<Url, BackupError> {
        let mut url = Url::parse(&format!("postgres://{}:{}", self.host, self.port))
            .map_err(|e| BackupError::Config(format!("invalid database host '{}': {}", self.host, e)))?;
        url.set_path(&self.database);
        url.set_username(&self.username)
            .map_err(|_| BackupError::Config(format!("cannot set username on {}", url)))?;
        Ok(url)
    }

    /// `postgres://user@host:port/db`, safe to log.
    pub fn redacted(&self) -> String {
        match self.redacted_url() {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// The database engine seam: produce a snapshot, replay one.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Writes a consistent snapshot of `conn`'s database to `dest` and
    /// returns its size in bytes.
    async fn dump(&self, conn: &ConnectionInfo, dest: &Path) -> Result<u64, BackupError>;

    /// Creates, recreates or checks the target database before a replay.
    async fn prepare_target(&self, conn: &ConnectionInfo, options: &RestoreOptions) -> Result<(), BackupError>;

    async fn restore(&self, conn: &ConnectionInfo, source: &Path) -> Result<(), BackupError>;
}

/// `pg_dump` / `pg_restore` in custom archive format.
pub struct PostgresClient {
    serializable_deferrable: bool,
}

impl PostgresClient {
    pub fn new(serializable_deferrable: bool) -> Self {
        Self {
            serializable_deferrable,
        }
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn dump(&self, conn: &ConnectionInfo, dest: &Path) -> Result<u64, BackupError> {
        let pg_dump_path = find_pg_executable("pg_dump").map_err(|e| BackupError::Dump(format!("{:#}", e)))?;
        info!(database = %conn.redacted(), dest = %dest.display(), "running pg_dump");

        let mut command = Command::new(&pg_dump_path);
        command
            .arg("--format=custom")
            .arg("--no-password")
            .arg("--file")
            .arg(dest)
            .arg("--host")
            .arg(&conn.host)
            .arg("--port")
            .arg(conn.port.to_string())
            .arg("--username")
            .arg(&conn.username)
            .arg("--dbname")
            .arg(&conn.database)
            .env("PGPASSWORD", conn.password())
            .kill_on_drop(true);
        if self.serializable_deferrable {
            command.arg("--serializable-deferrable");
        }

        let output = command
            .output()
            .await
            .map_err(|e| BackupError::Dump(format!("failed to execute pg_dump: {}", e)))?;
        if !output.status.success() {
            return Err(BackupError::Dump(format!(
                "pg_dump for database {} failed with status: {}\nStderr: {}",
                conn.database,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size = tokio::fs::metadata(dest)
            .await
            .map_err(|e| BackupError::Dump(format!("pg_dump produced no file at {}: {}", dest.display(), e)))?
            .len();
        if size == 0 {
            return Err(BackupError::Dump(format!("pg_dump produced an empty dump of {}", conn.database)));
        }
        info!(database = %conn.database, size_bytes = size, "pg_dump finished");
        Ok(size)
    }

    async fn prepare_target(&self, conn: &ConnectionInfo, options: &RestoreOptions) -> Result<(), BackupError> {
        db_restore::prepare_target_database(conn, options).await
    }

    async fn restore(&self, conn: &ConnectionInfo, source: &Path) -> Result<(), BackupError> {
        db_restore::run_pg_restore(conn, source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(password: &str) -> ConnectionInfo {
        let source = SourceConfig {
            id: "main".into(),
            host: "db.internal".into(),
            port: 5433,
            database: "app".into(),
            serializable_deferrable: false,
        };
        ConnectionInfo::new(
            &source,
            DatabaseCredentials {
                username: "backup".into(),
                password: password.into(),
            },
        )
    }

    #[test]
    fn debug_and_redacted_forms_hide_the_password() {
        let info = conn("s3cr:t@");
        assert_eq!(info.redacted(), "postgres://backup@db.internal:5433/app");
        assert!(!format!("{:?}", info).contains("s3cr"));
    }

    #[test]
    fn url_carries_an_encoded_password() {
        let url = conn("s3cr:t@").url().unwrap();
        assert_eq!(url.username(), "backup");
        assert_eq!(url.password(), Some("s3cr%3At%40"));
        assert_eq!(url.path(), "/app");
    }

    #[test]
    fn for_database_keeps_the_login() {
        let admin = conn("pw").for_database("postgres");
        assert_eq!(admin.database, "postgres");
        assert_eq!(admin.username, "backup");
        assert_eq!(admin.password(), "pw");
    }
}
