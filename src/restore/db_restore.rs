// dbbackup/src/restore/db_restore.rs
use sqlx::{Connection, PgConnection};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backup::db_dump::ConnectionInfo;
use crate::config::RestoreOptions;
use crate::errors::BackupError;
use crate::utils::find_pg_executable;

/// Replays a custom-format dump into `conn`'s database with `pg_restore`.
pub async fn run_pg_restore(conn: &ConnectionInfo, dump_path: &Path) -> Result<(), BackupError> {
    if !dump_path.exists() {
        return Err(BackupError::Replay(format!(
            "dump file for restore not found: {}",
            dump_path.display()
        )));
    }

    let pg_restore_path = find_pg_executable("pg_restore").map_err(|e| BackupError::Replay(format!("{:#}", e)))?;
    info!(target = %conn.redacted(), dump = %dump_path.display(), "running pg_restore");

    let output = Command::new(pg_restore_path)
        .arg("--exit-on-error")
        .arg("--no-owner")
        .arg("--no-password")
        .arg("--host")
        .arg(&conn.host)
        .arg("--port")
        .arg(conn.port.to_string())
        .arg("--username")
        .arg(&conn.username)
        .arg("--dbname")
        .arg(&conn.database)
        .arg(dump_path)
        .env("PGPASSWORD", conn.password())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackupError::Replay(format!("failed to execute pg_restore: {}", e)))?;

    if !output.status.success() {
        return Err(BackupError::Replay(format!(
            "pg_restore into {} failed with status: {}\nStderr: {}",
            conn.database,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    info!(target = %conn.redacted(), "pg_restore finished");
    Ok(())
}

/// Gets the target database ready for a replay, per `options`:
/// drop and recreate it, create it if missing, and check that it is empty.
pub async fn prepare_target_database(conn: &ConnectionInfo, options: &RestoreOptions) -> Result<(), BackupError> {
    let db_name = conn.database.as_str();
    let admin = conn.for_database("postgres");
    let mut admin_conn = PgConnection::connect(admin.url()?.as_str())
        .await
        .map_err(|e| replay(format!("failed to connect to 'postgres' on {}: {}", admin.redacted(), e)))?;

    let db_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(db_name)
        .fetch_one(&mut admin_conn)
        .await
        .map_err(|e| replay(format!("failed to check existence of database '{}': {}", db_name, e)))?;

    if db_exists && options.drop_target_database_if_exists {
        if db_name.eq_ignore_ascii_case("postgres") {
            return Err(replay(format!(
                "refusing to drop '{}': it is a critical system database",
                db_name
            )));
        }
        warn!(database = db_name, "dropping target database before restore");
        sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()")
            .bind(db_name)
            .execute(&mut admin_conn)
            .await
            .map_err(|e| replay(format!("failed to terminate connections to '{}': {}", db_name, e)))?;
        sqlx::query(&format!(r#"DROP DATABASE "{}" WITH (FORCE)"#, quote_ident(db_name)))
            .execute(&mut admin_conn)
            .await
            .map_err(|e| replay(format!("failed to drop database '{}': {}", db_name, e)))?;
        return create_database(&mut admin_conn, conn).await;
    }

    if !db_exists {
        if !options.create_target_database_if_not_exists {
            return Err(replay(format!(
                "database '{}' does not exist and create_target_database_if_not_exists is false",
                db_name
            )));
        }
        return create_database(&mut admin_conn, conn).await;
    }

    let mut target_conn = PgConnection::connect(conn.url()?.as_str())
        .await
        .map_err(|e| replay(format!("failed to connect to {}: {}", conn.redacted(), e)))?;
    let user_tables: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM information_schema.tables WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
    )
    .fetch_one(&mut target_conn)
    .await
    .map_err(|e| replay(format!("failed to inspect database '{}': {}", db_name, e)))?;

    if user_tables > 0 {
        if options.require_empty_target {
            return Err(replay(format!(
                "database '{}' already has {} table(s) and require_empty_target is set",
                db_name, user_tables
            )));
        }
        warn!(database = db_name, tables = user_tables, "restoring into a non-empty database");
    }
    Ok(())
}

async fn create_database(admin_conn: &mut PgConnection, conn: &ConnectionInfo) -> Result<(), BackupError> {
    let mut create_sql = format!(r#"CREATE DATABASE "{}""#, quote_ident(&conn.database));
    if !conn.username.is_empty() {
        create_sql.push_str(&format!(r#" OWNER "{}""#, quote_ident(&conn.username)));
    }
    sqlx::query(&create_sql)
        .execute(admin_conn)
        .await
        .map_err(|e| replay(format!("failed to create database '{}': {}", conn.database, e)))?;
    info!(database = %conn.database, "created target database");
    Ok(())
}

fn quote_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

fn replay(message: String) -> BackupError {
    BackupError::Replay(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident(r#"we"ird"#), r#"we""ird"#);
        assert_eq!(quote_ident("plain"), "plain");
    }

    #[tokio::test]
    async fn missing_dump_file_is_a_replay_error() {
        let source = crate::config::SourceConfig {
            id: "main".into(),
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            serializable_deferrable: false,
        };
        let conn = ConnectionInfo::new(
            &source,
            crate::credentials::DatabaseCredentials {
                username: "u".into(),
                password: String::new(),
            },
        );
        let err = run_pg_restore(&conn, Path::new("/nonexistent/x.dump")).await.unwrap_err();
        assert_eq!(err.kind(), "ReplayError");
    }
}
