// dbbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::retention::RetentionPolicy;
use crate::errors::BackupError;
use crate::storage::RetryPolicy;
use crate::utils::is_valid_identifier;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonSourceConfig {
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub serializable_deferrable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonStorageConfig {
    pub backend: Option<String>,
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetentionConfig {
    pub max_age_days: Option<u32>,
    pub max_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCompressionConfig {
    pub enabled: Option<bool>,
    pub level: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonLeaseConfig {
    pub ttl_secs: Option<u64>,
    pub renew_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_elapsed_secs: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    #[serde(default)]
    pub create_target_database_if_not_exists: bool,
    #[serde(default)]
    pub drop_target_database_if_exists: bool,
    #[serde(default)]
    pub require_empty_target: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCredentialsConfig {
    pub secrets_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub sources: Option<BTreeMap<String, JsonSourceConfig>>,
    pub storage: Option<JsonStorageConfig>,
    pub retention: Option<JsonRetentionConfig>,
    pub compression: Option<JsonCompressionConfig>,
    pub lease: Option<JsonLeaseConfig>,
    pub upload_retry: Option<JsonRetryConfig>,
    pub run_timeout_secs: Option<u64>,
    pub work_dir: Option<PathBuf>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub credentials: Option<JsonCredentialsConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub serializable_deferrable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    S3(S3Config),
    Local { root: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub create_target_database_if_not_exists: bool,
    pub drop_target_database_if_exists: bool,
    pub require_empty_target: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sources: BTreeMap<String, SourceConfig>,
    pub storage: StorageConfig,
    pub folder_prefix: String,
    pub retention: RetentionPolicy,
    pub compression: CompressionConfig,
    pub lease: LeaseConfig,
    pub upload_retry: RetryPolicy,
    pub run_timeout: Duration,
    pub work_dir: PathBuf,
    pub restore_options: RestoreOptions,
    pub secrets_dir: Option<PathBuf>,
}

const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_LEASE_TTL_SECS: u64 = 3600;
/// Upper bound on `lease.ttl_secs`: one week.
const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 6 * 3600;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let sources = parse_sources(raw.sources.unwrap_or_default())?;
        let raw_storage = raw
            .storage
            .context("storage must be set in config.json")?;
        let folder_prefix = raw_storage
            .folder_prefix
            .clone()
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();
        let storage = parse_storage(raw_storage)?;

        let raw_retention = raw.retention.unwrap_or_default();
        if raw_retention.max_count == Some(0) {
            anyhow::bail!("retention.max_count must be at least 1 in config.json.");
        }
        let retention = RetentionPolicy {
            max_age: raw_retention
                .max_age_days
                .map(|days| chrono::Duration::days(i64::from(days))),
            max_count: raw_retention.max_count,
        };

        let compression = match raw.compression {
            Some(c) => CompressionConfig {
                enabled: c.enabled.unwrap_or(true),
                level: c.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            },
            None => CompressionConfig {
                enabled: true,
                level: DEFAULT_COMPRESSION_LEVEL,
            },
        };
        if compression.level > 9 {
            anyhow::bail!("compression.level must be between 0 and 9, got {}.", compression.level);
        }

        let lease = parse_lease(raw.lease)?;
        let upload_retry = parse_retry(raw.upload_retry)?;

        let run_timeout = Duration::from_secs(raw.run_timeout_secs.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS));
        if run_timeout.is_zero() {
            anyhow::bail!("run_timeout_secs must be positive.");
        }

        let restore_options = raw
            .restore_options
            .map(|o| RestoreOptions {
                create_target_database_if_not_exists: o.create_target_database_if_not_exists,
                drop_target_database_if_exists: o.drop_target_database_if_exists,
                require_empty_target: o.require_empty_target,
            })
            .unwrap_or_default();

        Ok(AppConfig {
            sources,
            storage,
            folder_prefix,
            retention,
            compression,
            lease,
            upload_retry,
            run_timeout,
            work_dir: raw.work_dir.unwrap_or_else(std::env::temp_dir),
            restore_options,
            secrets_dir: raw.credentials.and_then(|c| c.secrets_dir),
        })
    }

    /// Looks up a configured source, as a run-level error.
    pub fn source(&self, source_id: &str) -> std::result::Result<&SourceConfig, BackupError> {
        self.sources.get(source_id).ok_or_else(|| {
            BackupError::Config(format!(
                "source '{}' is not defined in config.json (known: {})",
                source_id,
                self.sources.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

fn parse_sources(raw: BTreeMap<String, JsonSourceConfig>) -> Result<BTreeMap<String, SourceConfig>> {
    if raw.is_empty() {
        anyhow::bail!("sources must define at least one database in config.json.");
    }
    raw.into_iter()
        .map(|(id, source)| {
            if !is_valid_identifier(&id) {
                anyhow::bail!(
                    "Invalid source identifier '{}': only letters, digits, '_' and '-' are allowed.",
                    id
                );
            }
            if source.database.trim().is_empty() || source.host.trim().is_empty() {
                anyhow::bail!("source '{}' needs a non-empty host and database.", id);
            }
            let config = SourceConfig {
                id: id.clone(),
                host: source.host,
                port: source.port.unwrap_or(DEFAULT_PG_PORT),
                database: source.database,
                serializable_deferrable: source.serializable_deferrable,
            };
            Ok((id, config))
        })
        .collect()
}

fn parse_storage(raw: JsonStorageConfig) -> Result<StorageConfig> {
    match raw.backend.as_deref().unwrap_or("s3") {
        "s3" => {
            let bucket_name = raw
                .bucket_name
                .filter(|s| !s.is_empty())
                .context("storage.bucket_name must be set in config.json for the s3 backend")?;
            let region = raw
                .region
                .filter(|s| !s.is_empty())
                .context("storage.region must be set in config.json for the s3 backend")?;
            Ok(StorageConfig::S3(S3Config {
                bucket_name,
                region,
                endpoint_url: raw.endpoint_url.filter(|s| !s.is_empty()),
                force_path_style: raw.force_path_style,
            }))
        }
        "local" => {
            let root = raw
                .root
                .context("storage.root must be set in config.json for the local backend")?;
            if root.to_string_lossy().is_empty() {
                anyhow::bail!("storage.root cannot be empty in config.json.");
            }
            Ok(StorageConfig::Local { root })
        }
        other => anyhow::bail!("Unknown storage.backend '{}': expected 's3' or 'local'.", other),
    }
}

fn parse_lease(raw: Option<JsonLeaseConfig>) -> Result<LeaseConfig> {
    let ttl_secs = raw
        .as_ref()
        .and_then(|l| l.ttl_secs)
        .unwrap_or(DEFAULT_LEASE_TTL_SECS);
    let renew_secs = raw
        .as_ref()
        .and_then(|l| l.renew_interval_secs)
        .unwrap_or(ttl_secs / 4);
    if ttl_secs == 0 || ttl_secs > MAX_LEASE_TTL_SECS {
        anyhow::bail!(
            "lease.ttl_secs ({}) must be between 1 and {}.",
            ttl_secs,
            MAX_LEASE_TTL_SECS
        );
    }
    let margin_ok = renew_secs
        .checked_mul(2)
        .is_some_and(|twice| twice < ttl_secs);
    if renew_secs == 0 || !margin_ok {
        anyhow::bail!(
            "lease.renew_interval_secs ({}) must be positive and less than half of lease.ttl_secs ({}).",
            renew_secs,
            ttl_secs
        );
    }
    Ok(LeaseConfig {
        ttl: Duration::from_secs(ttl_secs),
        renew_interval: Duration::from_secs(renew_secs),
    })
}

fn parse_retry(raw: Option<JsonRetryConfig>) -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };
    let policy = RetryPolicy {
        max_attempts: raw.max_attempts.unwrap_or(defaults.max_attempts),
        base_delay: raw
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_delay: raw
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
        max_elapsed: raw
            .max_elapsed_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_elapsed),
        multiplier: raw.multiplier.unwrap_or(defaults.multiplier),
        jitter: raw.jitter.unwrap_or(defaults.jitter),
    };
    if policy.max_attempts == 0 {
        anyhow::bail!("upload_retry.max_attempts must be at least 1.");
    }
    if policy.multiplier < 1.0 {
        anyhow::bail!("upload_retry.multiplier must be >= 1.0.");
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> serde_json::Value {
        json!({
            "sources": { "main": { "host": "db", "database": "app" } },
            "storage": { "backend": "s3", "bucket_name": "backups", "region": "eu-west-1" }
        })
    }

    #[test]
    fn minimal_config_gets_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(minimal()))?;

        let main = config.source("main").unwrap();
        assert_eq!(main.port, 5432);
        assert_eq!(main.database, "app");
        assert!(config.compression.enabled);
        assert_eq!(config.compression.level, 6);
        assert_eq!(config.lease.ttl, Duration::from_secs(3600));
        assert_eq!(config.lease.renew_interval, Duration::from_secs(900));
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.folder_prefix, "");
        assert!(matches!(config.storage, StorageConfig::S3(ref s3) if s3.bucket_name == "backups"));
        Ok(())
    }

    #[test]
    fn full_config_is_parsed() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "sources": { "main": { "host": "db", "port": 6543, "database": "app", "serializable_deferrable": true } },
            "storage": { "backend": "local", "root": "/var/backups", "folder_prefix": "/prod/" },
            "retention": { "max_age_days": 30, "max_count": 7 },
            "compression": { "enabled": false, "level": 1 },
            "lease": { "ttl_secs": 600, "renew_interval_secs": 60 },
            "upload_retry": { "max_attempts": 3, "base_delay_ms": 10 },
            "restore_options": { "create_target_database_if_not_exists": true },
            "credentials": { "secrets_dir": "/run/secrets" }
        })))?;

        assert_eq!(config.sources["main"].port, 6543);
        assert!(config.sources["main"].serializable_deferrable);
        assert_eq!(config.folder_prefix, "prod");
        assert_eq!(config.storage, StorageConfig::Local { root: PathBuf::from("/var/backups") });
        assert_eq!(config.retention.max_count, Some(7));
        assert_eq!(config.retention.max_age, Some(chrono::Duration::days(30)));
        assert!(!config.compression.enabled);
        assert_eq!(config.upload_retry.max_attempts, 3);
        assert_eq!(config.upload_retry.base_delay, Duration::from_millis(10));
        assert!(config.restore_options.create_target_database_if_not_exists);
        assert!(!config.restore_options.drop_target_database_if_exists);
        assert_eq!(config.secrets_dir, Some(PathBuf::from("/run/secrets")));
        Ok(())
    }

    #[test]
    fn rejects_zero_max_count() {
        let mut value = minimal();
        value["retention"] = json!({ "max_count": 0 });
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn rejects_renewal_interval_without_margin() {
        let mut value = minimal();
        value["lease"] = json!({ "ttl_secs": 100, "renew_interval_secs": 50 });
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn rejects_out_of_range_lease_values() {
        let mut value = minimal();
        value["lease"] = json!({ "ttl_secs": u64::MAX });
        assert!(AppConfig::from_raw(raw(value)).is_err());

        let mut value = minimal();
        value["lease"] = json!({ "ttl_secs": 3600, "renew_interval_secs": u64::MAX });
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn rejects_unsafe_source_identifier() {
        let mut value = minimal();
        value["sources"] = json!({ "../main": { "host": "db", "database": "app" } });
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let mut value = minimal();
        value["storage"] = json!({ "backend": "s3", "region": "eu-west-1" });
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn unknown_source_is_a_config_error() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(minimal()))?;
        let err = config.source("missing").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        Ok(())
    }
}
