// dbbackup/src/storage/local.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{ObjectMeta, ObjectStore, Precondition, StoreError};
use crate::utils::checksum::{sha256_file, sha256_hex};

/// Object store rooted in a local directory.
///
/// Writes land in a hidden temp file next to the destination and are renamed
/// into place, so readers never see partial objects. Conditional writes run
/// under an exclusive advisory lock on `<root>/.put.lock`, which serializes
/// them across every process sharing the directory.
pub struct LocalStore {
    root: PathBuf,
}

const PUT_LOCK_FILE: &str = ".put.lock";

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Blocks until this handle holds the root's write lock. Dropping the
    /// returned file releases it.
    async fn lock_root(&self, key: &str) -> Result<File, StoreError> {
        let path = self.root.join(PUT_LOCK_FILE);
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| io_error(&owned_key, e))?;
            file.lock_exclusive().map_err(|e| io_error(&owned_key, e))?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::transient(key, format!("lock task failed: {e}")))?
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(StoreError::permanent(key, "malformed object key"));
        }
        Ok(self.root.join(relative))
    }

    async fn staging_path_for(&self, key: &str, dest: &Path) -> Result<PathBuf, StoreError> {
        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::permanent(key, "object key has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(key, e))?;
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4())))
    }

    fn meta_from_fs(&self, key: &str, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            sha256: None,
            version: None,
        }
    }
}

fn io_error(key: &str, error: std::io::Error) -> StoreError {
    match error.kind() {
        ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => StoreError::permanent(key, error.to_string()),
        _ => StoreError::transient(key, error.to_string()),
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        sha256_hex: Option<&str>,
    ) -> Result<ObjectMeta, StoreError> {
        let dest = self.path_for(key)?;
        let staging = self.staging_path_for(key, &dest).await?;

        tokio::fs::copy(source, &staging)
            .await
            .map_err(|e| io_error(key, e))?;
        let (digest, size) = sha256_file(&staging).await.map_err(|e| io_error(key, e))?;

        if let Some(expected) = sha256_hex {
            if !expected.eq_ignore_ascii_case(&digest) {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(StoreError::permanent(
                    key,
                    format!("integrity token mismatch: expected {expected}, received {digest}"),
                ));
            }
        }

        tokio::fs::rename(&staging, &dest)
            .await
            .map_err(|e| io_error(key, e))?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified: Some(Utc::now()),
            sha256: Some(digest.clone()),
            version: Some(digest),
        })
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, StoreError> {
        let dest = self.path_for(key)?;
        let staging = self.staging_path_for(key, &dest).await?;
        let version = sha256_hex(&body);

        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| io_error(key, e))?;

        let _guard = match self.lock_root(key).await {
            Ok(guard) => guard,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };
        let outcome = match precondition {
            Precondition::None => tokio::fs::rename(&staging, &dest)
                .await
                .map_err(|e| io_error(key, e)),
            Precondition::IfAbsent => {
                let linked = tokio::fs::hard_link(&staging, &dest).await;
                let _ = tokio::fs::remove_file(&staging).await;
                match linked {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Err(StoreError::PreconditionFailed(key.to_string()))
                    }
                    Err(e) => Err(io_error(key, e)),
                }
            }
            Precondition::IfMatch(expected) => match tokio::fs::read(&dest).await {
                Ok(current) if sha256_hex(&current) == expected => tokio::fs::rename(&staging, &dest)
                    .await
                    .map_err(|e| io_error(key, e)),
                Ok(_) => Err(StoreError::PreconditionFailed(key.to_string())),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(StoreError::PreconditionFailed(key.to_string()))
                }
                Err(e) => Err(io_error(key, e)),
            },
        };

        if outcome.is_err() {
            let _ = tokio::fs::remove_file(&staging).await;
        }
        outcome.map(|()| version)
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
        let source = self.path_for(key)?;
        tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| io_error(key, e))
    }

    async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let path = self.path_for(key)?;
        let body = tokio::fs::read(&path).await.map_err(|e| io_error(key, e))?;
        let version = sha256_hex(&body);
        Ok((body, version))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.path_for(key)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(key, e)),
        };
        let (digest, _) = sha256_file(&path).await.map_err(|e| io_error(key, e))?;
        let mut meta = self.meta_from_fs(key, &metadata);
        meta.sha256 = Some(digest.clone());
        meta.version = Some(digest);
        Ok(Some(meta))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| StoreError::transient(prefix, e.to_string()))?;
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| StoreError::transient(&key, e.to_string()))?;
            objects.push(self.meta_from_fs(&key, &metadata));
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let source = self.path_for(from)?;
        let dest = self.path_for(to)?;
        let staging = self.staging_path_for(to, &dest).await?;
        tokio::fs::copy(&source, &staging)
            .await
            .map_err(|e| io_error(from, e))?;
        tokio::fs::rename(&staging, &dest)
            .await
            .map_err(|e| io_error(to, e))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn ensure_container(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root.display().to_string(), e))
    }
}
