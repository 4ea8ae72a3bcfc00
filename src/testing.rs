//! Fakes for the storage and database seams, shared by unit tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::backup::db_dump::{ConnectionInfo, DatabaseClient};
use crate::config::{RestoreOptions, SourceConfig};
use crate::credentials::DatabaseCredentials;
use crate::errors::BackupError;
use crate::storage::{LocalStore, ObjectMeta, ObjectStore, Precondition, StoreError};

pub fn connection(database: &str) -> ConnectionInfo {
    let source = SourceConfig {
        id: "main".into(),
        host: "localhost".into(),
        port: 5432,
        database: database.into(),
        serializable_deferrable: false,
    };
    ConnectionInfo::new(
        &source,
        DatabaseCredentials {
            username: "tester".into(),
            password: "pw".into(),
        },
    )
}

/// A database whose dump is a fixed byte string and whose restores are recorded.
pub struct FakeDatabase {
    payload: Vec<u8>,
    fail_dump: AtomicBool,
    dump_delay: Mutex<Duration>,
    dumps: AtomicU32,
    prepared: AtomicU32,
    restored: Mutex<Vec<Vec<u8>>>,
}

impl FakeDatabase {
    pub fn new(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            fail_dump: AtomicBool::new(false),
            dump_delay: Mutex::new(Duration::ZERO),
            dumps: AtomicU32::new(0),
            prepared: AtomicU32::new(0),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_dumps(&self) {
        self.fail_dump.store(true, Ordering::SeqCst);
    }

    pub fn slow_dumps(&self, delay: Duration) {
        *self.dump_delay.lock().unwrap() = delay;
    }

    pub fn dump_count(&self) -> u32 {
        self.dumps.load(Ordering::SeqCst)
    }

    /// Any call that may write to the target: preparation or replay.
    pub fn target_writes(&self) -> usize {
        self.prepared.load(Ordering::SeqCst) as usize + self.restored.lock().unwrap().len()
    }

    pub fn restored(&self) -> Vec<Vec<u8>> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseClient for FakeDatabase {
    async fn dump(&self, _conn: &ConnectionInfo, dest: &Path) -> Result<u64, BackupError> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        let delay = *self.dump_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(BackupError::Dump("connection refused".into()));
        }
        tokio::fs::write(dest, &self.payload).await?;
        Ok(self.payload.len() as u64)
    }

    async fn prepare_target(&self, _conn: &ConnectionInfo, _options: &RestoreOptions) -> Result<(), BackupError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore(&self, _conn: &ConnectionInfo, source: &Path) -> Result<(), BackupError> {
        let bytes = tokio::fs::read(source).await?;
        self.restored.lock().unwrap().push(bytes);
        Ok(())
    }
}

/// A local store that can fail uploads, corrupt downloads and count calls.
pub struct FaultyStore {
    inner: LocalStore,
    root: PathBuf,
    put_file_calls: AtomicU32,
    failing_put_files: AtomicU32,
    corrupt_downloads: AtomicBool,
    failing_delete_prefix: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: LocalStore::new(root.clone()),
            root,
            put_file_calls: AtomicU32::new(0),
            failing_put_files: AtomicU32::new(0),
            corrupt_downloads: AtomicBool::new(false),
            failing_delete_prefix: Mutex::new(None),
        }
    }

    /// The next `n` file uploads leave a truncated object behind and fail transiently.
    pub fn fail_next_put_files(&self, n: u32) {
        self.failing_put_files.store(n, Ordering::SeqCst);
    }

    pub fn corrupt_downloads(&self, on: bool) {
        self.corrupt_downloads.store(on, Ordering::SeqCst);
    }

    /// Deletes of keys under `prefix` fail permanently until cleared with `None`.
    pub fn fail_deletes_under(&self, prefix: Option<&str>) {
        *self.failing_delete_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn put_file_calls(&self) -> u32 {
        self.put_file_calls.load(Ordering::SeqCst)
    }

    /// Every stored key under `prefix`, read straight from disk.
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let base = self.root.join(prefix);
        walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect()
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_file(&self, key: &str, source: &Path, sha256_hex: Option<&str>) -> Result<ObjectMeta, StoreError> {
        self.put_file_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_put_files
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let bytes = std::fs::read(source).map_err(|e| StoreError::permanent(key, e.to_string()))?;
            let half = bytes[..bytes.len() / 2].to_vec();
            self.inner.put_bytes(key, half, Precondition::None).await?;
            return Err(StoreError::transient(key, "connection reset by peer"));
        }
        self.inner.put_file(key, source, sha256_hex).await
    }

    async fn put_bytes(&self, key: &str, body: Vec<u8>, precondition: Precondition) -> Result<String, StoreError> {
        self.inner.put_bytes(key, body, precondition).await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
        let size = self.inner.get_to_file(key, dest).await?;
        if self.corrupt_downloads.load(Ordering::SeqCst) {
            let mut bytes = std::fs::read(dest).map_err(|e| StoreError::permanent(key, e.to_string()))?;
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            }
            std::fs::write(dest, bytes).map_err(|e| StoreError::permanent(key, e.to_string()))?;
        }
        Ok(size)
    }

    async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        self.inner.get_bytes(key).await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let refused = self
            .failing_delete_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix));
        if refused {
            return Err(StoreError::permanent(key, "access denied"));
        }
        self.inner.delete(key).await
    }

    async fn ensure_container(&self) -> Result<(), StoreError> {
        self.inner.ensure_container().await
    }
}
