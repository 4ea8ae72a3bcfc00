// dbbackup/src/backup/artifact.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::errors::BackupError;
use crate::storage::{ObjectStore, Precondition, StoreError, join_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Complete,
    Failed,
    Deleted,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Complete => "complete",
            ArtifactStatus::Failed => "failed",
            ArtifactStatus::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// One snapshot of one source, as recorded in its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub name: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    pub size_bytes: Option<u64>,
    /// Hex SHA-256 of the packaged payload.
    pub sha256: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    pub staging_key: Option<String>,
    pub payload_key: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl BackupArtifact {
    pub fn pending(source_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            name: artifact_name(source_id, created_at),
            source_id: source_id.to_string(),
            created_at,
            status: ArtifactStatus::Pending,
            size_bytes: None,
            sha256: None,
            compressed: false,
            staging_key: None,
            payload_key: None,
            completed_at: None,
            deleted_at: None,
            failure: None,
        }
    }
}

/// `<source>-<UTC timestamp>`; lexical order equals creation order within a source.
pub fn artifact_name(source_id: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", source_id, created_at.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Which artifact a restore or verify refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Latest,
    Named(String),
}

impl FromStr for ArtifactRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("artifact reference cannot be empty".to_string());
        }
        if s.eq_ignore_ascii_case("latest") {
            return Ok(ArtifactRef::Latest);
        }
        if s.contains('/') || s.contains("..") {
            return Err(format!("invalid artifact name: {}", s));
        }
        Ok(ArtifactRef::Named(s.to_string()))
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactRef::Latest => f.write_str("latest"),
            ArtifactRef::Named(name) => f.write_str(name),
        }
    }
}

/// Object keys for one source under the configured folder prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(folder_prefix: &str, source_id: &str) -> Self {
        Self {
            root: join_key(&[folder_prefix, source_id]),
        }
    }

    pub fn lock_key(&self) -> String {
        join_key(&[&self.root, "lock.json"])
    }

    pub fn manifest_prefix(&self) -> String {
        format!("{}/", join_key(&[&self.root, "manifests"]))
    }

    pub fn manifest_key(&self, name: &str) -> String {
        format!("{}{}.json", self.manifest_prefix(), name)
    }

    /// Content-addressed, so a re-attempted upload of the same bytes reuses it.
    pub fn staging_key(&self, sha256: &str, extension: &str) -> String {
        join_key(&[&self.root, "staging", &format!("{}{}", sha256, extension)])
    }

    pub fn payload_key(&self, name: &str, extension: &str) -> String {
        join_key(&[&self.root, "artifacts", &format!("{}{}", name, extension)])
    }
}

/// Manifest records in object storage. Always read fresh; nothing is cached.
#[derive(Clone)]
pub struct ArtifactIndex {
    store: Arc<dyn ObjectStore>,
    layout: RemoteLayout,
}

impl ArtifactIndex {
    pub fn new(store: Arc<dyn ObjectStore>, layout: RemoteLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Records a new `pending` artifact; fails if the name is already taken.
    pub async fn create_pending(&self, artifact: &BackupArtifact) -> Result<(), BackupError> {
        let key = self.layout.manifest_key(&artifact.name);
        let body = serde_json::to_vec_pretty(artifact)
            .map_err(|e| BackupError::Package(format!("cannot serialize manifest: {}", e)))?;
        self.store
            .put_bytes(&key, body, Precondition::IfAbsent)
            .await?;
        Ok(())
    }

    pub async fn save(&self, artifact: &BackupArtifact) -> Result<(), BackupError> {
        let key = self.layout.manifest_key(&artifact.name);
        let body = serde_json::to_vec_pretty(artifact)
            .map_err(|e| BackupError::Package(format!("cannot serialize manifest: {}", e)))?;
        self.store.put_bytes(&key, body, Precondition::None).await?;
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<BackupArtifact, BackupError> {
        let key = self.layout.manifest_key(name);
        let (body, _) = match self.store.get_bytes(&key).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => {
                return Err(BackupError::ArtifactNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map_err(|e| BackupError::ArtifactNotFound(format!("{} (unreadable manifest: {})", name, e)))
    }

    /// Drops a manifest for good; its artifact's bytes must already be gone.
    pub async fn remove(&self, name: &str) -> Result<(), BackupError> {
        self.store.delete(&self.layout.manifest_key(name)).await?;
        Ok(())
    }

    /// Every artifact of the source regardless of status, newest first.
    pub async fn list(&self) -> Result<Vec<BackupArtifact>, BackupError> {
        let objects = self.store.list(&self.layout.manifest_prefix()).await?;
        let mut artifacts = Vec::with_capacity(objects.len());
        for object in objects {
            if !object.key.ends_with(".json") {
                continue;
            }
            let body = match self.store.get_bytes(&object.key).await {
                Ok((body, _)) => body,
                // Deleted between list and get.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<BackupArtifact>(&body) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!(key = %object.key, error = %e, "skipping unreadable manifest"),
            }
        }
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(artifacts)
    }

    /// Only `complete` artifacts, newest first. This is all readers may see.
    pub async fn list_complete(&self) -> Result<Vec<BackupArtifact>, BackupError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.status == ArtifactStatus::Complete)
            .collect())
    }

    pub async fn resolve(&self, reference: &ArtifactRef) -> Result<BackupArtifact, BackupError> {
        match reference {
            ArtifactRef::Latest => self
                .list_complete()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| BackupError::ArtifactNotFound("latest (no complete artifacts)".to_string())),
            ArtifactRef::Named(name) => self.load(name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn names_sort_by_creation_time() {
        let early = artifact_name("main", at(1));
        let late = artifact_name("main", at(13));
        assert_eq!(early, "main-20240301T010000000Z");
        assert!(early < late);
    }

    #[test]
    fn layout_keeps_sources_apart() {
        let layout = RemoteLayout::new("backups", "main");
        assert_eq!(layout.lock_key(), "backups/main/lock.json");
        assert_eq!(layout.manifest_key("n"), "backups/main/manifests/n.json");
        assert_eq!(layout.payload_key("n", ".dump.gz"), "backups/main/artifacts/n.dump.gz");
        assert_eq!(layout.staging_key("abc", ".dump"), "backups/main/staging/abc.dump");

        let unprefixed = RemoteLayout::new("", "main");
        assert_eq!(unprefixed.lock_key(), "main/lock.json");
    }

    #[test]
    fn parses_artifact_refs() {
        assert_eq!("latest".parse::<ArtifactRef>().unwrap(), ArtifactRef::Latest);
        assert_eq!(
            "main-20240301T010000000Z".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Named("main-20240301T010000000Z".into())
        );
        assert!("../x".parse::<ArtifactRef>().is_err());
        assert!("".parse::<ArtifactRef>().is_err());
    }

    #[tokio::test]
    async fn index_round_trips_and_hides_incomplete_artifacts() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().to_path_buf()));
        let index = ArtifactIndex::new(store, RemoteLayout::new("", "main"));

        let mut old = BackupArtifact::pending("main", at(1));
        index.create_pending(&old).await.unwrap();
        old.status = ArtifactStatus::Complete;
        index.save(&old).await.unwrap();

        let pending = BackupArtifact::pending("main", at(2));
        index.create_pending(&pending).await.unwrap();

        let duplicate = index.create_pending(&pending).await.unwrap_err();
        assert!(matches!(duplicate, BackupError::Storage(StoreError::PreconditionFailed(_))));

        let all = index.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, pending.name);

        let complete = index.list_complete().await.unwrap();
        assert_eq!(complete, vec![old.clone()]);
        assert_eq!(index.resolve(&ArtifactRef::Latest).await.unwrap().name, old.name);

        let missing = index.load("main-nope").await.unwrap_err();
        assert!(matches!(missing, BackupError::ArtifactNotFound(_)));
    }
}
