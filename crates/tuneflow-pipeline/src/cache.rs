//! Stage result caching keyed by a work fingerprint.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::PipelineResult;
use crate::stage::Stage;

/// SHA-256 over the stage id, its work description and its mounts.
pub fn fingerprint(stage: &Stage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(stage.work.describe().to_string().as_bytes());
    for mount in &stage.resources.mounts {
        hasher.update([0u8]);
        hasher.update(mount.volume.as_bytes());
        hasher.update(mount.mount_path.to_string_lossy().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Remembers fingerprints of stages that completed successfully.
#[async_trait]
pub trait StageCache: Send + Sync {
    async fn contains(&self, fingerprint: &str) -> PipelineResult<bool>;
    async fn record(&self, fingerprint: &str) -> PipelineResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStageCache {
    entries: Mutex<BTreeSet<String>>,
}

impl MemoryStageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StageCache for MemoryStageCache {
    async fn contains(&self, fingerprint: &str) -> PipelineResult<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(fingerprint))
    }

    async fn record(&self, fingerprint: &str) -> PipelineResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(fingerprint.to_string());
        Ok(())
    }
}

/// JSON array of fingerprints persisted across runs.
#[derive(Debug)]
pub struct FileStageCache {
    path: PathBuf,
    entries: tokio::sync::Mutex<Option<BTreeSet<String>>>,
}

impl FileStageCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> PipelineResult<BTreeSet<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StageCache for FileStageCache {
    async fn contains(&self, fingerprint: &str) -> PipelineResult<bool> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().is_some_and(|e| e.contains(fingerprint)))
    }

    async fn record(&self, fingerprint: &str) -> PipelineResult<()> {
        let mut guard = self.entries.lock().await;
        let mut entries = match guard.take() {
            Some(entries) => entries,
            None => self.load().await?,
        };
        entries.insert(fingerprint.to_string());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(&self.path, json).await?;
        *guard = Some(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::MountAccess;

    #[test]
    fn test_fingerprint_changes_with_work_and_mounts() {
        let a = Stage::container("s", "img:1", &["run"], vec![]);
        let b = Stage::container("s", "img:2", &["run"], vec![]);
        let c = Stage::container("s", "img:1", &["run"], vec![]).mount(
            "v",
            "/data",
            MountAccess::ReadOnly,
        );
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[tokio::test]
    async fn test_file_cache_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/stages.json");

        let cache = FileStageCache::new(&path);
        assert!(!cache.contains("abc").await.unwrap());
        cache.record("abc").await.unwrap();

        let reopened = FileStageCache::new(&path);
        assert!(reopened.contains("abc").await.unwrap());
        assert!(!reopened.contains("def").await.unwrap());
    }
}
