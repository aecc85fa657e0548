//! Run-scoped shared volumes.
//!
//! A volume is created by one stage, mounted by any number of later stages,
//! and deleted by a cleanup stage. The manager tracks which stages hold a
//! volume and refuses deletion while any of them is still running.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::stage::{MountAccess, ResolvedMount, VolumeSpec};

/// Storage provider behind the manager.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Provision storage for `spec`, returning where it is reachable.
    async fn provision(&self, spec: &VolumeSpec) -> PipelineResult<PathBuf>;

    /// Release storage previously provisioned for `name`.
    async fn remove(&self, name: &str) -> PipelineResult<()>;
}

/// Directories under a local root, one per volume.
#[derive(Debug, Clone)]
pub struct LocalVolumeBackend {
    root: PathBuf,
}

impl LocalVolumeBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl VolumeBackend for LocalVolumeBackend {
    async fn provision(&self, spec: &VolumeSpec) -> PipelineResult<PathBuf> {
        let path = self.root.join(&spec.name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn remove(&self, name: &str) -> PipelineResult<()> {
        let path = self.root.join(name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to a provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub name: String,
    pub host_path: PathBuf,
}

#[derive(Debug)]
struct VolumeEntry {
    spec: VolumeSpec,
    host_path: PathBuf,
    holders: HashSet<String>,
    deleted: bool,
}

/// Reference-counting volume registry for one run.
#[derive(Clone)]
pub struct VolumeManager {
    backend: Arc<dyn VolumeBackend>,
    volumes: Arc<Mutex<BTreeMap<String, VolumeEntry>>>,
}

impl VolumeManager {
    pub fn new(backend: Arc<dyn VolumeBackend>) -> Self {
        Self {
            backend,
            volumes: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Provision a volume. Creating a live volume again returns the
    /// existing handle.
    pub async fn create(&self, spec: &VolumeSpec) -> PipelineResult<VolumeRef> {
        {
            let volumes = self.lock();
            if let Some(entry) = volumes.get(&spec.name) {
                if !entry.deleted {
                    return Ok(VolumeRef {
                        name: spec.name.clone(),
                        host_path: entry.host_path.clone(),
                    });
                }
            }
        }

        let host_path = self.backend.provision(spec).await?;
        info!(volume = %spec.name, size = %spec.size, storage_class = %spec.storage_class, "volume created");

        self.lock().insert(
            spec.name.clone(),
            VolumeEntry {
                spec: spec.clone(),
                host_path: host_path.clone(),
                holders: HashSet::new(),
                deleted: false,
            },
        );
        Ok(VolumeRef {
            name: spec.name.clone(),
            host_path,
        })
    }

    /// Register `stage` as a holder of `volume` and resolve the mount.
    pub fn attach(
        &self,
        stage: &str,
        volume: &str,
        mount_path: &Path,
        access: MountAccess,
    ) -> PipelineResult<ResolvedMount> {
        let mut volumes = self.lock();
        let entry = volumes
            .get_mut(volume)
            .ok_or_else(|| PipelineError::VolumeNotFound(volume.to_string()))?;
        if entry.deleted {
            return Err(PipelineError::VolumeDeleted {
                volume: volume.to_string(),
            });
        }
        entry.holders.insert(stage.to_string());
        debug!(volume = %volume, stage = %stage, holders = entry.holders.len(), "volume attached");

        Ok(ResolvedMount {
            volume: volume.to_string(),
            mount_path: mount_path.to_path_buf(),
            host_path: entry.host_path.clone(),
            access,
        })
    }

    /// Drop `stage`'s hold on `volume`. Unknown pairs are ignored.
    pub fn release(&self, stage: &str, volume: &str) {
        if let Some(entry) = self.lock().get_mut(volume) {
            entry.holders.remove(stage);
        }
    }

    /// Delete a volume once nothing holds it.
    pub async fn delete(&self, volume: &str) -> PipelineResult<()> {
        {
            let volumes = self.lock();
            let entry = volumes
                .get(volume)
                .ok_or_else(|| PipelineError::VolumeNotFound(volume.to_string()))?;
            if entry.deleted {
                return Ok(());
            }
            if !entry.holders.is_empty() {
                let mut active: Vec<String> = entry.holders.iter().cloned().collect();
                active.sort();
                return Err(PipelineError::VolumeInUse {
                    volume: volume.to_string(),
                    active,
                });
            }
        }

        self.backend.remove(volume).await?;
        if let Some(entry) = self.lock().get_mut(volume) {
            entry.deleted = true;
        }
        info!(volume = %volume, "volume deleted");
        Ok(())
    }

    /// Number of stages currently holding `volume`.
    pub fn ref_count(&self, volume: &str) -> usize {
        self.lock().get(volume).map_or(0, |e| e.holders.len())
    }

    pub fn is_live(&self, volume: &str) -> bool {
        self.lock().get(volume).is_some_and(|e| !e.deleted)
    }

    pub fn spec(&self, volume: &str) -> Option<VolumeSpec> {
        self.lock().get(volume).map(|e| e.spec.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, VolumeEntry>> {
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory fakes for testing.
pub mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records provision/remove calls; removal can be made to fail.
    #[derive(Default)]
    pub struct MemoryVolumeBackend {
        pub provisioned: Mutex<Vec<String>>,
        pub removed: Mutex<Vec<String>>,
        fail_remove: AtomicBool,
    }

    impl MemoryVolumeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_remove(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }

        pub fn removed(&self) -> Vec<String> {
            self.removed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn provisioned(&self) -> Vec<String> {
            self.provisioned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl VolumeBackend for MemoryVolumeBackend {
        async fn provision(&self, spec: &VolumeSpec) -> PipelineResult<PathBuf> {
            self.provisioned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(spec.name.clone());
            Ok(PathBuf::from("/volumes").join(&spec.name))
        }

        async fn remove(&self, name: &str) -> PipelineResult<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(PipelineError::Substrate(format!(
                    "backend refused to remove {}",
                    name
                )));
            }
            self.removed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(name.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::MemoryVolumeBackend;
    use super::*;

    fn spec() -> VolumeSpec {
        VolumeSpec::shared("run-sdg", "standard", "10Gi")
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let backend = Arc::new(MemoryVolumeBackend::new());
        let manager = VolumeManager::new(backend.clone());
        let a = manager.create(&spec()).await.unwrap();
        let b = manager.create(&spec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.provisioned(), vec!["run-sdg"]);
    }

    #[tokio::test]
    async fn test_delete_refused_while_held() {
        let backend = Arc::new(MemoryVolumeBackend::new());
        let manager = VolumeManager::new(backend.clone());
        manager.create(&spec()).await.unwrap();

        let mount = manager
            .attach("sdg", "run-sdg", Path::new("/data"), MountAccess::ReadWrite)
            .unwrap();
        assert_eq!(mount.host_path, PathBuf::from("/volumes/run-sdg"));
        manager
            .attach("export", "run-sdg", Path::new("/data"), MountAccess::ReadOnly)
            .unwrap();
        assert_eq!(manager.ref_count("run-sdg"), 2);

        manager.release("sdg", "run-sdg");
        match manager.delete("run-sdg").await {
            Err(PipelineError::VolumeInUse { active, .. }) => assert_eq!(active, vec!["export"]),
            other => panic!("expected VolumeInUse, got {:?}", other),
        }

        manager.release("export", "run-sdg");
        manager.delete("run-sdg").await.unwrap();
        assert!(!manager.is_live("run-sdg"));
        assert_eq!(backend.removed(), vec!["run-sdg"]);
    }

    #[tokio::test]
    async fn test_attach_after_delete_fails() {
        let manager = VolumeManager::new(Arc::new(MemoryVolumeBackend::new()));
        manager.create(&spec()).await.unwrap();
        manager.delete("run-sdg").await.unwrap();
        assert!(matches!(
            manager.attach("late", "run-sdg", Path::new("/data"), MountAccess::ReadOnly),
            Err(PipelineError::VolumeDeleted { .. })
        ));
        assert!(matches!(
            manager.attach("x", "ghost", Path::new("/data"), MountAccess::ReadOnly),
            Err(PipelineError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_volume_live() {
        let backend = Arc::new(MemoryVolumeBackend::new());
        backend.fail_remove(true);
        let manager = VolumeManager::new(backend.clone());
        manager.create(&spec()).await.unwrap();
        assert!(manager.delete("run-sdg").await.is_err());
        assert!(manager.is_live("run-sdg"));
    }

    #[tokio::test]
    async fn test_local_backend_creates_and_removes_directories() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalVolumeBackend::new(root.path());
        let path = backend.provision(&spec()).await.unwrap();
        assert!(path.is_dir());
        backend.remove("run-sdg").await.unwrap();
        assert!(!path.exists());
        backend.remove("run-sdg").await.unwrap();
    }
}
