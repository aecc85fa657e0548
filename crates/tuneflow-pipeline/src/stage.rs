//! Stage definitions: work, predecessors and resource claims.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How a stage mounts a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MountAccess {
    ReadWrite,
    ReadOnly,
}

/// Volume access mode offered to the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeAccessMode {
    ReadWriteOnce,
    ReadWriteMany,
    ReadOnlyMany,
}

/// Run-scoped shared volume to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub access_mode: VolumeAccessMode,
    pub storage_class: String,
    pub size: String,
}

impl VolumeSpec {
    /// Shared multi-reader/writer volume.
    pub fn shared(
        name: impl Into<String>,
        storage_class: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            access_mode: VolumeAccessMode::ReadWriteMany,
            storage_class: storage_class.into(),
            size: size.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: PathBuf,
    pub access: MountAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Accelerator {
    /// Scheduler resource name, e.g. `nvidia.com/gpu`.
    pub resource: String,
    pub count: u32,
}

/// Resource claims a scheduler must honour for one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub mounts: Vec<VolumeMount>,
    pub accelerator: Option<Accelerator>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// A mount resolved to a location on the executing host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedMount {
    pub volume: String,
    pub mount_path: PathBuf,
    pub host_path: PathBuf,
    pub access: MountAccess,
}

/// What a running stage can see.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub run_id: String,
    pub stage_id: String,
    pub mounts: Vec<ResolvedMount>,
}

impl StageContext {
    /// Map a path under a mount point to the host location backing it.
    /// Paths outside every mount are returned unchanged.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.mounts
            .iter()
            .filter_map(|m| {
                path.strip_prefix(&m.mount_path)
                    .ok()
                    .map(|rest| (m.mount_path.components().count(), m.host_path.join(rest)))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, host)| host)
            .unwrap_or_else(|| path.to_path_buf())
    }

    /// Mount point to host path, for handing to child processes.
    pub fn mount_table(&self) -> BTreeMap<String, String> {
        self.mounts
            .iter()
            .map(|m| {
                (
                    m.mount_path.display().to_string(),
                    m.host_path.display().to_string(),
                )
            })
            .collect()
    }
}

/// In-process unit of work.
#[async_trait]
pub trait StageFunction: Send + Sync {
    /// Stable name, part of the cache fingerprint.
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()>;
}

/// Unit of work a stage performs, dispatched on the variant.
#[derive(Clone)]
pub enum StageWork {
    Container {
        image: String,
        command: Vec<String>,
        args: Vec<String>,
    },
    Function {
        function: Arc<dyn StageFunction>,
        args: Value,
    },
    CreateVolume(VolumeSpec),
    DeleteVolume(String),
}

impl std::fmt::Debug for StageWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl StageWork {
    /// Serializable description of the work.
    pub fn describe(&self) -> Value {
        match self {
            StageWork::Container {
                image,
                command,
                args,
            } => json!({
                "kind": "container",
                "image": image,
                "command": command,
                "args": args,
            }),
            StageWork::Function { function, args } => json!({
                "kind": "function",
                "function": function.name(),
                "args": args,
            }),
            StageWork::CreateVolume(spec) => json!({
                "kind": "create_volume",
                "volume": spec,
            }),
            StageWork::DeleteVolume(name) => json!({
                "kind": "delete_volume",
                "volume": name,
            }),
        }
    }

    /// Whether the work changes state outside the stage.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, StageWork::CreateVolume(_) | StageWork::DeleteVolume(_))
    }
}

/// One node of the workflow graph.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub predecessors: Vec<String>,
    pub resources: ResourceRequirements,
    /// Disabled for any stage with externally visible side effects.
    pub caching: bool,
    pub work: StageWork,
    /// Per-stage execution timeout; `None` means unbounded.
    pub timeout_secs: Option<u64>,
}

impl Stage {
    pub fn new(id: impl Into<String>, work: StageWork) -> Self {
        let caching = !work.has_side_effects();
        Self {
            id: id.into(),
            predecessors: Vec::new(),
            resources: ResourceRequirements::default(),
            caching,
            work,
            timeout_secs: None,
        }
    }

    pub fn container(
        id: impl Into<String>,
        image: impl Into<String>,
        command: &[&str],
        args: Vec<String>,
    ) -> Self {
        Self::new(
            id,
            StageWork::Container {
                image: image.into(),
                command: command.iter().map(|s| s.to_string()).collect(),
                args,
            },
        )
    }

    pub fn function(id: impl Into<String>, function: Arc<dyn StageFunction>, args: Value) -> Self {
        Self::new(id, StageWork::Function { function, args })
    }

    pub fn create_volume(id: impl Into<String>, spec: VolumeSpec) -> Self {
        Self::new(id, StageWork::CreateVolume(spec))
    }

    pub fn delete_volume(id: impl Into<String>, volume: impl Into<String>) -> Self {
        Self::new(id, StageWork::DeleteVolume(volume.into()))
    }

    /// Add predecessors.
    pub fn after<S: AsRef<str>>(mut self, predecessors: &[S]) -> Self {
        for p in predecessors {
            let p = p.as_ref().to_string();
            if !self.predecessors.contains(&p) {
                self.predecessors.push(p);
            }
        }
        self
    }

    pub fn mount(
        mut self,
        volume: impl Into<String>,
        mount_path: impl Into<PathBuf>,
        access: MountAccess,
    ) -> Self {
        if access == MountAccess::ReadWrite {
            self.caching = false;
        }
        self.resources.mounts.push(VolumeMount {
            volume: volume.into(),
            mount_path: mount_path.into(),
            access,
        });
        self
    }

    pub fn accelerator(mut self, resource: impl Into<String>, count: u32) -> Self {
        self.resources.accelerator = Some(Accelerator {
            resource: resource.into(),
            count,
        });
        self
    }

    pub fn cpu(mut self, cpu: impl Into<String>) -> Self {
        self.resources.cpu = Some(cpu.into());
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.resources.memory = Some(memory.into());
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.caching = enabled;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Whether the stage writes to a shared volume.
    pub fn writes_shared_storage(&self) -> bool {
        self.resources
            .mounts
            .iter()
            .any(|m| m.access == MountAccess::ReadWrite)
    }

    /// Whether this stage mounts `volume`, and how.
    pub fn mount_of(&self, volume: &str) -> Option<&VolumeMount> {
        self.resources.mounts.iter().find(|m| m.volume == volume)
    }

    /// Volume created by this stage, if any.
    pub fn creates_volume(&self) -> Option<&str> {
        match &self.work {
            StageWork::CreateVolume(spec) => Some(&spec.name),
            _ => None,
        }
    }

    /// Volume deleted by this stage, if any.
    pub fn deletes_volume(&self) -> Option<&str> {
        match &self.work {
            StageWork::DeleteVolume(name) => Some(name),
            _ => None,
        }
    }
}

/// Scheduler-facing view of a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagePlan {
    pub id: String,
    /// Topological level; stages on the same level are independent.
    pub level: usize,
    pub predecessors: Vec<String>,
    pub resources: ResourceRequirements,
    pub caching: bool,
    pub work: Value,
}
