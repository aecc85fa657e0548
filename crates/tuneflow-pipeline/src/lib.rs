//! Stage graph orchestration for Tuneflow runs.
//!
//! Stages form a DAG with explicit predecessors and resource claims. The
//! [`GraphExecutor`] submits each stage once its predecessors succeed, tracks
//! run-scoped volumes through the [`VolumeManager`], and deletes them only
//! after every stage mounting them has finished.

pub mod cache;
pub mod error;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod stage;
pub mod substrate;
pub mod volume;
pub mod workflow;

pub use cache::{fingerprint, FileStageCache, MemoryStageCache, StageCache};
pub use error::{PipelineError, PipelineResult};
pub use executor::{GraphExecutor, RunReport, RunStatus, StageRecord, StageStatus};
pub use graph::StageGraph;
pub use stage::{
    Accelerator, MountAccess, ResolvedMount, ResourceRequirements, Stage, StageContext,
    StageFunction, StagePlan, StageWork, VolumeAccessMode, VolumeMount, VolumeSpec,
};
pub use substrate::{LocalSubstrate, StageOutput, StageSubstrate};
pub use volume::{LocalVolumeBackend, VolumeBackend, VolumeManager, VolumeRef};
pub use workflow::{build_training_workflow, PhaseParams, TrainingParams, WorkflowFunctions};
