//! Error types for stage graphs, volumes and execution.

use thiserror::Error;

/// Errors produced by the pipeline layer.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The predecessor graph has a cycle.
    #[error("cyclic dependency among stages: {stages:?}")]
    CyclicDependency { stages: Vec<String> },

    #[error("duplicate stage id: {0}")]
    DuplicateStage(String),

    #[error("stage not found: {0}")]
    UnknownStage(String),

    #[error("stage {stage} depends on unknown stage {predecessor}")]
    UnknownPredecessor { stage: String, predecessor: String },

    #[error("stage {stage} lists predecessor {predecessor} more than once")]
    DuplicatePredecessor { stage: String, predecessor: String },

    /// The run ended without the stage ever being submitted or skipped.
    #[error("stage {0} was never scheduled")]
    NotScheduled(String),

    /// Writers to shared storage must run on every execution.
    #[error("stage {0} writes a shared volume but has caching enabled")]
    CachedWriter(String),

    /// A volume mount or delete violates the create/use/delete ordering.
    #[error("volume lifecycle violation: {0}")]
    VolumeLifecycle(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume {volume} already deleted")]
    VolumeDeleted { volume: String },

    /// Delete requested while stages still hold the volume.
    #[error("volume {volume} still held by stages {active:?}")]
    VolumeInUse { volume: String, active: Vec<String> },

    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// A predecessor failed, so the stage was never submitted.
    #[error("stage {stage} skipped: predecessor {predecessor} failed")]
    StageDependencyFailed { stage: String, predecessor: String },

    #[error("stage {stage} timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("substrate error: {0}")]
    Substrate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("domain error: {0}")]
    Domain(#[from] tuneflow_core::TuneflowError),
}

/// Convenience result alias.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_displays_stage_names() {
        let err = PipelineError::CyclicDependency {
            stages: vec!["train".to_string(), "eval".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("train"));
        assert!(msg.contains("eval"));
    }

    #[test]
    fn test_volume_in_use_lists_holders() {
        let err = PipelineError::VolumeInUse {
            volume: "run-sdg".to_string(),
            active: vec!["data-processing".to_string()],
        };
        assert!(err.to_string().contains("data-processing"));
    }
}
