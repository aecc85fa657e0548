//! Dependency-respecting stage execution.
//!
//! A stage is submitted once every predecessor succeeded. A failure marks all
//! transitive dependents as skipped while independent branches keep running.
//! Volume deletions are cleanup: they run once every predecessor is terminal,
//! whatever the outcome, and their failure never changes the run status.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use tuneflow_core::obs;

use crate::cache::{fingerprint, StageCache};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::StageGraph;
use crate::stage::{ResolvedMount, Stage, StageContext, StageWork};
use crate::substrate::StageSubstrate;
use crate::volume::VolumeManager;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    /// Fingerprint matched a previous successful run; not re-submitted.
    Cached,
    Failed,
    /// A predecessor failed, so the stage was never submitted.
    Skipped,
    /// Volume deletion failed. Reported only.
    CleanupFailed,
}

impl StageStatus {
    /// Whether dependents may be submitted after this status.
    pub fn unblocks_dependents(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Cached | StageStatus::CleanupFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Outcome of one graph execution. Stage records are in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// First fatal stage failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StageStatus> {
        self.stage(id).map(|s| s.status)
    }

    /// Position of `id` in completion order.
    pub fn completion_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }
}

/// Drives a [`StageGraph`] on a [`StageSubstrate`].
pub struct GraphExecutor {
    substrate: Arc<dyn StageSubstrate>,
    volumes: VolumeManager,
    cache: Option<Arc<dyn StageCache>>,
    max_parallel: usize,
}

impl GraphExecutor {
    pub fn new(substrate: Arc<dyn StageSubstrate>, volumes: VolumeManager) -> Self {
        Self {
            substrate,
            volumes,
            cache: None,
            max_parallel: usize::MAX,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn StageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Upper bound on concurrently running stages.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Validate and execute `graph`.
    ///
    /// Structural problems fail before anything is submitted. Stage failures
    /// are reported in the returned [`RunReport`], not as an `Err`.
    pub async fn run(&self, graph: &StageGraph) -> PipelineResult<RunReport> {
        graph.validate()?;
        let run_id = Uuid::new_v4();
        self.drive(graph, run_id)
            .instrument(obs::run_span(&run_id.to_string()))
            .await
    }

    async fn drive(&self, graph: &StageGraph, run_id: Uuid) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let order = graph.topological_order()?;
        info!(run_id = %run_id, stages = order.len(), "starting run");

        let mut waiting: HashMap<&str, usize> = order
            .iter()
            .map(|s| {
                let distinct: HashSet<&str> = s.predecessors.iter().map(String::as_str).collect();
                (s.id.as_str(), distinct.len())
            })
            .collect();
        let mut ready: VecDeque<&Stage> = order
            .iter()
            .copied()
            .filter(|s| s.predecessors.is_empty())
            .collect();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut blocked_cleanup: HashSet<String> = HashSet::new();
        let mut records: Vec<StageRecord> = Vec::with_capacity(order.len());
        let mut first_failure: Option<String> = None;

        let mut running: JoinSet<StageRecord> = JoinSet::new();
        let run_tag = run_id.to_string();

        loop {
            while running.len() < self.max_parallel {
                let Some(stage) = ready.pop_front() else { break };
                if skipped.contains(&stage.id) {
                    continue;
                }
                let task = StageTask {
                    stage: stage.clone(),
                    run_id: run_tag.clone(),
                    substrate: Arc::clone(&self.substrate),
                    volumes: self.volumes.clone(),
                    cache: self.cache.clone(),
                    blocked: blocked_cleanup.contains(&stage.id),
                };
                running.spawn(task.run().in_current_span());
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let record =
                joined.map_err(|e| PipelineError::Substrate(format!("stage task join error: {e}")))?;

            if record.status == StageStatus::Failed {
                if first_failure.is_none() {
                    first_failure = record.error.clone();
                }
                let mut dependents: Vec<String> =
                    graph.transitive_dependents(&record.id).into_iter().collect();
                dependents.sort();
                for dependent in dependents {
                    let is_cleanup = graph
                        .get(&dependent)
                        .is_some_and(|s| s.deletes_volume().is_some());
                    if is_cleanup {
                        blocked_cleanup.insert(dependent);
                    } else if skipped.insert(dependent.clone()) {
                        obs::emit_stage_skipped(&dependent, &record.id);
                        records.push(StageRecord {
                            id: dependent.clone(),
                            status: StageStatus::Skipped,
                            duration_ms: 0,
                            error: Some(
                                PipelineError::StageDependencyFailed {
                                    stage: dependent.clone(),
                                    predecessor: record.id.clone(),
                                }
                                .to_string(),
                            ),
                            fingerprint: None,
                        });
                    }
                }
            }

            let finished = record.id.clone();
            records.push(record);
            release_dependents(graph, &finished, &mut waiting, &skipped, &mut ready);
        }

        let recorded: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        for stage in &order {
            if recorded.contains(&stage.id) {
                continue;
            }
            let err = PipelineError::NotScheduled(stage.id.clone()).to_string();
            error!(stage = %stage.id, "stage never scheduled");
            if first_failure.is_none() {
                first_failure = Some(err.clone());
            }
            records.push(StageRecord {
                id: stage.id.clone(),
                status: StageStatus::Failed,
                duration_ms: 0,
                error: Some(err),
                fingerprint: None,
            });
        }

        let status = if first_failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            error: first_failure,
            stages: records,
        };
        info!(
            run_id = %run_id,
            status = ?report.status,
            succeeded = report.count(StageStatus::Succeeded),
            cached = report.count(StageStatus::Cached),
            failed = report.count(StageStatus::Failed),
            skipped = report.count(StageStatus::Skipped),
            "run finished"
        );
        Ok(report)
    }
}

/// Decrement waiting counts of `finished`'s dependents and queue those now
/// unblocked. Skipped dependents propagate as finished.
fn release_dependents<'g>(
    graph: &'g StageGraph,
    finished: &str,
    waiting: &mut HashMap<&'g str, usize>,
    skipped: &HashSet<String>,
    ready: &mut VecDeque<&'g Stage>,
) {
    let mut queue = VecDeque::from([finished.to_string()]);
    while let Some(done) = queue.pop_front() {
        for dependent in graph.dependents_of(&done) {
            let Some(count) = waiting.get_mut(dependent.id.as_str()) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }
            if skipped.contains(&dependent.id) {
                queue.push_back(dependent.id.clone());
            } else {
                ready.push_back(dependent);
            }
        }
    }
}

/// Everything one spawned stage needs.
struct StageTask {
    stage: Stage,
    run_id: String,
    substrate: Arc<dyn StageSubstrate>,
    volumes: VolumeManager,
    cache: Option<Arc<dyn StageCache>>,
    /// Cleanup stage running after an upstream failure.
    blocked: bool,
}

impl StageTask {
    async fn run(self) -> StageRecord {
        let start = Instant::now();
        obs::emit_stage_started(&self.stage.id);

        let mut record = match &self.stage.work {
            StageWork::CreateVolume(spec) => match self.volumes.create(spec).await {
                Ok(_) => self.record(StageStatus::Succeeded, None, None),
                Err(e) => self.record(StageStatus::Failed, Some(e.to_string()), None),
            },
            StageWork::DeleteVolume(volume) => self.delete_volume(volume).await,
            _ => self.execute().await,
        };

        record.duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_stage_finished(
            &record.id,
            record.duration_ms,
            record.status != StageStatus::Failed,
        );
        record
    }

    async fn delete_volume(&self, volume: &str) -> StageRecord {
        if self.blocked {
            debug!(stage = %self.stage.id, volume = %volume, "running cleanup after upstream failure");
        }
        match self.volumes.delete(volume).await {
            Ok(()) => self.record(StageStatus::Succeeded, None, None),
            Err(PipelineError::VolumeNotFound(_)) => {
                debug!(volume = %volume, "volume was never created");
                self.record(StageStatus::Succeeded, None, None)
            }
            Err(e) => {
                obs::emit_volume_cleanup_failed(volume, &e);
                self.record(StageStatus::CleanupFailed, Some(e.to_string()), None)
            }
        }
    }

    async fn execute(&self) -> StageRecord {
        let print = self.stage.caching.then(|| fingerprint(&self.stage));

        if let (Some(cache), Some(print)) = (&self.cache, &print) {
            match cache.contains(print).await {
                Ok(true) => {
                    info!(stage = %self.stage.id, "cache hit");
                    return self.record(StageStatus::Cached, None, Some(print.clone()));
                }
                Ok(false) => {}
                Err(e) => warn!(stage = %self.stage.id, error = %e, "cache lookup failed"),
            }
        }

        let mounts = match self.attach_mounts() {
            Ok(mounts) => mounts,
            Err(e) => return self.record(StageStatus::Failed, Some(e.to_string()), print),
        };
        let ctx = StageContext {
            run_id: self.run_id.clone(),
            stage_id: self.stage.id.clone(),
            mounts,
        };

        let outcome = self.substrate.execute(&self.stage, &ctx).await;
        self.release_mounts(&ctx.mounts);

        match outcome {
            Ok(_) => {
                if let (Some(cache), Some(print)) = (&self.cache, &print) {
                    if let Err(e) = cache.record(print).await {
                        warn!(stage = %self.stage.id, error = %e, "cache record failed");
                    }
                }
                self.record(StageStatus::Succeeded, None, print)
            }
            Err(e) => {
                warn!(stage = %self.stage.id, error = %e, "stage failed");
                self.record(StageStatus::Failed, Some(e.to_string()), print)
            }
        }
    }

    fn attach_mounts(&self) -> PipelineResult<Vec<ResolvedMount>> {
        let mut attached = Vec::with_capacity(self.stage.resources.mounts.len());
        for mount in &self.stage.resources.mounts {
            match self
                .volumes
                .attach(&self.stage.id, &mount.volume, &mount.mount_path, mount.access)
            {
                Ok(resolved) => attached.push(resolved),
                Err(e) => {
                    self.release_mounts(&attached);
                    return Err(e);
                }
            }
        }
        Ok(attached)
    }

    fn release_mounts(&self, mounts: &[ResolvedMount]) {
        for mount in mounts {
            self.volumes.release(&self.stage.id, &mount.volume);
        }
    }

    fn record(
        &self,
        status: StageStatus,
        error: Option<String>,
        fingerprint: Option<String>,
    ) -> StageRecord {
        StageRecord {
            id: self.stage.id.clone(),
            status,
            duration_ms: 0,
            error,
            fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::fakes::RecordingSubstrate;
    use crate::volume::fakes::MemoryVolumeBackend;

    fn stage(id: &str) -> Stage {
        Stage::container(id, "img", &["true"], vec![])
    }

    fn executor(substrate: RecordingSubstrate) -> (GraphExecutor, Arc<RecordingSubstrate>) {
        let substrate = Arc::new(substrate);
        let volumes = VolumeManager::new(Arc::new(MemoryVolumeBackend::new()));
        (GraphExecutor::new(substrate.clone(), volumes), substrate)
    }

    #[test]
    fn test_status_unblocks_dependents() {
        assert!(StageStatus::Succeeded.unblocks_dependents());
        assert!(StageStatus::Cached.unblocks_dependents());
        assert!(!StageStatus::Failed.unblocks_dependents());
        assert!(!StageStatus::Skipped.unblocks_dependents());
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_order() {
        let mut graph = StageGraph::new();
        graph.add_stage(stage("c").after(&["b"])).unwrap();
        graph.add_stage(stage("a")).unwrap();
        graph.add_stage(stage("b").after(&["a"])).unwrap();

        let (exec, substrate) = executor(RecordingSubstrate::new());
        let report = exec.run(&graph).await.unwrap();

        assert!(report.success());
        assert_eq!(substrate.started(), vec!["a", "b", "c"]);
        assert_eq!(report.count(StageStatus::Succeeded), 3);
    }

    #[tokio::test]
    async fn test_skip_reason_names_failed_predecessor() {
        let mut graph = StageGraph::new();
        graph.add_stage(stage("a")).unwrap();
        graph.add_stage(stage("b").after(&["a"])).unwrap();

        let (exec, _) = executor(RecordingSubstrate::new().failing("a"));
        let report = exec.run(&graph).await.unwrap();

        let skipped = report.stage("b").unwrap();
        assert_eq!(skipped.status, StageStatus::Skipped);
        assert!(skipped.error.as_deref().unwrap().contains("predecessor a failed"));
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_submission() {
        let mut graph = StageGraph::new();
        graph.add_stage(stage("a").after(&["b"])).unwrap();
        graph.add_stage(stage("b").after(&["a"])).unwrap();

        let (exec, substrate) = executor(RecordingSubstrate::new());
        assert!(matches!(
            exec.run(&graph).await,
            Err(PipelineError::CyclicDependency { .. })
        ));
        assert!(substrate.started().is_empty());
    }

    #[tokio::test]
    async fn test_report_serializes_snake_case_status() {
        let mut graph = StageGraph::new();
        graph.add_stage(stage("a")).unwrap();
        let (exec, _) = executor(RecordingSubstrate::new());
        let report = exec.run(&graph).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["stages"][0]["status"], "succeeded");
        assert!(json.get("error").is_none());
    }
}
