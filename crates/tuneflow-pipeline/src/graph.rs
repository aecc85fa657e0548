//! Stage dependency graph, validation and execution ordering.
//!
//! Stages are nodes of a directed acyclic graph. An edge `A → B` means
//! "B lists A as a predecessor" and A must succeed before B is submitted.
//! Ordering uses Kahn's algorithm seeded in insertion order so plans are
//! deterministic; levels group stages that may run concurrently.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{PipelineError, PipelineResult};
use crate::stage::{MountAccess, Stage, StagePlan};

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. Ids must be unique; predecessors are checked by
    /// [`validate`](Self::validate) so stages may be added in any order.
    pub fn add_stage(&mut self, stage: Stage) -> PipelineResult<()> {
        if self.index.contains_key(&stage.id) {
            return Err(PipelineError::DuplicateStage(stage.id));
        }
        self.index.insert(stage.id.clone(), self.stages.len());
        self.stages.push(stage);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Stage> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Stages in insertion order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Direct dependents of `id`, in insertion order.
    pub fn dependents_of(&self, id: &str) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.predecessors.iter().any(|p| p == id))
            .collect()
    }

    /// Every stage reachable downstream of `id`.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if seen.insert(dependent.id.clone()) {
                    queue.push_back(dependent.id.clone());
                }
            }
        }
        seen
    }

    /// Every stage `id` transitively depends on.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(stage) = self.get(&current) {
                for p in &stage.predecessors {
                    if seen.insert(p.clone()) {
                        queue.push_back(p.clone());
                    }
                }
            }
        }
        seen
    }

    /// Stages in dependency order (predecessors first).
    ///
    /// Fails with [`PipelineError::CyclicDependency`] naming the stages left
    /// unordered when the graph has a cycle.
    pub fn topological_order(&self) -> PipelineResult<Vec<&Stage>> {
        self.check_predecessors()?;

        let mut in_degree: Vec<usize> = self.stages.iter().map(|s| s.predecessors.len()).collect();
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, stage) in self.stages.iter().enumerate() {
            for p in &stage.predecessors {
                downstream[self.index[p]].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..self.stages.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.stages.len());

        while let Some(i) = queue.pop_front() {
            sorted.push(i);
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if sorted.len() != self.stages.len() {
            let stages = (0..self.stages.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.stages[i].id.clone())
                .collect();
            return Err(PipelineError::CyclicDependency { stages });
        }

        Ok(sorted.into_iter().map(|i| &self.stages[i]).collect())
    }

    /// Stages grouped by topological level. Level 0 has no predecessors;
    /// every other stage sits one level below its deepest predecessor.
    pub fn levels(&self) -> PipelineResult<Vec<Vec<&Stage>>> {
        let order = self.topological_order()?;
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&Stage>> = Vec::new();

        for stage in order {
            let level = stage
                .predecessors
                .iter()
                .map(|p| level_of[p.as_str()] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(stage.id.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(stage);
        }
        Ok(levels)
    }

    /// Scheduler-facing plan in topological order.
    pub fn plan(&self) -> PipelineResult<Vec<StagePlan>> {
        let levels = self.levels()?;
        let mut plan = Vec::with_capacity(self.stages.len());
        for (level, stages) in levels.into_iter().enumerate() {
            for stage in stages {
                plan.push(StagePlan {
                    id: stage.id.clone(),
                    level,
                    predecessors: stage.predecessors.clone(),
                    resources: stage.resources.clone(),
                    caching: stage.caching,
                    work: stage.work.describe(),
                });
            }
        }
        Ok(plan)
    }

    /// Full structural check.
    ///
    /// - predecessors exist, are listed once, and the graph is acyclic
    /// - stages writing a shared volume have caching disabled
    /// - every mounted volume is created by an ancestor
    /// - a read-only mount has an ancestor that mounts the volume read-write
    /// - a volume delete depends on its creator and on every stage mounting it
    pub fn validate(&self) -> PipelineResult<()> {
        self.topological_order()?;

        let mut ancestors: HashMap<&str, HashSet<String>> = HashMap::new();
        for stage in &self.stages {
            ancestors.insert(stage.id.as_str(), self.ancestors(&stage.id));
        }

        let creator_of: HashMap<&str, &str> = self
            .stages
            .iter()
            .filter_map(|s| s.creates_volume().map(|v| (v, s.id.as_str())))
            .collect();

        for stage in &self.stages {
            if stage.caching && stage.writes_shared_storage() {
                return Err(PipelineError::CachedWriter(stage.id.clone()));
            }
            let upstream = &ancestors[stage.id.as_str()];

            for mount in &stage.resources.mounts {
                let creator = creator_of.get(mount.volume.as_str()).ok_or_else(|| {
                    PipelineError::VolumeLifecycle(format!(
                        "stage {} mounts volume {} which no stage creates",
                        stage.id, mount.volume
                    ))
                })?;
                if !upstream.contains(*creator) {
                    return Err(PipelineError::VolumeLifecycle(format!(
                        "stage {} mounts volume {} before {} creates it",
                        stage.id, mount.volume, creator
                    )));
                }

                if mount.access == MountAccess::ReadOnly {
                    let has_writer = upstream.iter().any(|a| {
                        self.get(a)
                            .and_then(|s| s.mount_of(&mount.volume))
                            .is_some_and(|m| m.access == MountAccess::ReadWrite)
                    });
                    if !has_writer {
                        return Err(PipelineError::VolumeLifecycle(format!(
                            "stage {} reads volume {} that no predecessor writes",
                            stage.id, mount.volume
                        )));
                    }
                }
            }

            if let Some(volume) = stage.deletes_volume() {
                let creator = creator_of.get(volume).ok_or_else(|| {
                    PipelineError::VolumeLifecycle(format!(
                        "stage {} deletes volume {} which no stage creates",
                        stage.id, volume
                    ))
                })?;
                if !upstream.contains(*creator) {
                    return Err(PipelineError::VolumeLifecycle(format!(
                        "stage {} deletes volume {} before {} creates it",
                        stage.id, volume, creator
                    )));
                }
                for holder in self.stages.iter().filter(|s| s.mount_of(volume).is_some()) {
                    if !upstream.contains(&holder.id) {
                        return Err(PipelineError::VolumeLifecycle(format!(
                            "stage {} deletes volume {} without waiting for {}",
                            stage.id, volume, holder.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Ids of every stage mounting `volume`, in insertion order.
    pub fn holders_of(&self, volume: &str) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.mount_of(volume).is_some())
            .map(|s| s.id.clone())
            .collect()
    }

    fn check_predecessors(&self) -> PipelineResult<()> {
        for stage in &self.stages {
            let mut seen = HashSet::new();
            for p in &stage.predecessors {
                if !self.index.contains_key(p) {
                    return Err(PipelineError::UnknownPredecessor {
                        stage: stage.id.clone(),
                        predecessor: p.clone(),
                    });
                }
                if !seen.insert(p.as_str()) {
                    return Err(PipelineError::DuplicatePredecessor {
                        stage: stage.id.clone(),
                        predecessor: p.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
