//! Execution substrates: where stage work actually runs.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::stage::{MountAccess, Stage, StageContext, StageWork};

/// Result of one successful stage execution.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs container and function work. Volume work is handled by the executor.
#[async_trait]
pub trait StageSubstrate: Send + Sync {
    async fn execute(&self, stage: &Stage, ctx: &StageContext) -> PipelineResult<StageOutput>;
}

/// Runs work on the local host.
///
/// Container work runs the command directly, or through a container runtime
/// (`docker`, `podman`) with every mount bound into the container when one is
/// configured. Children see `TUNEFLOW_RUN_ID`, `TUNEFLOW_STAGE` and a JSON
/// mount table in `TUNEFLOW_MOUNTS`.
#[derive(Debug, Clone, Default)]
pub struct LocalSubstrate {
    container_runtime: Option<String>,
}

impl LocalSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.container_runtime = Some(runtime.into());
        self
    }

    fn command_line(
        &self,
        image: &str,
        command: &[String],
        args: &[String],
        ctx: &StageContext,
    ) -> Vec<String> {
        let mut line = Vec::new();
        if let Some(runtime) = &self.container_runtime {
            line.push(runtime.clone());
            line.push("run".to_string());
            line.push("--rm".to_string());
            for m in &ctx.mounts {
                let suffix = match m.access {
                    MountAccess::ReadOnly => ":ro",
                    MountAccess::ReadWrite => "",
                };
                line.push("-v".to_string());
                line.push(format!(
                    "{}:{}{}",
                    m.host_path.display(),
                    m.mount_path.display(),
                    suffix
                ));
            }
            line.push(image.to_string());
        }
        line.extend(command.iter().cloned());
        line.extend(args.iter().cloned());
        line
    }

    async fn run_process(
        &self,
        stage: &Stage,
        line: Vec<String>,
        ctx: &StageContext,
    ) -> PipelineResult<StageOutput> {
        let start = Instant::now();
        let (exe, rest) = line.split_first().ok_or_else(|| PipelineError::StageFailed {
            stage: stage.id.clone(),
            reason: "empty command".to_string(),
        })?;

        let mounts = serde_json::to_string(&ctx.mount_table())?;
        let child = Command::new(exe)
            .args(rest)
            .env("TUNEFLOW_RUN_ID", &ctx.run_id)
            .env("TUNEFLOW_STAGE", &ctx.stage_id)
            .env("TUNEFLOW_MOUNTS", mounts)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::StageFailed {
                stage: stage.id.clone(),
                reason: format!("failed to spawn {}: {}", exe, e),
            })?;

        let output = match stage.timeout_secs {
            Some(secs) if secs > 0 => {
                tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
                    .await
                    .map_err(|_| PipelineError::Timeout {
                        stage: stage.id.clone(),
                        timeout_secs: secs,
                    })??
            }
            _ => child.wait_with_output().await?,
        };

        let result = StageOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(stage = %stage.id, exit_code = result.exit_code, "process exited");

        if !output.status.success() {
            let tail: String = result.stderr.lines().last().unwrap_or("").to_string();
            return Err(PipelineError::StageFailed {
                stage: stage.id.clone(),
                reason: format!("exit code {}: {}", result.exit_code, tail),
            });
        }
        Ok(result)
    }
}

#[async_trait]
impl StageSubstrate for LocalSubstrate {
    async fn execute(&self, stage: &Stage, ctx: &StageContext) -> PipelineResult<StageOutput> {
        match &stage.work {
            StageWork::Container {
                image,
                command,
                args,
            } => {
                let line = self.command_line(image, command, args, ctx);
                self.run_process(stage, line, ctx).await
            }
            StageWork::Function { function, args } => {
                let start = Instant::now();
                let call = function.invoke(ctx, args);
                let outcome = match stage.timeout_secs {
                    Some(secs) if secs > 0 => tokio::time::timeout(Duration::from_secs(secs), call)
                        .await
                        .map_err(|_| PipelineError::Timeout {
                            stage: stage.id.clone(),
                            timeout_secs: secs,
                        })?,
                    _ => call.await,
                };
                outcome.map_err(|e| PipelineError::StageFailed {
                    stage: stage.id.clone(),
                    reason: format!("{:#}", e),
                })?;
                Ok(StageOutput {
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..StageOutput::default()
                })
            }
            StageWork::CreateVolume(_) | StageWork::DeleteVolume(_) => Err(
                PipelineError::Substrate(format!("stage {} carries volume work", stage.id)),
            ),
        }
    }
}

/// In-memory fakes for testing.
pub mod fakes {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    use super::*;

    /// Records executions and peak concurrency without running anything.
    #[derive(Default)]
    pub struct RecordingSubstrate {
        started: Mutex<Vec<String>>,
        contexts: Mutex<HashMap<String, StageContext>>,
        failing: HashSet<String>,
        delays: HashMap<String, Duration>,
        default_delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RecordingSubstrate {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(mut self, stage: &str) -> Self {
            self.failing.insert(stage.to_string());
            self
        }

        pub fn delay(mut self, stage: &str, delay: Duration) -> Self {
            self.delays.insert(stage.to_string(), delay);
            self
        }

        pub fn default_delay(mut self, delay: Duration) -> Self {
            self.default_delay = delay;
            self
        }

        /// Stage ids in the order they were started.
        pub fn started(&self) -> Vec<String> {
            self.started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn context_of(&self, stage: &str) -> Option<StageContext> {
            self.contexts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(stage)
                .cloned()
        }

        /// Highest number of stages observed running at once.
        pub fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageSubstrate for RecordingSubstrate {
        async fn execute(&self, stage: &Stage, ctx: &StageContext) -> PipelineResult<StageOutput> {
            self.started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(stage.id.clone());
            self.contexts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(stage.id.clone(), ctx.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = self
                .delays
                .get(&stage.id)
                .copied()
                .unwrap_or(self.default_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&stage.id) {
                return Err(PipelineError::StageFailed {
                    stage: stage.id.clone(),
                    reason: "injected failure".to_string(),
                });
            }
            Ok(StageOutput {
                duration_ms: delay.as_millis() as u64,
                ..StageOutput::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ResolvedMount, StageFunction};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn ctx(stage: &str) -> StageContext {
        StageContext {
            run_id: "run-1".to_string(),
            stage_id: stage.to_string(),
            mounts: vec![ResolvedMount {
                volume: "v".to_string(),
                mount_path: PathBuf::from("/data"),
                host_path: PathBuf::from("/tmp/v"),
                access: MountAccess::ReadOnly,
            }],
        }
    }

    #[tokio::test]
    async fn test_container_work_runs_locally_with_env() {
        let stage = Stage::container(
            "echo",
            "img",
            &["sh", "-c"],
            vec!["echo $TUNEFLOW_RUN_ID $TUNEFLOW_STAGE $TUNEFLOW_MOUNTS".to_string()],
        );
        let out = LocalSubstrate::new()
            .execute(&stage, &ctx("echo"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("run-1 echo"));
        assert!(out.stdout.contains("\"/data\":\"/tmp/v\""));
    }

    #[tokio::test]
    async fn test_failing_command_is_stage_failure() {
        let stage = Stage::container(
            "fail",
            "img",
            &["sh", "-c"],
            vec!["echo boom >&2; exit 4".to_string()],
        );
        match LocalSubstrate::new().execute(&stage, &ctx("fail")).await {
            Err(PipelineError::StageFailed { reason, .. }) => {
                assert!(reason.contains("exit code 4"));
                assert!(reason.contains("boom"));
            }
            other => panic!("expected StageFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let stage =
            Stage::container("slow", "img", &["sleep"], vec!["5".to_string()]).timeout_secs(1);
        assert!(matches!(
            LocalSubstrate::new().execute(&stage, &ctx("slow")).await,
            Err(PipelineError::Timeout { timeout_secs: 1, .. })
        ));
    }

    #[test]
    fn test_runtime_binds_mounts() {
        let substrate = LocalSubstrate::new().with_container_runtime("podman");
        let line = substrate.command_line(
            "quay.io/x:1",
            &["python3".to_string()],
            &["run.py".to_string()],
            &ctx("s"),
        );
        assert_eq!(
            line,
            vec!["podman", "run", "--rm", "-v", "/tmp/v:/data:ro", "quay.io/x:1", "python3", "run.py"]
        );
    }

    struct Fails;

    #[async_trait]
    impl StageFunction for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn invoke(&self, _ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
            anyhow::bail!("bad args {}", args)
        }
    }

    #[tokio::test]
    async fn test_function_error_becomes_stage_failure() {
        let stage = Stage::function("f", Arc::new(Fails), json!({"x": 1}));
        match LocalSubstrate::new().execute(&stage, &ctx("f")).await {
            Err(PipelineError::StageFailed { stage, reason }) => {
                assert_eq!(stage, "f");
                assert!(reason.contains("bad args"));
            }
            other => panic!("expected StageFailed, got {:?}", other),
        }
    }
}
