//! Lifecycle of one ephemeral serving subprocess.
//!
//! `not_started -> starting -> healthy -> terminating -> terminated`, with
//! `starting -> failed` when health is never reached. A handle is owned by
//! the caller that launched it and is never shared.

use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::error::{ServingError, ServingResult};
use super::probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
use crate::config::ServingSettings;
use crate::retry::RetryPolicy;

/// Health of a served model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    /// Reachable but answering non-200.
    Unhealthy,
    Failed,
    Terminating,
    Terminated,
}

/// Serving command template.
///
/// `{port}`, `{model}` and `{parallelism}` are substituted in every argument.
/// `parallelism_args` are appended only when parallelism is above zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub parallelism_args: Vec<String>,
}

impl Default for ServeCommand {
    fn default() -> Self {
        Self::vllm()
    }
}

impl ServeCommand {
    /// OpenAI-compatible vLLM server.
    pub fn vllm() -> Self {
        Self {
            program: "python".to_string(),
            args: [
                "-m",
                "vllm.entrypoints.openai.api_server",
                "--port",
                "{port}",
                "--model",
                "{model}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            parallelism_args: vec![
                "--tensor-parallel-size".to_string(),
                "{parallelism}".to_string(),
            ],
        }
    }

    pub fn render(&self, port: u16, model: &str, parallelism: u32) -> Vec<String> {
        let fill = |arg: &String| {
            arg.replace("{port}", &port.to_string())
                .replace("{model}", model)
                .replace("{parallelism}", &parallelism.to_string())
        };
        let mut args: Vec<String> = self.args.iter().map(fill).collect();
        if parallelism > 0 {
            args.extend(self.parallelism_args.iter().map(fill));
        }
        args
    }
}

/// Handle to a launched server.
#[derive(Debug)]
pub struct ServerHandle {
    pid: Option<u32>,
    port: u16,
    endpoint: String,
    state: HealthState,
    child: Option<Child>,
}

impl ServerHandle {
    /// Handle for a server this process did not spawn. Shutdown only
    /// transitions state.
    pub fn external(endpoint: impl Into<String>, port: u16) -> Self {
        Self {
            pid: None,
            port,
            endpoint: endpoint.into(),
            state: HealthState::Starting,
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// OpenAI-compatible base URL, e.g. `http://127.0.0.1:8000/v1`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> HealthState {
        self.state
    }
}

/// Launches, health-checks and tears down serving subprocesses.
#[derive(Clone)]
pub struct ServerSupervisor {
    command: ServeCommand,
    settings: ServingSettings,
    probe: Arc<dyn HealthProbe>,
    terminate_retry: RetryPolicy,
}

impl ServerSupervisor {
    pub fn new(command: ServeCommand, settings: ServingSettings) -> Self {
        Self {
            command,
            settings,
            probe: Arc::new(HttpHealthProbe::default()),
            terminate_retry: RetryPolicy::default(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_terminate_retry(mut self, retry: RetryPolicy) -> Self {
        self.terminate_retry = retry;
        self
    }

    pub fn settings(&self) -> &ServingSettings {
        &self.settings
    }

    /// Start serving `model_path` on a free local port. Returns at once
    /// with the handle in `Starting`.
    pub fn launch(&self, model_path: &Path, parallelism: u32) -> ServingResult<ServerHandle> {
        let port = free_port()?;
        let model = model_path.to_string_lossy();
        let args = self.command.render(port, &model, parallelism);

        let child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServingError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let endpoint = format!("http://127.0.0.1:{}/v1", port);
        info!(
            pid = ?child.id(),
            port = port,
            model = %model,
            parallelism = parallelism,
            "serving process launched"
        );

        Ok(ServerHandle {
            pid: child.id(),
            port,
            endpoint,
            state: HealthState::Starting,
            child: Some(child),
        })
    }

    /// Poll the liveness endpoint until it answers 200.
    ///
    /// At most `health_max_attempts` polls are made, `health_delay` apart.
    /// A process that exits while starting fails immediately.
    pub async fn await_healthy(&self, handle: &mut ServerHandle) -> ServingResult<()> {
        let max_attempts = self.settings.health_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Some(child) = handle.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    handle.state = HealthState::Failed;
                    return Err(ServingError::ExitedDuringStartup {
                        endpoint: handle.endpoint.clone(),
                        code: status.code(),
                    });
                }
            }

            match self.probe.poll(&handle.endpoint).await {
                ProbeOutcome::Ready => {
                    handle.state = HealthState::Healthy;
                    info!(endpoint = %handle.endpoint, attempt = attempt, "server healthy");
                    return Ok(());
                }
                ProbeOutcome::NotReady(status) => {
                    handle.state = HealthState::Unhealthy;
                    debug!(endpoint = %handle.endpoint, attempt = attempt, status = status, "server not ready");
                }
                ProbeOutcome::Unreachable => {
                    handle.state = HealthState::Starting;
                    debug!(endpoint = %handle.endpoint, attempt = attempt, "server unreachable");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.health_delay()).await;
            }
        }

        handle.state = HealthState::Failed;
        Err(ServingError::StartTimeout {
            endpoint: handle.endpoint.clone(),
            attempts: max_attempts,
        })
    }

    /// Terminate the server and wait for it to be released.
    ///
    /// Sends SIGTERM, waits up to `shutdown_timeout`, then SIGKILLs. After
    /// exit the settle delay elapses before the handle is `Terminated`.
    /// Valid from any state; a terminated handle is left alone.
    pub async fn shutdown(&self, handle: &mut ServerHandle) -> ServingResult<()> {
        if handle.state == HealthState::Terminated {
            return Ok(());
        }
        handle.state = HealthState::Terminating;

        if let Some(mut child) = handle.child.take() {
            if child.try_wait()?.is_none() {
                if let Some(pid) = child.id() {
                    let sent = self
                        .terminate_retry
                        .execute("server terminate", || send_sigterm(pid))
                        .await;
                    if let Err(err) = sent {
                        warn!(pid = pid, error = %err, "graceful terminate not delivered");
                    }
                }

                match tokio::time::timeout(self.settings.shutdown_timeout(), child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(pid = ?handle.pid, code = ?status.code(), "server exited");
                    }
                    Ok(Err(err)) => {
                        warn!(pid = ?handle.pid, error = %err, "wait failed, killing");
                        child.kill().await?;
                    }
                    Err(_) => {
                        warn!(
                            pid = ?handle.pid,
                            timeout_ms = self.settings.shutdown_timeout_ms,
                            "server ignored terminate, killing"
                        );
                        child.kill().await?;
                    }
                }
            }
        }

        if self.settings.settle_delay_ms > 0 {
            debug!(settle_ms = self.settings.settle_delay_ms, "waiting for accelerator release");
            tokio::time::sleep(self.settings.settle_delay()).await;
        }
        handle.state = HealthState::Terminated;
        info!(endpoint = %handle.endpoint, "server terminated");
        Ok(())
    }
}

async fn send_sigterm(pid: u32) -> ServingResult<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(ServingError::Signal(format!(
            "kill -TERM {} exited with {:?}",
            pid,
            status.code()
        )))
    }
}

fn free_port() -> ServingResult<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(ServingError::NoFreePort)?;
    let port = listener
        .local_addr()
        .map_err(ServingError::NoFreePort)?
        .port();
    Ok(port)
}
