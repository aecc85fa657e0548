//! Error types for the serving supervisor.

/// Errors produced while supervising a serving subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ServingError {
    #[error("server at {endpoint} did not become healthy after {attempts} poll(s)")]
    StartTimeout { endpoint: String, attempts: u32 },

    #[error("server at {endpoint} exited during startup (exit code {code:?})")]
    ExitedDuringStartup { endpoint: String, code: Option<i32> },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free local port: {0}")]
    NoFreePort(std::io::Error),

    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error("process error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServingError {
    /// Whether the candidate should be skipped rather than the run aborted.
    pub fn is_candidate_fatal(&self) -> bool {
        matches!(
            self,
            ServingError::StartTimeout { .. }
                | ServingError::ExitedDuringStartup { .. }
                | ServingError::Spawn { .. }
        )
    }
}

/// Result type for serving operations.
pub type ServingResult<T> = std::result::Result<T, ServingError>;
