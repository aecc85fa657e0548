//! Worker-count resolution for request fan-out.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::TuneflowError;

/// Requested number of concurrent in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCount {
    /// Half of the usable CPUs, at least one.
    Auto,
    Fixed(usize),
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Auto
    }
}

impl WorkerCount {
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::Auto => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                (cpus / 2).max(1)
            }
            WorkerCount::Fixed(n) => n.max(1),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = TuneflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(WorkerCount::Auto);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(WorkerCount::Fixed(n)),
            _ => Err(TuneflowError::InvalidConfig(format!(
                "max workers must be 'auto' or a positive integer, got '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCount::Auto => write!(f, "auto"),
            WorkerCount::Fixed(n) => write!(f, "{}", n),
        }
    }
}
