//! Ephemeral model-serving subprocess supervision.
//!
//! - [`supervisor`]: `ServerSupervisor`, `ServerHandle`, `ServeCommand`
//! - [`probe`]: `HealthProbe` and the HTTP liveness check
//! - [`error`]: `ServingError` / `ServingResult`

pub mod error;
pub mod probe;
pub mod supervisor;

pub use error::{ServingError, ServingResult};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use supervisor::{HealthState, ServeCommand, ServerHandle, ServerSupervisor};
