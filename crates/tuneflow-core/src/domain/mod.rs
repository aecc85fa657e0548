//! Domain models for Tuneflow.
//!
//! Canonical definitions for the core entities:
//! - `CandidateScoreReport`: judged result of one candidate checkpoint
//! - `AggregateReport`: every report of a run plus the winner
//! - `PromotionRecord`: audit trail of the promoted candidate

pub mod error;
pub mod promotion;
pub mod score;

pub use error::{Result, TuneflowError};
pub use promotion::{PromotionRecord, PROMOTED_ALIAS};
pub use score::{AggregateReport, CandidateScoreReport, QaScore, REPORT_TITLE};
