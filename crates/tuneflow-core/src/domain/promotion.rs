//! Promotion records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::score::CandidateScoreReport;

/// Well-known alias the winning candidate is renamed to.
pub const PROMOTED_ALIAS: &str = "candidate_model";

/// Audit record of a promotion, written once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionRecord {
    pub record_id: Uuid,
    /// Winning candidate identifier.
    pub winner: String,
    pub winning_score: f64,
    /// Every report considered, in evaluation order.
    pub reports: Vec<CandidateScoreReport>,
    pub promoted_at: DateTime<Utc>,
    /// `false` when the alias already existed and promotion was skipped.
    pub renamed: bool,
}

impl PromotionRecord {
    pub fn new(
        winner: impl Into<String>,
        winning_score: f64,
        reports: Vec<CandidateScoreReport>,
        renamed: bool,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            winner: winner.into(),
            winning_score,
            reports,
            promoted_at: Utc::now(),
            renamed,
        }
    }
}
