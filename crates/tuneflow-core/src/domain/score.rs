//! Candidate score reports and the aggregated report file.

use serde::{Deserialize, Serialize};

/// Report title written into every per-candidate report.
pub const REPORT_TITLE: &str = "SKILLS EVALUATION REPORT";

/// One judged answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaScore {
    pub question_id: String,
    pub category: String,
    /// 1-based turn index.
    pub turn: usize,
    /// `None` when the judge call for this turn failed.
    pub score: Option<f64>,
}

/// Score report for a single candidate. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateScoreReport {
    pub report_title: String,
    /// Candidate identifier (the checkpoint path served for this candidate).
    pub model: String,
    pub judge_model: String,
    pub overall_score: f64,
    /// Mean score per turn index, in turn order.
    pub turn_scores: Vec<f64>,
    pub qa_scores: Vec<QaScore>,
    /// Fraction of judging calls that failed.
    pub error_rate: f64,
}

impl CandidateScoreReport {
    /// Build a report from judged answers.
    ///
    /// Failed judgements are excluded from the averages and counted in
    /// `error_rate`. A report with no successful judgements scores `0.0`.
    pub fn from_judgements(
        model: impl Into<String>,
        judge_model: impl Into<String>,
        qa_scores: Vec<QaScore>,
    ) -> Self {
        let total = qa_scores.len();
        let failed = qa_scores.iter().filter(|q| q.score.is_none()).count();

        let succeeded: Vec<f64> = qa_scores.iter().filter_map(|q| q.score).collect();
        let overall_score = mean(&succeeded).unwrap_or(0.0);

        let max_turn = qa_scores.iter().map(|q| q.turn).max().unwrap_or(0);
        let turn_scores = (1..=max_turn)
            .map(|turn| {
                let scores: Vec<f64> = qa_scores
                    .iter()
                    .filter(|q| q.turn == turn)
                    .filter_map(|q| q.score)
                    .collect();
                mean(&scores).unwrap_or(0.0)
            })
            .collect();

        let error_rate = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };

        Self {
            report_title: REPORT_TITLE.to_string(),
            model: model.into(),
            judge_model: judge_model.into(),
            overall_score,
            turn_scores,
            qa_scores,
            error_rate,
        }
    }
}

/// Aggregated report over every scored candidate in a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateReport {
    pub best_model: String,
    pub best_score: f64,
    pub reports: Vec<CandidateScoreReport>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
