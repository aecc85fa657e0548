use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::domain::promotion::PromotionRecord;
use crate::domain::score::AggregateReport;

/// Serialize with four-space indentation.
fn to_json_indented<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser).context("serialize report")?;
    Ok(buf)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = to_json_indented(value)?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write the aggregate `{best_model, best_score, reports}` file.
pub fn write_aggregate_report(path: &Path, report: &AggregateReport) -> Result<()> {
    write_json(path, report)
}

pub fn write_promotion_record(path: &Path, record: &PromotionRecord) -> Result<()> {
    write_json(path, record)
}

pub fn read_aggregate_report(path: &Path) -> Result<AggregateReport> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {:?}", path))
}

/// Render a markdown table of candidate scores for the metrics report.
pub fn render_scores_md(report: &AggregateReport) -> String {
    let mut out = String::new();
    out.push_str("# Candidate Scores\n\n");
    out.push_str(&format!(
        "Best model: `{}` ({:.3})\n\n",
        report.best_model, report.best_score
    ));
    out.push_str("| model | judge | overall | error rate |\n");
    out.push_str("|---|---|---|---|\n");
    for r in &report.reports {
        out.push_str(&format!(
            "| `{}` | {} | {:.3} | {:.1}% |\n",
            r.model,
            r.judge_model,
            r.overall_score,
            r.error_rate * 100.0
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::score::CandidateScoreReport;

    fn aggregate() -> AggregateReport {
        let mut a = CandidateScoreReport::from_judgements("a", "judge", vec![]);
        a.overall_score = 7.2;
        let mut b = CandidateScoreReport::from_judgements("b", "judge", vec![]);
        b.overall_score = 8.9;
        AggregateReport {
            best_model: "b".to_string(),
            best_score: 8.9,
            reports: vec![a, b],
        }
    }

    #[test]
    fn test_write_and_read_aggregate_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/mt_bench_best.json");

        write_aggregate_report(&path, &aggregate()).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n    \"best_model\": \"b\""));
        let parsed = read_aggregate_report(&path).unwrap();
        assert_eq!(parsed.best_score, 8.9);
        assert_eq!(parsed.reports.len(), 2);
    }

    #[test]
    fn test_write_promotion_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promotion.json");
        let record = PromotionRecord::new("b", 8.9, aggregate().reports, true);

        write_promotion_record(&path, &record).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["winner"], "b");
        assert_eq!(raw["renamed"], true);
        assert!(raw["promoted_at"].is_string());
    }

    #[test]
    fn test_render_scores_md() {
        let md = render_scores_md(&aggregate());
        assert!(md.contains("Best model: `b` (8.900)"));
        assert!(md.contains("| `a` | judge | 7.200 | 0.0% |"));
    }
}
