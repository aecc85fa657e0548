//! Winner selection and promotion to the well-known alias.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::domain::error::{Result, TuneflowError};
use crate::domain::promotion::PROMOTED_ALIAS;
use crate::domain::score::CandidateScoreReport;

/// What `promote` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Winner renamed to the alias.
    Promoted { from: PathBuf, to: PathBuf },
    /// Alias already existed; nothing was touched.
    AlreadyPromoted { alias: PathBuf },
}

impl PromotionOutcome {
    pub fn renamed(&self) -> bool {
        matches!(self, PromotionOutcome::Promoted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PromotionSelector;

impl PromotionSelector {
    pub fn new() -> Self {
        Self
    }

    /// Highest overall score wins. On an exact tie the report seen first wins.
    pub fn select<'a>(
        &self,
        reports: &'a [CandidateScoreReport],
    ) -> Result<&'a CandidateScoreReport> {
        let mut iter = reports.iter();
        let mut best = iter.next().ok_or(TuneflowError::NoCandidates)?;
        for report in iter {
            if report.overall_score > best.overall_score {
                best = report;
            }
        }
        Ok(best)
    }

    /// Rename `candidates_root/{winner}` to `candidates_root/candidate_model`.
    ///
    /// `winner` may be a bare name or a path whose final component names the
    /// candidate. If the alias already exists this is a logged no-op.
    pub fn promote(&self, winner: &str, candidates_root: &Path) -> Result<PromotionOutcome> {
        let alias = candidates_root.join(PROMOTED_ALIAS);
        if alias.exists() {
            info!(alias = %alias.display(), "promoted alias already exists, skipping");
            return Ok(PromotionOutcome::AlreadyPromoted { alias });
        }

        let name = Path::new(winner)
            .file_name()
            .ok_or_else(|| TuneflowError::CandidateNotFound(winner.to_string()))?;
        let source = candidates_root.join(name);
        if !source.is_dir() {
            return Err(TuneflowError::CandidateNotFound(
                source.display().to_string(),
            ));
        }

        std::fs::rename(&source, &alias)?;
        info!(from = %source.display(), to = %alias.display(), "candidate promoted");
        Ok(PromotionOutcome::Promoted {
            from: source,
            to: alias,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(model: &str, score: f64) -> CandidateScoreReport {
        let mut r = CandidateScoreReport::from_judgements(model, "judge", vec![]);
        r.overall_score = score;
        r
    }

    #[test]
    fn test_select_returns_maximum() {
        let reports = vec![report("a", 6.1), report("b", 7.9), report("c", 7.0)];
        let winner = PromotionSelector::new().select(&reports).unwrap();
        assert_eq!(winner.model, "b");
    }

    #[test]
    fn test_select_tie_prefers_first_occurrence() {
        let reports = vec![report("a", 7.2), report("b", 8.9), report("c", 8.9)];
        let winner = PromotionSelector::new().select(&reports).unwrap();
        assert_eq!(winner.model, "b");
    }

    #[test]
    fn test_select_single_candidate() {
        let reports = vec![report("only", 1.0)];
        assert_eq!(PromotionSelector::new().select(&reports).unwrap().model, "only");
    }

    #[test]
    fn test_select_empty_is_no_candidates() {
        assert!(matches!(
            PromotionSelector::new().select(&[]),
            Err(TuneflowError::NoCandidates)
        ));
    }

    #[test]
    fn test_promote_renames_winner() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("samples_128")).unwrap();
        std::fs::write(root.path().join("samples_128/config.json"), "{}").unwrap();

        let outcome = PromotionSelector::new()
            .promote("samples_128", root.path())
            .unwrap();

        assert!(outcome.renamed());
        assert!(!root.path().join("samples_128").exists());
        assert!(root.path().join(PROMOTED_ALIAS).join("config.json").exists());
    }

    #[test]
    fn test_promote_accepts_full_candidate_path() {
        let root = tempfile::tempdir().unwrap();
        let candidate = root.path().join("samples_256");
        std::fs::create_dir(&candidate).unwrap();

        let outcome = PromotionSelector::new()
            .promote(&candidate.to_string_lossy(), root.path())
            .unwrap();
        assert!(outcome.renamed());
    }

    #[test]
    fn test_promote_twice_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("samples_128")).unwrap();
        let selector = PromotionSelector::new();

        selector.promote("samples_128", root.path()).unwrap();
        let second = selector.promote("samples_128", root.path()).unwrap();

        assert!(!second.renamed());
        assert!(root.path().join(PROMOTED_ALIAS).is_dir());
        assert!(!root.path().join("samples_128").exists());
    }

    #[test]
    fn test_promote_missing_candidate_fails() {
        let root = tempfile::tempdir().unwrap();
        let err = PromotionSelector::new()
            .promote("ghost", root.path())
            .unwrap_err();
        assert!(matches!(err, TuneflowError::CandidateNotFound(_)));
    }
}
