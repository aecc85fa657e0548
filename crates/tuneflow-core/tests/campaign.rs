//! End-to-end evaluation campaigns with real serving subprocesses and fake
//! generation/judging.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tuneflow_core::campaign::fakes::EchoClientFactory;
use tuneflow_core::campaign::promotion_record_path;
use tuneflow_core::reporting::read_aggregate_report;
use tuneflow_core::serving::{HealthProbe, ProbeOutcome};
use tuneflow_core::{
    BenchmarkQuestion, Campaign, CandidateEvaluator, RetryPolicy, ScoringOracle, ServeCommand,
    ServerSupervisor, ServingSettings, TuneflowError, PROMOTED_ALIAS,
};

/// Scores an answer by the candidate directory name the echo client
/// prefixes to every reply.
struct ScoreByCandidate {
    scores: HashMap<String, f64>,
}

#[async_trait]
impl ScoringOracle for ScoreByCandidate {
    fn judge_model(&self) -> &str {
        "test-judge"
    }

    async fn score(
        &self,
        _question: &BenchmarkQuestion,
        answers: &[String],
        _turn: usize,
    ) -> tuneflow_core::Result<f64> {
        let model = answers[0].split(": ").next().unwrap_or("");
        let name = Path::new(model)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.scores
            .get(&name)
            .copied()
            .ok_or_else(|| TuneflowError::InvalidBenchmark(format!("unknown candidate {}", name)))
    }
}

/// Ready from the `ready_on`-th poll of each endpoint.
struct PerEndpointProbe {
    ready_on: u32,
    polls: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl HealthProbe for PerEndpointProbe {
    async fn poll(&self, endpoint: &str) -> ProbeOutcome {
        let mut polls = self.polls.lock().unwrap();
        let n = polls.entry(endpoint.to_string()).or_insert(0);
        *n += 1;
        if *n >= self.ready_on {
            ProbeOutcome::Ready
        } else {
            ProbeOutcome::Unreachable
        }
    }
}

fn questions() -> Vec<BenchmarkQuestion> {
    vec![BenchmarkQuestion {
        question_id: "1".to_string(),
        category: "writing".to_string(),
        turns: vec!["Write a haiku.".to_string(), "Now in French.".to_string()],
    }]
}

/// Never ready for the first endpoint it sees; ready at once for the rest.
#[derive(Default)]
struct FirstEndpointStuck {
    stuck: Mutex<Option<String>>,
}

#[async_trait]
impl HealthProbe for FirstEndpointStuck {
    async fn poll(&self, endpoint: &str) -> ProbeOutcome {
        let mut stuck = self.stuck.lock().unwrap();
        let first = stuck.get_or_insert_with(|| endpoint.to_string());
        if first.as_str() == endpoint {
            ProbeOutcome::NotReady(503)
        } else {
            ProbeOutcome::Ready
        }
    }
}

fn sh_command(script: &str) -> ServeCommand {
    ServeCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "{model}".to_string()],
        parallelism_args: vec![],
    }
}

fn settings(health_max_attempts: u32, shutdown_timeout_ms: u64) -> ServingSettings {
    ServingSettings {
        health_max_attempts,
        health_delay_ms: 20,
        shutdown_timeout_ms,
        settle_delay_ms: 0,
    }
}

fn supervisor(script: &str, ready_on: u32) -> ServerSupervisor {
    ServerSupervisor::new(sh_command(script), settings(50, 5_000))
        .with_probe(Arc::new(PerEndpointProbe {
            ready_on,
            polls: Mutex::new(HashMap::new()),
        }))
        .with_terminate_retry(RetryPolicy::fixed(3, std::time::Duration::ZERO))
}

fn oracle(pairs: &[(&str, f64)]) -> Arc<ScoreByCandidate> {
    Arc::new(ScoreByCandidate {
        scores: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    })
}

#[tokio::test]
async fn tie_on_top_score_promotes_first_candidate() {
    let root = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c"] {
        std::fs::create_dir(root.path().join(name)).unwrap();
    }
    std::fs::write(root.path().join("messages.jsonl"), "{}").unwrap();
    let output = root.path().join("reports/mt_bench_best.json");

    let campaign = Campaign::new(
        supervisor("exec sleep 30", 1),
        CandidateEvaluator::new(questions(), 2),
        oracle(&[("a", 7.2), ("b", 8.9), ("c", 8.9)]),
        Arc::new(EchoClientFactory),
    );

    let outcome = campaign.run(root.path(), &output).await.unwrap();

    let b_path = root.path().join("b").to_string_lossy().to_string();
    assert_eq!(outcome.aggregate.best_model, b_path);
    assert_eq!(outcome.aggregate.best_score, 8.9);
    assert_eq!(outcome.aggregate.reports.len(), 3);
    assert!(outcome.skipped.is_empty());
    assert!(outcome.record.renamed);

    assert!(root.path().join(PROMOTED_ALIAS).is_dir());
    assert!(!root.path().join("b").exists());
    assert!(root.path().join("c").exists());

    let written = read_aggregate_report(&output).unwrap();
    assert_eq!(written.best_model, b_path);
    assert_eq!(written.best_score, 8.9);
    assert!(promotion_record_path(&output).is_file());
}

#[tokio::test]
async fn candidate_whose_server_dies_is_skipped() {
    let root = tempfile::tempdir().unwrap();
    for name in ["broken", "good"] {
        std::fs::create_dir(root.path().join(name)).unwrap();
    }
    let output = root.path().join("best.json");

    let script = r#"case "$0" in *broken*) exit 1;; *) exec sleep 30;; esac"#;
    let campaign = Campaign::new(
        supervisor(script, 5),
        CandidateEvaluator::new(questions(), 1),
        oracle(&[("good", 6.0)]),
        Arc::new(EchoClientFactory),
    )
    .with_promotion(false);

    let outcome = campaign.run(root.path(), &output).await.unwrap();

    assert_eq!(outcome.aggregate.reports.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);
    assert!(outcome.skipped[0].candidate.ends_with("broken"));
    assert!(outcome.promotion.is_none());
    assert!(!root.path().join(PROMOTED_ALIAS).exists());
}

#[tokio::test]
async fn no_scored_candidate_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("broken")).unwrap();
    let output = root.path().join("best.json");

    let campaign = Campaign::new(
        supervisor("exit 1", 5),
        CandidateEvaluator::new(questions(), 1),
        oracle(&[]),
        Arc::new(EchoClientFactory),
    );

    let err = campaign.run(root.path(), &output).await.unwrap_err();
    assert!(matches!(err, TuneflowError::NoCandidates));
    assert!(!output.exists());
}

#[tokio::test]
async fn rerun_after_promotion_keeps_alias() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("a")).unwrap();
    std::fs::create_dir(root.path().join(PROMOTED_ALIAS)).unwrap();
    let output = root.path().join("best.json");

    let campaign = Campaign::new(
        supervisor("exec sleep 30", 1),
        CandidateEvaluator::new(questions(), 1),
        oracle(&[("a", 5.0)]),
        Arc::new(EchoClientFactory),
    );

    let outcome = campaign.run(root.path(), &output).await.unwrap();
    assert!(!outcome.record.renamed);
    assert!(root.path().join("a").exists());
    assert_eq!(outcome.aggregate.reports.len(), 1);
}

#[tokio::test]
async fn candidate_never_healthy_is_skipped_and_rest_promoted() {
    let root = tempfile::tempdir().unwrap();
    for name in ["a-stuck", "b-good", "c-better"] {
        std::fs::create_dir(root.path().join(name)).unwrap();
    }
    let output = root.path().join("best.json");

    let supervisor = ServerSupervisor::new(sh_command("exec sleep 30"), settings(5, 5_000))
        .with_probe(Arc::new(FirstEndpointStuck::default()))
        .with_terminate_retry(RetryPolicy::fixed(3, std::time::Duration::ZERO));
    let campaign = Campaign::new(
        supervisor,
        CandidateEvaluator::new(questions(), 1),
        oracle(&[("b-good", 6.0), ("c-better", 7.5)]),
        Arc::new(EchoClientFactory),
    );

    let outcome = campaign.run(root.path(), &output).await.unwrap();

    assert_eq!(outcome.skipped.len(), 1);
    assert!(outcome.skipped[0].candidate.ends_with("a-stuck"));
    assert!(outcome.skipped[0].reason.contains("did not become healthy after 5 poll(s)"));
    assert_eq!(outcome.aggregate.reports.len(), 2);
    assert!(outcome.aggregate.best_model.ends_with("c-better"));
    assert!(root.path().join(PROMOTED_ALIAS).is_dir());
    assert!(!root.path().join("c-better").exists());
    assert!(root.path().join("a-stuck").exists());
}

#[tokio::test]
async fn server_ignoring_terminate_is_killed_and_campaign_continues() {
    let root = tempfile::tempdir().unwrap();
    for name in ["a", "b"] {
        std::fs::create_dir(root.path().join(name)).unwrap();
    }
    let output = root.path().join("best.json");

    let supervisor = ServerSupervisor::new(
        sh_command("trap '' TERM; exec sleep 30"),
        settings(50, 200),
    )
    .with_probe(Arc::new(PerEndpointProbe {
        ready_on: 1,
        polls: Mutex::new(HashMap::new()),
    }))
    .with_terminate_retry(RetryPolicy::fixed(1, std::time::Duration::ZERO));
    let campaign = Campaign::new(
        supervisor,
        CandidateEvaluator::new(questions(), 1),
        oracle(&[("a", 4.0), ("b", 5.0)]),
        Arc::new(EchoClientFactory),
    )
    .with_promotion(false);

    let outcome = campaign.run(root.path(), &output).await.unwrap();

    assert_eq!(outcome.aggregate.reports.len(), 2);
    assert!(outcome.skipped.is_empty());
    assert!(read_aggregate_report(&output).unwrap().best_model.ends_with('b'));
}
