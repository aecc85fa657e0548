//! Multi-candidate evaluation campaign.
//!
//! Every candidate checkpoint under a root directory is served, answered,
//! released and judged in turn. The best report is promoted to the
//! well-known alias and the aggregate report is written for downstream stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::domain::error::{Result, TuneflowError};
use crate::domain::promotion::{PromotionRecord, PROMOTED_ALIAS};
use crate::domain::score::{AggregateReport, CandidateScoreReport};
use crate::evaluation::{
    load_questions, ChatJudge, CandidateEvaluator, CompletionClient, OpenAiChatClient,
    ScoringOracle, WorkerCount,
};
use crate::obs;
use crate::promotion::{PromotionOutcome, PromotionSelector};
use crate::reporting;
use crate::secrets::EndpointCredentials;
use crate::serving::{ServeCommand, ServerHandle, ServerSupervisor};

/// Builds a completion client for a freshly served candidate.
pub trait CompletionClientFactory: Send + Sync {
    fn connect(&self, endpoint: &str, model: &str) -> Result<Box<dyn CompletionClient>>;
}

/// Plain-HTTP clients against the local serving endpoint.
#[derive(Debug, Clone, Default)]
pub struct OpenAiClientFactory;

impl CompletionClientFactory for OpenAiClientFactory {
    fn connect(&self, endpoint: &str, model: &str) -> Result<Box<dyn CompletionClient>> {
        Ok(Box::new(OpenAiChatClient::new(endpoint, model, None, None)?))
    }
}

/// A candidate that produced no report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCandidate {
    pub candidate: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CampaignOutcome {
    pub aggregate: AggregateReport,
    pub record: PromotionRecord,
    pub skipped: Vec<SkippedCandidate>,
    /// `None` when promotion was disabled.
    pub promotion: Option<PromotionOutcome>,
}

/// Candidate checkpoint directories under `root`, sorted by name.
///
/// Plain files (including `*.jsonl` data files) and the promoted alias are
/// ignored.
pub fn list_candidates(root: &Path) -> Result<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            continue;
        }
        if entry.file_name() == PROMOTED_ALIAS {
            continue;
        }
        candidates.push(path);
    }
    candidates.sort();
    Ok(candidates)
}

/// Sibling path the promotion record is written to.
pub fn promotion_record_path(output_path: &Path) -> PathBuf {
    output_path.with_extension("promotion.json")
}

/// Composes supervisor, evaluator and selector over a set of candidates.
pub struct Campaign {
    supervisor: ServerSupervisor,
    evaluator: CandidateEvaluator,
    oracle: Arc<dyn ScoringOracle>,
    clients: Arc<dyn CompletionClientFactory>,
    parallelism: u32,
    promote: bool,
}

impl Campaign {
    pub fn new(
        supervisor: ServerSupervisor,
        evaluator: CandidateEvaluator,
        oracle: Arc<dyn ScoringOracle>,
        clients: Arc<dyn CompletionClientFactory>,
    ) -> Self {
        Self {
            supervisor,
            evaluator,
            oracle,
            clients,
            parallelism: 0,
            promote: true,
        }
    }

    /// Tensor-parallel degree passed to the serving process.
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_promotion(mut self, promote: bool) -> Self {
        self.promote = promote;
        self
    }

    pub async fn run(&self, candidates_root: &Path, output_path: &Path) -> Result<CampaignOutcome> {
        let candidates = list_candidates(candidates_root)?;
        info!(
            root = %candidates_root.display(),
            candidates = candidates.len(),
            workers = self.evaluator.concurrency(),
            "starting evaluation campaign"
        );

        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        for candidate in &candidates {
            let model = candidate.to_string_lossy().to_string();
            match self.evaluate_candidate(candidate, &model).await {
                Ok(report) => {
                    obs::emit_candidate_scored(&model, report.overall_score, report.error_rate);
                    reports.push(report);
                }
                Err(TuneflowError::Serving(err)) if err.is_candidate_fatal() => {
                    obs::emit_candidate_skipped(&model, &err);
                    skipped.push(SkippedCandidate {
                        candidate: model,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let selector = PromotionSelector::new();
        let winner = selector.select(&reports)?.clone();
        let aggregate = AggregateReport {
            best_model: winner.model.clone(),
            best_score: winner.overall_score,
            reports,
        };
        reporting::write_aggregate_report(output_path, &aggregate)
            .map_err(|e| TuneflowError::Reporting(format!("{:#}", e)))?;

        let promotion = if self.promote {
            Some(selector.promote(&winner.model, candidates_root)?)
        } else {
            None
        };
        let renamed = promotion.as_ref().is_some_and(PromotionOutcome::renamed);
        obs::emit_promotion(&winner.model, winner.overall_score, renamed);

        let record = PromotionRecord::new(
            winner.model.clone(),
            winner.overall_score,
            aggregate.reports.clone(),
            renamed,
        );
        reporting::write_promotion_record(&promotion_record_path(output_path), &record)
            .map_err(|e| TuneflowError::Reporting(format!("{:#}", e)))?;

        Ok(CampaignOutcome {
            aggregate,
            record,
            skipped,
            promotion,
        })
    }

    /// Serve, generate, release, then judge. The server is always shut down.
    async fn evaluate_candidate(&self, path: &Path, model: &str) -> Result<CandidateScoreReport> {
        let mut handle = self.supervisor.launch(path, self.parallelism)?;

        if let Err(err) = self.supervisor.await_healthy(&mut handle).await {
            self.release(&mut handle, model).await;
            return Err(err.into());
        }

        let client = match self.clients.connect(handle.endpoint(), model) {
            Ok(client) => client,
            Err(err) => {
                self.release(&mut handle, model).await;
                return Err(err);
            }
        };

        let generated = self.evaluator.generate(client.as_ref()).await;
        self.release(&mut handle, model).await;

        Ok(self
            .evaluator
            .judge(model, &generated, self.oracle.as_ref())
            .await)
    }

    async fn release(&self, handle: &mut ServerHandle, model: &str) {
        if let Err(err) = self.supervisor.shutdown(handle).await {
            warn!(candidate = %model, error = %err, "server shutdown failed");
        }
    }
}

/// Inputs for [`run_campaign`].
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub questions_path: PathBuf,
    pub workers: WorkerCount,
    pub parallelism: u32,
    pub serve_command: ServeCommand,
    pub judge: EndpointCredentials,
    pub merge_system_user_message: bool,
    pub promote: bool,
}

/// Evaluate every candidate under `candidates_root` with HTTP clients, the
/// configured judge and the default serving supervisor.
pub async fn run_campaign(
    config: &RunConfig,
    candidates_root: &Path,
    output_path: &Path,
    options: CampaignOptions,
) -> Result<CampaignOutcome> {
    let judge_endpoint = options
        .judge
        .endpoint
        .clone()
        .ok_or_else(|| TuneflowError::InvalidConfig("judge endpoint is not set".to_string()))?;
    let judge_model = options
        .judge
        .model
        .clone()
        .ok_or_else(|| TuneflowError::InvalidConfig("judge model is not set".to_string()))?;

    let judge_client = OpenAiChatClient::new(
        judge_endpoint,
        judge_model,
        options.judge.api_key.clone(),
        config.judge_ca_cert(),
    )?;
    let oracle = ChatJudge::new(judge_client)
        .merge_system_user_message(options.merge_system_user_message);

    let questions = load_questions(&options.questions_path).await?;
    let evaluator = CandidateEvaluator::new(questions, options.workers.resolve());
    let supervisor = ServerSupervisor::new(options.serve_command.clone(), config.serving)
        .with_terminate_retry(config.retry);

    Campaign::new(
        supervisor,
        evaluator,
        Arc::new(oracle),
        Arc::new(OpenAiClientFactory),
    )
    .with_parallelism(options.parallelism)
    .with_promotion(options.promote)
    .run(candidates_root, output_path)
    .await
}

/// In-memory fakes for testing.
pub mod fakes {
    use super::*;
    use crate::evaluation::evaluator::fakes::EchoCompletionClient;

    /// Hands out [`EchoCompletionClient`]s named after the candidate.
    #[derive(Debug, Clone, Default)]
    pub struct EchoClientFactory;

    impl CompletionClientFactory for EchoClientFactory {
        fn connect(&self, _endpoint: &str, model: &str) -> Result<Box<dyn CompletionClient>> {
            Ok(Box::new(EchoCompletionClient::new(model)))
        }
    }
}
