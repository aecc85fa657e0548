//! Tuneflow Core Library
//!
//! Retries, secrets, serving supervision, candidate evaluation, promotion
//! and model publishing for multi-stage LLM training runs.

pub mod campaign;
pub mod config;
pub mod domain;
pub mod evaluation;
pub mod obs;
pub mod promotion;
pub mod reporting;
pub mod retry;
pub mod secrets;
pub mod serving;
pub mod telemetry;
pub mod upload;

pub use campaign::{
    list_candidates, run_campaign, Campaign, CampaignOptions, CampaignOutcome,
    CompletionClientFactory, OpenAiClientFactory, SkippedCandidate,
};
pub use config::{EndpointFallback, PublishSettings, RunConfig, ServingSettings};
pub use domain::{
    AggregateReport, CandidateScoreReport, PromotionRecord, QaScore, Result, TuneflowError,
    PROMOTED_ALIAS, REPORT_TITLE,
};
pub use evaluation::{
    BenchmarkQuestion, CandidateEvaluator, ChatJudge, CompletionClient, OpenAiChatClient,
    ScoringOracle, WorkerCount,
};
pub use promotion::{PromotionOutcome, PromotionSelector};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use secrets::{
    EndpointCredentials, EndpointRole, KubernetesSecretBackend, SecretBackend, SecretRequirement,
    SecretStore, SecretValues,
};
pub use serving::{
    HealthProbe, HealthState, HttpHealthProbe, ServeCommand, ServerHandle, ServerSupervisor,
    ServingError,
};
pub use telemetry::init_tracing;
pub use upload::{
    HttpModelRegistry, ImageTool, ModelRegistryClient, ModelUploader, SkopeoImageTool,
    UploadRequest, UploadedModel,
};
