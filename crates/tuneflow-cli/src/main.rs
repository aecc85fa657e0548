//! Tuneflow CLI
//!
//! The `tuneflow` command drives training runs and their evaluation tail.
//!
//! ## Commands
//!
//! - `plan`: Print the staged plan of the training workflow
//! - `run`: Execute the training workflow on this host
//! - `mt-bench`: Serve, score and promote candidate checkpoints
//! - `promote`: Promote the winner of an existing aggregate report
//! - `upload`: Publish a model directory to OCI or an artifact path

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use tuneflow_core::reporting::read_aggregate_report;
use tuneflow_core::upload::registry_auth_blob;
use tuneflow_core::{
    init_tracing, run_campaign, CampaignOptions, EndpointRole, HttpModelRegistry,
    KubernetesSecretBackend, ModelUploader, PromotionSelector, RunConfig, SecretStore,
    ServeCommand, SkopeoImageTool, UploadRequest, WorkerCount,
};
use tuneflow_pipeline::{
    build_training_workflow, FileStageCache, GraphExecutor, LocalSubstrate, LocalVolumeBackend,
    StageGraph, TrainingParams, VolumeManager, WorkflowFunctions,
};

#[derive(Parser)]
#[command(name = "tuneflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-stage LLM fine-tuning orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the training workflow as levelled stages (JSON)
    Plan {
        /// Workflow parameters (JSON); defaults apply to missing fields
        #[arg(short, long)]
        params: Option<PathBuf>,
    },

    /// Execute the training workflow locally
    Run {
        /// Workflow parameters (JSON); defaults apply to missing fields
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Directory backing run-scoped volumes
        #[arg(long, env = "TUNEFLOW_VOLUME_ROOT", default_value = ".tuneflow/volumes")]
        volume_root: PathBuf,

        /// Persist stage fingerprints here to skip unchanged stages
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Write the run report (JSON) to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Run container stages through this runtime (podman, docker)
        #[arg(long, env = "TUNEFLOW_CONTAINER_RUNTIME")]
        container_runtime: Option<String>,

        /// Upper bound on concurrently running stages
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Evaluate every candidate checkpoint and promote the best one
    MtBench {
        /// Directory holding candidate checkpoints
        #[arg(long)]
        models_folder: PathBuf,

        /// Aggregate report destination
        #[arg(short, long)]
        output: PathBuf,

        /// Benchmark questions (JSONL)
        #[arg(short, long)]
        questions: PathBuf,

        /// Concurrent judge requests per candidate: "auto" or a positive integer
        #[arg(long, default_value = "auto")]
        max_workers: String,

        /// Fold the system prompt into the first user message
        #[arg(long)]
        merge_system_user_message: bool,

        /// Secret holding the judge endpoint credentials
        #[arg(long, env = "JUDGE_SECRET")]
        judge_secret: Option<String>,

        /// Tensor parallelism passed to the model server (0 leaves it unset)
        #[arg(long, default_value_t = 0)]
        parallelism: u32,

        /// Score only; leave the candidate directories untouched
        #[arg(long)]
        no_promote: bool,
    },

    /// Promote the best candidate recorded in an aggregate report
    Promote {
        /// Aggregate report written by `mt-bench`
        #[arg(short, long)]
        report: PathBuf,

        /// Directory holding candidate checkpoints
        #[arg(long)]
        models_folder: PathBuf,
    },

    /// Publish a model directory
    Upload {
        /// Model directory to publish
        #[arg(long)]
        model_dir: PathBuf,

        /// Destination when no OCI URI is given
        #[arg(long)]
        artifact_dir: PathBuf,

        /// Push a modelcar image to this reference
        #[arg(long, env = "OCI_OUTPUT_URI")]
        oci_model_uri: Option<String>,

        /// Secret holding the registry auth blob
        #[arg(long, env = "OCI_REGISTRY_SECRET")]
        oci_registry_secret: Option<String>,

        /// Base image for the modelcar
        #[arg(long)]
        modelcar_base_image: Option<String>,

        /// Model registry API URL
        #[arg(long, env = "MODEL_REGISTRY_API_URL")]
        registry_api_url: Option<String>,

        /// Registered model name
        #[arg(long)]
        model_name: Option<String>,

        /// Registered model version
        #[arg(long)]
        model_version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = RunConfig::from_env();

    match cli.command {
        Commands::Plan { params } => cmd_plan(&config, params.as_deref()),
        Commands::Run {
            params,
            volume_root,
            cache,
            report,
            container_runtime,
            max_parallel,
        } => {
            cmd_run(
                &config,
                RunOptions {
                    params,
                    volume_root,
                    cache,
                    report,
                    container_runtime,
                    max_parallel,
                },
            )
            .await
        }
        Commands::MtBench {
            models_folder,
            output,
            questions,
            max_workers,
            merge_system_user_message,
            judge_secret,
            parallelism,
            no_promote,
        } => {
            let workers: WorkerCount = max_workers.parse()?;
            let judge = secret_store(&config)?
                .endpoint_credentials(judge_secret.as_deref(), EndpointRole::Judge, &config)
                .await?;
            let options = CampaignOptions {
                questions_path: questions,
                workers,
                parallelism,
                serve_command: ServeCommand::vllm(),
                judge,
                merge_system_user_message,
                promote: !no_promote,
            };
            cmd_mt_bench(&config, &models_folder, &output, options).await
        }
        Commands::Promote {
            report,
            models_folder,
        } => cmd_promote(&report, &models_folder),
        Commands::Upload {
            model_dir,
            artifact_dir,
            oci_model_uri,
            oci_registry_secret,
            modelcar_base_image,
            registry_api_url,
            model_name,
            model_version,
        } => {
            let request = UploadRequest {
                model_dir,
                artifact_dir,
                oci_model_uri,
                oci_registry_secret,
                modelcar_base_image,
                registry_api_url,
                model_name,
                model_version,
                ..UploadRequest::default()
            };
            cmd_upload(&config, request).await
        }
    }
}

fn secret_store(config: &RunConfig) -> Result<SecretStore> {
    let backend = KubernetesSecretBackend::from_config(config)
        .context("Failed to set up the secret backend")?;
    Ok(SecretStore::new(Arc::new(backend), config.retry))
}

fn load_params(path: Option<&Path>) -> Result<TrainingParams> {
    match path {
        None => Ok(TrainingParams::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read params file {:?}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid params file {:?}", path))
        }
    }
}

fn training_graph(config: &RunConfig, params: &TrainingParams) -> Result<StageGraph> {
    let functions = WorkflowFunctions::new(
        config,
        secret_store(config)?,
        Arc::new(SkopeoImageTool::default()),
        ServeCommand::vllm(),
    );
    Ok(build_training_workflow(params, config, &functions)?)
}

fn cmd_plan(config: &RunConfig, params: Option<&Path>) -> Result<()> {
    let params = load_params(params)?;
    let graph = training_graph(config, &params)?;
    let plan = graph.plan()?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

struct RunOptions {
    params: Option<PathBuf>,
    volume_root: PathBuf,
    cache: Option<PathBuf>,
    report: Option<PathBuf>,
    container_runtime: Option<String>,
    max_parallel: Option<usize>,
}

async fn cmd_run(config: &RunConfig, opts: RunOptions) -> Result<()> {
    let params = load_params(opts.params.as_deref())?;
    let graph = training_graph(config, &params)?;

    let mut substrate = LocalSubstrate::new();
    if let Some(runtime) = opts.container_runtime {
        substrate = substrate.with_container_runtime(runtime);
    }
    let volumes = VolumeManager::new(Arc::new(LocalVolumeBackend::new(&opts.volume_root)));
    let mut executor = GraphExecutor::new(Arc::new(substrate), volumes);
    if let Some(path) = opts.cache {
        executor = executor.with_cache(Arc::new(FileStageCache::new(path)));
    }
    if let Some(n) = opts.max_parallel {
        executor = executor.with_max_parallel(n);
    }

    info!(run_name = %params.run_name, stages = graph.len(), "starting training run");
    let report = executor.run(&graph).await?;

    let rendered = serde_json::to_string_pretty(&report)?;
    match &opts.report {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write run report {:?}", path))?;
            println!("Run report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }

    if !report.success() {
        anyhow::bail!(
            "run {} failed: {}",
            report.run_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("Run {} succeeded ({} stages)", report.run_id, report.stages.len());
    Ok(())
}

async fn cmd_mt_bench(
    config: &RunConfig,
    models_folder: &Path,
    output: &Path,
    options: CampaignOptions,
) -> Result<()> {
    let outcome = run_campaign(config, models_folder, output, options).await?;

    println!(
        "Best model: {} (score {:.3})",
        outcome.aggregate.best_model, outcome.aggregate.best_score
    );
    for skipped in &outcome.skipped {
        println!("  skipped {}: {}", skipped.candidate, skipped.reason);
    }
    if let Some(promotion) = &outcome.promotion {
        println!("Promoted: {}", if promotion.renamed() { "yes" } else { "already" });
    }
    println!("Report written to {}", output.display());
    Ok(())
}

fn cmd_promote(report: &Path, models_folder: &Path) -> Result<()> {
    let aggregate = read_aggregate_report(report)
        .with_context(|| format!("Failed to read aggregate report {:?}", report))?;
    let selector = PromotionSelector::new();
    let winner = selector.select(&aggregate.reports)?;
    let outcome = selector.promote(&winner.model, models_folder)?;

    if outcome.renamed() {
        println!("Promoted {} (score {:.3})", winner.model, winner.overall_score);
    } else {
        println!("Promoted alias already present; nothing renamed");
    }
    Ok(())
}

async fn cmd_upload(config: &RunConfig, mut request: UploadRequest) -> Result<()> {
    request.namespace = std::fs::read_to_string(config.namespace_path())
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let auth_blob = match (&request.oci_model_uri, &request.oci_registry_secret) {
        (Some(_), Some(secret)) => {
            Some(registry_auth_blob(&secret_store(config)?, secret).await?)
        }
        (Some(_), None) => anyhow::bail!("--oci-model-uri requires --oci-registry-secret"),
        _ => None,
    };

    let mut uploader = ModelUploader::new(Arc::new(SkopeoImageTool::default()), config.retry);
    if let Some(api_url) = &request.registry_api_url {
        let token = std::fs::read_to_string(config.token_path()).unwrap_or_default();
        uploader = uploader.with_registry(Arc::new(HttpModelRegistry::new(
            api_url,
            token.trim().to_string(),
        )?));
    }

    let uploaded = uploader.upload(&request, auth_blob.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&uploaded)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "tuneflow",
            "--json",
            "run",
            "--volume-root",
            "/tmp/vols",
            "--max-parallel",
            "4",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                volume_root,
                max_parallel,
                ..
            } => {
                assert_eq!(volume_root, PathBuf::from("/tmp/vols"));
                assert_eq!(max_parallel, Some(4));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_mt_bench_defaults() {
        let cli = Cli::try_parse_from([
            "tuneflow",
            "mt-bench",
            "--models-folder",
            "/out/candidates",
            "-o",
            "/out/report.json",
            "-q",
            "/data/question.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::MtBench {
                max_workers,
                parallelism,
                no_promote,
                ..
            } => {
                assert_eq!(max_workers, "auto");
                assert_eq!(parallelism, 0);
                assert!(!no_promote);
            }
            _ => panic!("expected mt-bench"),
        }
    }

    #[test]
    fn test_load_params_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"run_name": "nightly"}"#).unwrap();

        let params = load_params(Some(&path)).unwrap();
        assert_eq!(params.run_name, "nightly");
        assert_eq!(params.sdg_volume(), "nightly-sdg");
        assert_eq!(params.artifact_root, TrainingParams::default().artifact_root);
    }

    #[test]
    fn test_load_params_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_params(Some(&path)).is_err());
    }

    #[test]
    fn test_default_workflow_plans() {
        let config = RunConfig::default();
        let graph = training_graph(&config, &TrainingParams::default()).unwrap();
        let plan = graph.plan().unwrap();

        assert_eq!(plan.len(), graph.len());
        assert_eq!(plan[0].id, "prerequisites-check");
        assert_eq!(plan[0].level, 0);
    }

    #[test]
    fn test_promote_from_report() {
        use tuneflow_core::reporting::write_aggregate_report;
        use tuneflow_core::{AggregateReport, CandidateScoreReport, PROMOTED_ALIAS, REPORT_TITLE};

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("samples_1")).unwrap();
        std::fs::create_dir(dir.path().join("samples_2")).unwrap();
        let report = |name: &str, score: f64| CandidateScoreReport {
            report_title: REPORT_TITLE.to_string(),
            model: dir.path().join(name).display().to_string(),
            judge_model: "judge".to_string(),
            overall_score: score,
            turn_scores: vec![score],
            qa_scores: vec![],
            error_rate: 0.0,
        };
        let aggregate = AggregateReport {
            best_model: "samples_2".to_string(),
            best_score: 7.5,
            reports: vec![report("samples_1", 6.0), report("samples_2", 7.5)],
        };
        let report_path = dir.path().join("report.json");
        write_aggregate_report(&report_path, &aggregate).unwrap();

        cmd_promote(&report_path, dir.path()).unwrap();
        assert!(dir.path().join(PROMOTED_ALIAS).is_dir());
        assert!(dir.path().join("samples_1").is_dir());
        assert!(!dir.path().join("samples_2").exists());
    }
}
