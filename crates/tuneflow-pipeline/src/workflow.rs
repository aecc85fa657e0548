//! The canonical synthetic-data → training → evaluation → publish workflow.
//!
//! ```text
//! prerequisites ─┬─ create {run}-sdg ──── sdg ─┬─ taxonomy-export
//!                │                             ├─ sdg-export
//!                ├─ create {run}-model-cache   │
//!                ├─ model-import ─ model-to-volume
//!                │                     └─ data-processing ─┬─ skills/knowledge exports
//!                ├─ create {run}-output        └─ training-phase-1 ─ training-phase-2
//!                │                                   └─ mt-bench ─┬─ final-eval ─ branch exports, metrics
//!                │                                                ├─ upload-model
//!                │                                                └─ mt-bench-export
//!                └─ delete-* after every stage mounting the volume
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use tuneflow_core::upload::ImageTool;
use tuneflow_core::{RunConfig, SecretStore, ServeCommand, PROMOTED_ALIAS};

use crate::error::PipelineResult;
use crate::functions::{
    ExportArtifact, MetricsReport, ModelImport, ModelToVolume, MtBench, PrerequisitesCheck,
    UploadModel,
};
use crate::graph::StageGraph;
use crate::stage::{MountAccess, Stage, StageFunction, VolumeSpec};

pub const SDG_MOUNT: &str = "/data";
pub const MODEL_MOUNT: &str = "/model";
pub const OUTPUT_MOUNT: &str = "/output";
/// Final-eval sees the synthetic-data volume here.
pub const EVAL_INPUT_MOUNT: &str = "/input";

pub const CANDIDATES_DIR: &str = "/output/phase_2/model/hf_format";
pub const MT_BENCH_OUTPUT: &str = "/output/mt_bench_data.json";

const DEFAULT_WORKLOAD_IMAGE: &str =
    "registry.redhat.io/rhelai1/instructlab-nvidia-rhel9:1.4.1-1739870750";

/// Hyperparameters of one training phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseParams {
    pub num_epochs: u32,
    pub effective_batch_size: u32,
    pub learning_rate: f64,
    pub num_warmup_steps: u32,
}

/// Workflow inputs. Missing fields take the defaults of a standard run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Prefix for run-scoped volume names.
    pub run_name: String,
    /// Base model directory.
    pub base_model: PathBuf,
    /// Host directory receiving exported artifacts.
    pub artifact_root: PathBuf,
    pub workload_image: String,

    pub sdg_repo_url: Option<String>,
    pub sdg_repo_branch: Option<String>,
    pub sdg_repo_pr: Option<u64>,
    pub sdg_teacher_secret: Option<String>,
    pub sdg_scale_factor: u32,
    pub sdg_pipeline: String,
    pub sdg_max_batch_len: u32,
    pub sdg_sample_size: f64,

    pub train_gpu_identifier: String,
    pub train_gpu_per_worker: u32,
    pub train_cpu_per_worker: String,
    pub train_memory_per_worker: String,
    pub train_num_workers: u32,
    pub train_phase_1: PhaseParams,
    pub train_phase_2: PhaseParams,
    pub train_save_samples: u64,
    pub train_max_batch_len: u32,
    pub train_seed: u64,

    pub mt_bench_questions: PathBuf,
    pub mt_bench_max_workers: String,
    pub mt_bench_merge_system_user_message: bool,

    pub final_eval_max_workers: String,
    pub final_eval_few_shots: u32,
    pub final_eval_batch_size: String,
    pub final_eval_merge_system_user_message: bool,

    pub eval_gpu_identifier: String,
    pub eval_judge_secret: Option<String>,

    pub output_oci_model_uri: Option<String>,
    pub output_oci_registry_secret: Option<String>,
    pub output_model_name: Option<String>,
    pub output_model_version: Option<String>,
    pub output_model_registry_name: Option<String>,
    pub output_model_registry_api_url: Option<String>,
    pub output_modelcar_base_image: String,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            run_name: "tuneflow".to_string(),
            base_model: PathBuf::from("/models/base"),
            artifact_root: PathBuf::from("artifacts"),
            workload_image: DEFAULT_WORKLOAD_IMAGE.to_string(),
            sdg_repo_url: None,
            sdg_repo_branch: None,
            sdg_repo_pr: None,
            sdg_teacher_secret: Some("teacher-secret".to_string()),
            sdg_scale_factor: 30,
            sdg_pipeline: "/usr/share/instructlab/sdg/pipelines/agentic".to_string(),
            sdg_max_batch_len: 5000,
            sdg_sample_size: 1.0,
            train_gpu_identifier: "nvidia.com/gpu".to_string(),
            train_gpu_per_worker: 2,
            train_cpu_per_worker: "2".to_string(),
            train_memory_per_worker: "2Gi".to_string(),
            train_num_workers: 2,
            train_phase_1: PhaseParams {
                num_epochs: 7,
                effective_batch_size: 128,
                learning_rate: 2e-5,
                num_warmup_steps: 1000,
            },
            train_phase_2: PhaseParams {
                num_epochs: 10,
                effective_batch_size: 3840,
                learning_rate: 6e-6,
                num_warmup_steps: 1000,
            },
            train_save_samples: 250_000,
            train_max_batch_len: 5000,
            train_seed: 42,
            mt_bench_questions: PathBuf::from("/data/mt_bench/question.jsonl"),
            mt_bench_max_workers: "auto".to_string(),
            mt_bench_merge_system_user_message: false,
            final_eval_max_workers: "auto".to_string(),
            final_eval_few_shots: 5,
            final_eval_batch_size: "auto".to_string(),
            final_eval_merge_system_user_message: false,
            eval_gpu_identifier: "nvidia.com/gpu".to_string(),
            eval_judge_secret: Some("judge-secret".to_string()),
            output_oci_model_uri: None,
            output_oci_registry_secret: None,
            output_model_name: None,
            output_model_version: None,
            output_model_registry_name: None,
            output_model_registry_api_url: None,
            output_modelcar_base_image: "registry.access.redhat.com/ubi9-micro:latest".to_string(),
        }
    }
}

impl TrainingParams {
    pub fn sdg_volume(&self) -> String {
        format!("{}-sdg", self.run_name)
    }

    pub fn model_volume(&self) -> String {
        format!("{}-model-cache", self.run_name)
    }

    pub fn output_volume(&self) -> String {
        format!("{}-output", self.run_name)
    }
}

/// Function implementations the workflow's in-process stages call.
#[derive(Clone)]
pub struct WorkflowFunctions {
    pub prerequisites: Arc<dyn StageFunction>,
    pub model_import: Arc<dyn StageFunction>,
    pub model_to_volume: Arc<dyn StageFunction>,
    pub mt_bench: Arc<dyn StageFunction>,
    pub upload: Arc<dyn StageFunction>,
    pub export: Arc<dyn StageFunction>,
    pub metrics: Arc<dyn StageFunction>,
}

impl WorkflowFunctions {
    pub fn new(
        config: &RunConfig,
        secrets: SecretStore,
        images: Arc<dyn ImageTool>,
        serve_command: ServeCommand,
    ) -> Self {
        Self {
            prerequisites: Arc::new(PrerequisitesCheck::new(config.clone(), secrets.clone())),
            model_import: Arc::new(ModelImport),
            model_to_volume: Arc::new(ModelToVolume),
            mt_bench: Arc::new(MtBench::new(config.clone(), secrets.clone(), serve_command)),
            upload: Arc::new(UploadModel::new(config.clone(), secrets, images)),
            export: Arc::new(ExportArtifact),
            metrics: Arc::new(MetricsReport),
        }
    }
}

fn training_stage(id: &str, phase: u32, p: &TrainingParams, hp: &PhaseParams) -> Stage {
    let model = if phase == 1 {
        MODEL_MOUNT.to_string()
    } else {
        format!("{}/phase_1/model/hf_format", OUTPUT_MOUNT)
    };
    let args = vec![
        "--nnodes".to_string(),
        p.train_num_workers.to_string(),
        "--nproc_per_node".to_string(),
        p.train_gpu_per_worker.to_string(),
        "-m".to_string(),
        "instructlab.training.main_ds".to_string(),
        "--model_name_or_path".to_string(),
        model,
        "--data_path".to_string(),
        format!("{}/processed_data/{}", SDG_MOUNT, if phase == 1 { "knowledge" } else { "skills" }),
        "--output_dir".to_string(),
        format!("{}/phase_{}", OUTPUT_MOUNT, phase),
        "--num_epochs".to_string(),
        hp.num_epochs.to_string(),
        "--effective_batch_size".to_string(),
        hp.effective_batch_size.to_string(),
        "--learning_rate".to_string(),
        hp.learning_rate.to_string(),
        "--num_warmup_steps".to_string(),
        hp.num_warmup_steps.to_string(),
        "--save_samples".to_string(),
        p.train_save_samples.to_string(),
        "--max_batch_len".to_string(),
        p.train_max_batch_len.to_string(),
        "--seed".to_string(),
        p.train_seed.to_string(),
    ];
    Stage::container(id, &p.workload_image, &["torchrun"], args)
        .mount(p.sdg_volume(), SDG_MOUNT, MountAccess::ReadOnly)
        .mount(p.model_volume(), MODEL_MOUNT, MountAccess::ReadOnly)
        .mount(p.output_volume(), OUTPUT_MOUNT, MountAccess::ReadWrite)
        .accelerator(&p.train_gpu_identifier, p.train_gpu_per_worker)
        .cpu(&p.train_cpu_per_worker)
        .memory(&p.train_memory_per_worker)
        .caching(false)
}

fn export_stage(
    id: &str,
    functions: &WorkflowFunctions,
    volume: String,
    mount: &str,
    source: &str,
    dest: PathBuf,
) -> Stage {
    Stage::function(
        id,
        functions.export.clone(),
        json!({ "source": source, "dest": dest }),
    )
    .mount(volume, mount, MountAccess::ReadOnly)
    .caching(false)
}

/// Build the full training workflow graph. The result is validated.
pub fn build_training_workflow(
    params: &TrainingParams,
    config: &RunConfig,
    functions: &WorkflowFunctions,
) -> PipelineResult<StageGraph> {
    let p = params;
    let (sdg, model, output) = (p.sdg_volume(), p.model_volume(), p.output_volume());
    let volume = |name: &str| VolumeSpec::shared(name, &config.storage_class, &config.storage_size);
    let artifacts = &p.artifact_root;
    let mut g = StageGraph::new();

    g.add_stage(Stage::function(
        "prerequisites-check",
        functions.prerequisites.clone(),
        json!({
            "judge_secret": p.eval_judge_secret,
            "teacher_secret": p.sdg_teacher_secret,
            "oci_registry_secret": p.output_oci_registry_secret,
        }),
    ))?;

    for (id, name) in [
        ("create-sdg-volume", &sdg),
        ("create-model-volume", &model),
        ("create-output-volume", &output),
    ] {
        g.add_stage(Stage::create_volume(id, volume(name)).after(&["prerequisites-check"]))?;
    }

    let mut sdg_args = vec![
        "--num-instructions".to_string(),
        p.sdg_scale_factor.to_string(),
        "--pipeline".to_string(),
        p.sdg_pipeline.clone(),
        "--batch-size".to_string(),
        config.sdg_batch_size.to_string(),
        "--num-cpus".to_string(),
        config.sdg_num_workers.to_string(),
        "--sample-size".to_string(),
        p.sdg_sample_size.to_string(),
        "--output".to_string(),
        SDG_MOUNT.to_string(),
    ];
    for (flag, value) in [
        ("--repo-url", p.sdg_repo_url.clone()),
        ("--repo-branch", p.sdg_repo_branch.clone()),
        ("--repo-pr", p.sdg_repo_pr.map(|n| n.to_string())),
    ] {
        if let Some(v) = value {
            sdg_args.extend([flag.to_string(), v]);
        }
    }
    g.add_stage(
        Stage::container(
            "sdg",
            &p.workload_image,
            &["python3", "-m", "instructlab.sdg"],
            sdg_args,
        )
            .after(&["prerequisites-check", "create-sdg-volume"])
            .mount(&sdg, SDG_MOUNT, MountAccess::ReadWrite)
            .caching(false),
    )?;

    g.add_stage(
        export_stage(
            "taxonomy-export",
            functions,
            sdg.clone(),
            SDG_MOUNT,
            "/data/taxonomy",
            artifacts.join("taxonomy"),
        )
        .after(&["sdg"]),
    )?;
    g.add_stage(
        export_stage(
            "sdg-export",
            functions,
            sdg.clone(),
            SDG_MOUNT,
            "/data/sdg",
            artifacts.join("sdg"),
        )
        .after(&["sdg"]),
    )?;

    g.add_stage(
        Stage::function(
            "model-import",
            functions.model_import.clone(),
            json!({ "source": p.base_model }),
        )
        .after(&["prerequisites-check"]),
    )?;
    g.add_stage(
        Stage::function(
            "model-to-volume",
            functions.model_to_volume.clone(),
            json!({ "source": p.base_model, "dest": MODEL_MOUNT }),
        )
        .after(&["model-import", "create-model-volume"])
        .mount(&model, MODEL_MOUNT, MountAccess::ReadWrite)
        .caching(false),
    )?;

    g.add_stage(
        Stage::container(
            "data-processing",
            &p.workload_image,
            &["python3", "-m", "instructlab.training.data_process"],
            vec![
                "--data-dir".to_string(),
                SDG_MOUNT.to_string(),
                "--model".to_string(),
                MODEL_MOUNT.to_string(),
                "--max-batch-len".to_string(),
                p.sdg_max_batch_len.to_string(),
            ],
        )
        .after(&["model-to-volume", "sdg"])
        .mount(&model, MODEL_MOUNT, MountAccess::ReadOnly)
        .mount(&sdg, SDG_MOUNT, MountAccess::ReadWrite)
        .caching(false),
    )?;
    for (id, dir) in [
        ("skills-data-export", "skills"),
        ("knowledge-data-export", "knowledge"),
    ] {
        g.add_stage(
            export_stage(
                id,
                functions,
                sdg.clone(),
                SDG_MOUNT,
                &format!("{}/processed_data/{}", SDG_MOUNT, dir),
                artifacts.join(format!("{}_processed_data", dir)),
            )
            .after(&["data-processing"]),
        )?;
    }

    g.add_stage(
        training_stage("training-phase-1", 1, p, &p.train_phase_1)
            .after(&["data-processing", "model-to-volume", "create-output-volume"]),
    )?;
    g.add_stage(
        training_stage("training-phase-2", 2, p, &p.train_phase_2).after(&["training-phase-1"]),
    )?;

    g.add_stage(
        Stage::function(
            "mt-bench",
            functions.mt_bench.clone(),
            json!({
                "models_folder": CANDIDATES_DIR,
                "output_path": MT_BENCH_OUTPUT,
                "questions_path": p.mt_bench_questions,
                "max_workers": p.mt_bench_max_workers,
                "merge_system_user_message": p.mt_bench_merge_system_user_message,
                "judge_secret": p.eval_judge_secret,
                "parallelism": 0,
            }),
        )
        .after(&["training-phase-2"])
        .mount(&output, OUTPUT_MOUNT, MountAccess::ReadWrite)
        .mount(&sdg, SDG_MOUNT, MountAccess::ReadOnly)
        .accelerator(&p.eval_gpu_identifier, 1)
        .caching(false),
    )?;

    let candidate = format!("{}/{}", CANDIDATES_DIR, PROMOTED_ALIAS);
    let mut eval_args = vec![
        "--candidate-model".to_string(),
        candidate.clone(),
        "--base-model-dir".to_string(),
        format!("{}/", MODEL_MOUNT),
        "--max-workers".to_string(),
        p.final_eval_max_workers.clone(),
        "--few-shots".to_string(),
        p.final_eval_few_shots.to_string(),
        "--batch-size".to_string(),
        p.final_eval_batch_size.clone(),
        "--output".to_string(),
        OUTPUT_MOUNT.to_string(),
    ];
    if p.final_eval_merge_system_user_message {
        eval_args.push("--merge-system-user-message".to_string());
    }
    if let Some(branch) = &p.sdg_repo_branch {
        eval_args.extend(["--branch".to_string(), branch.clone()]);
    }
    g.add_stage(
        Stage::container(
            "final-eval",
            &p.workload_image,
            &["python3", "-m", "instructlab.eval"],
            eval_args,
        )
        .after(&["mt-bench"])
        .mount(&output, OUTPUT_MOUNT, MountAccess::ReadWrite)
        .mount(&sdg, EVAL_INPUT_MOUNT, MountAccess::ReadOnly)
        .mount(&model, MODEL_MOUNT, MountAccess::ReadOnly)
        .accelerator(&p.eval_gpu_identifier, 1)
        .caching(false),
    )?;

    g.add_stage(
        Stage::function(
            "upload-model",
            functions.upload.clone(),
            json!({
                "model_dir": candidate,
                "artifact_dir": artifacts.join("model"),
                "oci_model_uri": p.output_oci_model_uri,
                "oci_registry_secret": p.output_oci_registry_secret,
                "modelcar_base_image": p.output_modelcar_base_image,
                "oci_temp_dir": OUTPUT_MOUNT,
                "registry_api_url": p.output_model_registry_api_url,
                "registry_name": p.output_model_registry_name,
                "model_name": p.output_model_name,
                "model_version": p.output_model_version,
                "run_name": p.run_name,
            }),
        )
        .after(&["mt-bench"])
        .mount(&output, OUTPUT_MOUNT, MountAccess::ReadWrite)
        .caching(false),
    )?;

    for (id, after, source, dest) in [
        ("mt-bench-export", "mt-bench", MT_BENCH_OUTPUT, "mt_bench.json"),
        (
            "mt-bench-branch-export",
            "final-eval",
            "/output/mt_bench_branch/mt_bench_branch_data.json",
            "mt_bench_branch.json",
        ),
        (
            "mmlu-branch-export",
            "final-eval",
            "/output/mmlu_branch/mmlu_branch_data.json",
            "mmlu_branch.json",
        ),
    ] {
        g.add_stage(
            export_stage(id, functions, output.clone(), OUTPUT_MOUNT, source, artifacts.join(dest))
                .after(&[after]),
        )?;
    }

    g.add_stage(
        Stage::function(
            "metrics-report",
            functions.metrics.clone(),
            json!({
                "mt_bench_path": MT_BENCH_OUTPUT,
                "output_path": "/output/metrics/scores.md",
            }),
        )
        .after(&["final-eval"])
        .mount(&output, OUTPUT_MOUNT, MountAccess::ReadWrite)
        .caching(false),
    )?;

    for (id, name, creator) in [
        ("delete-sdg-volume", &sdg, "create-sdg-volume"),
        ("delete-model-volume", &model, "create-model-volume"),
        ("delete-output-volume", &output, "create-output-volume"),
    ] {
        let mut holders = g.holders_of(name);
        holders.push(creator.to_string());
        g.add_stage(Stage::delete_volume(id, name.as_str()).after(&holders))?;
    }

    g.validate()?;
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tuneflow_core::secrets::fakes::MemorySecretBackend;
    use tuneflow_core::upload::fakes::RecordingImageTool;
    use tuneflow_core::RetryPolicy;

    fn functions(config: &RunConfig) -> WorkflowFunctions {
        let secrets = SecretStore::new(
            Arc::new(MemorySecretBackend::new("ns")),
            RetryPolicy::default(),
        );
        WorkflowFunctions::new(
            config,
            secrets,
            Arc::new(RecordingImageTool::default()),
            ServeCommand::vllm(),
        )
    }

    fn build() -> StageGraph {
        let config = RunConfig::default();
        build_training_workflow(&TrainingParams::default(), &config, &functions(&config)).unwrap()
    }

    #[test]
    fn test_workflow_validates_and_orders() {
        let graph = build();
        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        let pos = |id: &str| order.iter().position(|s| *s == id).unwrap();

        assert_eq!(order[0], "prerequisites-check");
        assert!(pos("sdg") < pos("data-processing"));
        assert!(pos("training-phase-1") < pos("training-phase-2"));
        assert!(pos("training-phase-2") < pos("mt-bench"));
        assert!(pos("mt-bench") < pos("upload-model"));
        assert!(pos("final-eval") < pos("metrics-report"));
    }

    #[test]
    fn test_volume_deletes_wait_for_every_holder() {
        let graph = build();
        let params = TrainingParams::default();
        for (delete, volume) in [
            ("delete-sdg-volume", params.sdg_volume()),
            ("delete-output-volume", params.output_volume()),
        ] {
            let upstream = graph.ancestors(delete);
            for holder in graph.holders_of(&volume) {
                assert!(upstream.contains(&holder), "{} must wait for {}", delete, holder);
            }
        }
        // Async exports hold the sdg volume too.
        assert!(graph.ancestors("delete-sdg-volume").contains("sdg-export"));
    }

    #[test]
    fn test_side_effect_stages_disable_caching() {
        let graph = build();
        for id in [
            "sdg",
            "model-to-volume",
            "training-phase-2",
            "mt-bench",
            "upload-model",
            "create-output-volume",
            "delete-model-volume",
        ] {
            assert!(!graph.get(id).unwrap().caching, "{} must not cache", id);
        }
        assert!(graph.get("prerequisites-check").unwrap().caching);
    }

    #[test]
    fn test_mt_bench_claims_one_accelerator() {
        let graph = build();
        let stage = graph.get("mt-bench").unwrap();
        let accel = stage.resources.accelerator.as_ref().unwrap();
        assert_eq!(accel.count, 1);
        let args: Value = stage.work.describe()["args"].clone();
        assert_eq!(args["models_folder"], CANDIDATES_DIR);
    }

    #[test]
    fn test_params_deserialize_with_defaults() {
        let params: TrainingParams =
            serde_json::from_str(r#"{"run_name": "r1", "train_seed": 7}"#).unwrap();
        assert_eq!(params.run_name, "r1");
        assert_eq!(params.train_seed, 7);
        assert_eq!(params.sdg_scale_factor, 30);
        assert_eq!(params.output_volume(), "r1-output");
    }
}
