//! In-process stage functions backed by `tuneflow-core`.
//!
//! Each function takes its arguments as JSON so the stage description stays
//! serializable, and resolves mount-relative paths through the
//! [`StageContext`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use tuneflow_core::campaign::{run_campaign, CampaignOptions};
use tuneflow_core::upload::{
    copy_model_dir, model_files, registry_auth_blob, HttpModelRegistry, ImageTool, ModelUploader,
    UploadRequest,
};
use tuneflow_core::{reporting, EndpointRole, RunConfig, SecretStore, ServeCommand, WorkerCount};

use crate::stage::{StageContext, StageFunction};

fn parse_args<T: for<'de> Deserialize<'de>>(name: &str, args: &Value) -> anyhow::Result<T> {
    serde_json::from_value(args.clone()).with_context(|| format!("invalid arguments for {}", name))
}

/// Checks configuration and credentials before any volume is created.
pub struct PrerequisitesCheck {
    config: RunConfig,
    secrets: SecretStore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrerequisitesArgs {
    pub judge_secret: Option<String>,
    pub teacher_secret: Option<String>,
    pub oci_registry_secret: Option<String>,
}

impl PrerequisitesCheck {
    pub const NAME: &'static str = "prerequisites-check";

    pub fn new(config: RunConfig, secrets: SecretStore) -> Self {
        Self { config, secrets }
    }
}

#[async_trait]
impl StageFunction for PrerequisitesCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, _ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: PrerequisitesArgs = parse_args(Self::NAME, args)?;
        self.config.validate()?;

        for (role, secret) in [
            (EndpointRole::Judge, &args.judge_secret),
            (EndpointRole::Teacher, &args.teacher_secret),
        ] {
            let creds = self
                .secrets
                .endpoint_credentials(secret.as_deref(), role, &self.config)
                .await?;
            if creds.endpoint.is_none() || creds.model.is_none() {
                bail!("{:?} endpoint and model must be set by secret or environment", role);
            }
        }

        if self.config.publish.oci_model_uri.is_some() {
            let secret = args
                .oci_registry_secret
                .as_deref()
                .or(self.config.publish.oci_registry_secret.as_deref())
                .context("OCI upload requires a registry secret")?;
            registry_auth_blob(&self.secrets, secret).await?;
        }
        info!("prerequisites satisfied");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSourceArgs {
    pub source: PathBuf,
    #[serde(default)]
    pub dest: Option<PathBuf>,
}

/// Confirms the base model exists and holds files.
pub struct ModelImport;

impl ModelImport {
    pub const NAME: &'static str = "model-import";
}

#[async_trait]
impl StageFunction for ModelImport {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: ModelSourceArgs = parse_args(Self::NAME, args)?;
        let source = ctx.resolve(&args.source);
        let files = tokio::task::spawn_blocking(move || model_files(&source)).await??;
        if files.is_empty() {
            bail!("base model {} has no files", args.source.display());
        }
        info!(source = %args.source.display(), files = files.len(), "base model imported");
        Ok(())
    }
}

/// Copies the base model onto the model-cache volume.
pub struct ModelToVolume;

impl ModelToVolume {
    pub const NAME: &'static str = "model-to-volume";
}

#[async_trait]
impl StageFunction for ModelToVolume {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: ModelSourceArgs = parse_args(Self::NAME, args)?;
        let dest = args.dest.clone().context("model-to-volume needs a destination")?;
        let (src, dest) = (ctx.resolve(&args.source), ctx.resolve(&dest));
        let copied = tokio::task::spawn_blocking(move || copy_model_dir(&src, &dest)).await??;
        info!(files = copied, "model copied to volume");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtBenchArgs {
    pub models_folder: PathBuf,
    pub output_path: PathBuf,
    pub questions_path: PathBuf,
    #[serde(default = "default_workers")]
    pub max_workers: String,
    #[serde(default)]
    pub merge_system_user_message: bool,
    #[serde(default)]
    pub judge_secret: Option<String>,
    #[serde(default)]
    pub parallelism: u32,
}

fn default_workers() -> String {
    "auto".to_string()
}

/// Serves, scores and promotes every candidate checkpoint.
pub struct MtBench {
    config: RunConfig,
    secrets: SecretStore,
    serve_command: ServeCommand,
}

impl MtBench {
    pub const NAME: &'static str = "mt-bench";

    pub fn new(config: RunConfig, secrets: SecretStore, serve_command: ServeCommand) -> Self {
        Self {
            config,
            secrets,
            serve_command,
        }
    }
}

#[async_trait]
impl StageFunction for MtBench {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: MtBenchArgs = parse_args(Self::NAME, args)?;
        let judge = self
            .secrets
            .endpoint_credentials(args.judge_secret.as_deref(), EndpointRole::Judge, &self.config)
            .await?;
        let options = CampaignOptions {
            questions_path: ctx.resolve(&args.questions_path),
            workers: args.max_workers.parse::<WorkerCount>()?,
            parallelism: args.parallelism,
            serve_command: self.serve_command.clone(),
            judge,
            merge_system_user_message: args.merge_system_user_message,
            promote: true,
        };

        let outcome = run_campaign(
            &self.config,
            &ctx.resolve(&args.models_folder),
            &ctx.resolve(&args.output_path),
            options,
        )
        .await?;
        info!(
            best_model = %outcome.aggregate.best_model,
            best_score = outcome.aggregate.best_score,
            skipped = outcome.skipped.len(),
            "mt-bench complete"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadArgs {
    pub model_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub oci_model_uri: Option<String>,
    pub oci_registry_secret: Option<String>,
    pub modelcar_base_image: Option<String>,
    pub oci_temp_dir: Option<PathBuf>,
    pub registry_api_url: Option<String>,
    pub registry_name: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub run_name: Option<String>,
}

/// Publishes the promoted model and records where it went.
pub struct UploadModel {
    config: RunConfig,
    secrets: SecretStore,
    images: Arc<dyn ImageTool>,
}

impl UploadModel {
    pub const NAME: &'static str = "upload-model";

    pub fn new(config: RunConfig, secrets: SecretStore, images: Arc<dyn ImageTool>) -> Self {
        Self {
            config,
            secrets,
            images,
        }
    }

    async fn read_optional(path: &Path) -> Option<String> {
        tokio::fs::read_to_string(path)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl StageFunction for UploadModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: UploadArgs = parse_args(Self::NAME, args)?;

        let request = UploadRequest {
            model_dir: ctx.resolve(&args.model_dir),
            artifact_dir: args.artifact_dir.clone(),
            oci_model_uri: args.oci_model_uri.clone(),
            oci_registry_secret: args.oci_registry_secret.clone(),
            modelcar_base_image: args.modelcar_base_image.clone(),
            oci_temp_dir: args.oci_temp_dir.as_ref().map(|p| ctx.resolve(p)),
            registry_api_url: args.registry_api_url.clone(),
            registry_name: args.registry_name.clone(),
            model_name: args.model_name.clone(),
            model_version: args.model_version.clone(),
            run_id: Some(ctx.run_id.clone()),
            run_name: args.run_name.clone(),
            namespace: Self::read_optional(&self.config.namespace_path()).await,
        };

        let auth_blob = match (&request.oci_model_uri, &request.oci_registry_secret) {
            (Some(_), Some(secret)) => Some(registry_auth_blob(&self.secrets, secret).await?),
            (Some(_), None) => bail!("OCI upload requires a registry secret"),
            _ => None,
        };

        let mut uploader = ModelUploader::new(self.images.clone(), self.config.retry);
        if let Some(api_url) = &request.registry_api_url {
            let token = Self::read_optional(&self.config.token_path())
                .await
                .unwrap_or_default();
            uploader = uploader.with_registry(Arc::new(HttpModelRegistry::new(api_url, token)?));
        }

        let uploaded = uploader.upload(&request, auth_blob.as_deref()).await?;
        let record = args.artifact_dir.with_extension("json");
        if let Some(parent) = record.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&record, serde_json::to_string_pretty(&uploaded)?)
            .await
            .with_context(|| format!("write {:?}", record))?;
        info!(uri = %uploaded.uri, "model published");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArgs {
    /// Path on a mounted volume.
    pub source: PathBuf,
    /// Destination outside the run's volumes.
    pub dest: PathBuf,
}

/// Copies a file or directory off a run-scoped volume.
pub struct ExportArtifact;

impl ExportArtifact {
    pub const NAME: &'static str = "export-artifact";
}

#[async_trait]
impl StageFunction for ExportArtifact {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: ExportArgs = parse_args(Self::NAME, args)?;
        let source = ctx.resolve(&args.source);
        let dest = args.dest.clone();

        let meta = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("export source {:?}", source))?;
        if meta.is_dir() {
            tokio::task::spawn_blocking(move || copy_model_dir(&source, &dest)).await??;
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&source, &dest).await?;
        }
        info!(source = %args.source.display(), dest = %args.dest.display(), "artifact exported");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsArgs {
    pub mt_bench_path: PathBuf,
    pub output_path: PathBuf,
}

/// Renders the candidate score table for the run.
pub struct MetricsReport;

impl MetricsReport {
    pub const NAME: &'static str = "metrics-report";
}

#[async_trait]
impl StageFunction for MetricsReport {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, ctx: &StageContext, args: &Value) -> anyhow::Result<()> {
        let args: MetricsArgs = parse_args(Self::NAME, args)?;
        let report = reporting::read_aggregate_report(&ctx.resolve(&args.mt_bench_path))?;
        let output = ctx.resolve(&args.output_path);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&output, reporting::render_scores_md(&report))
            .await
            .with_context(|| format!("write {:?}", output))?;
        Ok(())
    }
}
