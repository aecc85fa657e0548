//! Publishing the promoted model.
//!
//! Either as a modelcar OCI image (base image pulled, model files layered on
//! top, pushed with registry credentials) or as a plain directory copy, then
//! optionally registered with a model registry.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::info;

use crate::domain::error::{Result, TuneflowError};
use crate::retry::RetryPolicy;
use crate::secrets::{SecretRequirement, SecretStore};

/// Model format recorded in the registry.
pub const MODEL_FORMAT: &str = "vLLM";

const DOCKER_CONFIG_JSON: &str = ".dockerconfigjson";
const DOCKER_CFG: &str = ".dockercfg";

/// Strip a leading `oci://` or `docker://` transport prefix.
pub fn strip_transport(uri: &str) -> &str {
    uri.strip_prefix("oci://")
        .or_else(|| uri.strip_prefix("docker://"))
        .unwrap_or(uri)
}

/// Registry name from an API URL: first host label without a `-rest` suffix.
pub fn registry_name_from_url(api_url: &str) -> Result<String> {
    let url = parse_api_url(api_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| TuneflowError::InvalidConfig(format!("no host in {}", api_url)))?;
    let label = host.split('.').next().unwrap_or(host);
    Ok(label.strip_suffix("-rest").unwrap_or(label).to_string())
}

/// Port from an API URL, 80 for `http` and 443 otherwise when absent.
pub fn registry_port(api_url: &str) -> Result<u16> {
    let url = parse_api_url(api_url)?;
    Ok(url
        .port()
        .unwrap_or(if url.scheme() == "http" { 80 } else { 443 }))
}

fn parse_api_url(api_url: &str) -> Result<reqwest::Url> {
    let with_scheme = if api_url.contains("://") {
        api_url.to_string()
    } else {
        format!("https://{}", api_url)
    };
    reqwest::Url::parse(&with_scheme)
        .map_err(|e| TuneflowError::InvalidConfig(format!("invalid registry URL {}: {}", api_url, e)))
}

/// Registry push credentials from a registry secret.
pub async fn registry_auth_blob(store: &SecretStore, secret_name: &str) -> Result<String> {
    let values = store
        .fetch(
            secret_name,
            &[DOCKER_CONFIG_JSON, DOCKER_CFG],
            SecretRequirement::Optional,
        )
        .await?;
    values
        .get(DOCKER_CONFIG_JSON)
        .or_else(|| values.get(DOCKER_CFG))
        .map(str::to_string)
        .ok_or_else(|| TuneflowError::SecretFieldMissing {
            secret: secret_name.to_string(),
            field: DOCKER_CONFIG_JSON.to_string(),
        })
}

/// Every regular file under `dir`, sorted.
pub fn model_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Copy the contents of `src` into `dest` entry by entry.
pub fn copy_model_dir(src: &Path, dest: &Path) -> Result<u64> {
    std::fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_model_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Container image operations on a local OCI layout.
#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn pull(&self, image: &str, oci_dir: &Path) -> Result<()>;

    async fn append_layers(&self, oci_dir: &Path, files: &[PathBuf]) -> Result<()>;

    async fn push(&self, oci_dir: &Path, destination: &str, authfile: &Path) -> Result<()>;
}

/// `skopeo` for transport and `olot` for layering.
#[derive(Debug, Clone)]
pub struct SkopeoImageTool {
    pub skopeo: String,
    pub olot: String,
}

impl Default for SkopeoImageTool {
    fn default() -> Self {
        Self {
            skopeo: "skopeo".to_string(),
            olot: "olot".to_string(),
        }
    }
}

async fn run_tool(program: &str, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(TuneflowError::TransientNetwork(format!(
            "{} exited with {:?}: {}",
            program,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn oci_ref(oci_dir: &Path) -> String {
    format!("oci:{}:latest", oci_dir.display())
}

#[async_trait]
impl ImageTool for SkopeoImageTool {
    async fn pull(&self, image: &str, oci_dir: &Path) -> Result<()> {
        let args = vec![
            "copy".to_string(),
            "--multi-arch".to_string(),
            "all".to_string(),
            "--remove-signatures".to_string(),
            format!("docker://{}", strip_transport(image)),
            oci_ref(oci_dir),
        ];
        run_tool(&self.skopeo, &args).await
    }

    async fn append_layers(&self, oci_dir: &Path, files: &[PathBuf]) -> Result<()> {
        let mut args = vec![oci_dir.display().to_string()];
        args.extend(files.iter().map(|f| f.display().to_string()));
        run_tool(&self.olot, &args).await
    }

    async fn push(&self, oci_dir: &Path, destination: &str, authfile: &Path) -> Result<()> {
        let args = vec![
            "copy".to_string(),
            "--dest-authfile".to_string(),
            authfile.display().to_string(),
            "--multi-arch".to_string(),
            "all".to_string(),
            oci_ref(oci_dir),
            format!("docker://{}", strip_transport(destination)),
        ];
        run_tool(&self.skopeo, &args).await
    }
}

/// Model registration request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRegistration {
    pub name: String,
    pub version: String,
    pub uri: String,
    pub format: String,
    pub metadata: BTreeMap<String, String>,
}

/// Identifiers assigned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredModel {
    pub registered_model_id: String,
    pub model_version_id: String,
}

#[async_trait]
pub trait ModelRegistryClient: Send + Sync {
    /// Register model, version and artifact; returns the registered model id.
    async fn register(&self, registration: &ModelRegistration) -> Result<String>;

    async fn version_id(&self, name: &str, version: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

/// Model registry REST client authenticated with the service-account token.
#[derive(Debug, Clone)]
pub struct HttpModelRegistry {
    client: reqwest::Client,
    base: String,
    token: String,
    author: String,
}

const REGISTRY_API: &str = "api/model_registry/v1alpha3";

impl HttpModelRegistry {
    pub fn new(api_url: &str, token: impl Into<String>) -> Result<Self> {
        let url = parse_api_url(api_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base: url.as_str().trim_end_matches('/').to_string(),
            token: token.into(),
            author: "Tuneflow Pipeline".to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base, REGISTRY_API, path)
    }

    async fn send_for_id(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TuneflowError::TransientNetwork(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TuneflowError::Registry(format!("HTTP {}: {}", status, body)));
        }
        let parsed: IdOnly = response.json().await?;
        Ok(parsed.id)
    }
}

#[async_trait]
impl ModelRegistryClient for HttpModelRegistry {
    async fn register(&self, registration: &ModelRegistration) -> Result<String> {
        let model_id = self
            .send_for_id(
                self.client
                    .post(self.url("registered_models"))
                    .json(&json!({ "name": registration.name })),
            )
            .await?;

        let custom_properties: serde_json::Map<String, serde_json::Value> = registration
            .metadata
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    json!({ "metadataType": "MetadataStringValue", "string_value": v }),
                )
            })
            .collect();
        let version_id = self
            .send_for_id(
                self.client
                    .post(self.url(&format!("registered_models/{}/versions", model_id)))
                    .json(&json!({
                        "name": registration.version,
                        "registeredModelId": model_id,
                        "author": self.author,
                        "customProperties": custom_properties,
                    })),
            )
            .await?;

        self.send_for_id(
            self.client
                .post(self.url(&format!("model_versions/{}/artifacts", version_id)))
                .json(&json!({
                    "artifactType": "model-artifact",
                    "name": registration.name,
                    "uri": registration.uri,
                    "modelFormatName": registration.format,
                })),
        )
        .await?;

        Ok(model_id)
    }

    async fn version_id(&self, name: &str, version: &str) -> Result<String> {
        let model_id = self
            .send_for_id(
                self.client
                    .get(self.url("registered_model"))
                    .query(&[("name", name)]),
            )
            .await?;
        self.send_for_id(
            self.client
                .get(self.url("model_version"))
                .query(&[("name", version), ("parentResourceId", model_id.as_str())]),
        )
        .await
    }
}

/// Where and how to publish.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Directory holding the promoted model.
    pub model_dir: PathBuf,
    /// Destination when no OCI URI is given.
    pub artifact_dir: PathBuf,
    pub oci_model_uri: Option<String>,
    pub oci_registry_secret: Option<String>,
    pub modelcar_base_image: Option<String>,
    /// Parent for the temporary OCI layout.
    pub oci_temp_dir: Option<PathBuf>,
    pub registry_api_url: Option<String>,
    pub registry_name: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub run_id: Option<String>,
    pub run_name: Option<String>,
    pub namespace: Option<String>,
}

/// Output artifact description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedModel {
    pub uri: String,
    pub metadata: BTreeMap<String, String>,
}

/// Publishes models with retried image and registry operations.
pub struct ModelUploader {
    images: Arc<dyn ImageTool>,
    registry: Option<Arc<dyn ModelRegistryClient>>,
    pull_retry: RetryPolicy,
    retry: RetryPolicy,
}

impl ModelUploader {
    pub fn new(images: Arc<dyn ImageTool>, retry: RetryPolicy) -> Self {
        Self {
            images,
            registry: None,
            pull_retry: RetryPolicy::fixed(retry.max_attempts, Duration::ZERO),
            retry,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ModelRegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_pull_retry(mut self, retry: RetryPolicy) -> Self {
        self.pull_retry = retry;
        self
    }

    /// Publish `request.model_dir`. `auth_blob` is required for OCI pushes.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        auth_blob: Option<&str>,
    ) -> Result<UploadedModel> {
        let uri = match &request.oci_model_uri {
            Some(oci_uri) => self.push_modelcar(request, oci_uri, auth_blob).await?,
            None => {
                let copied = copy_model_dir(&request.model_dir, &request.artifact_dir)?;
                info!(
                    from = %request.model_dir.display(),
                    to = %request.artifact_dir.display(),
                    files = copied,
                    "model copied to artifact path"
                );
                request.artifact_dir.display().to_string()
            }
        };

        let mut uploaded = UploadedModel {
            uri,
            metadata: BTreeMap::new(),
        };

        if let Some(api_url) = &request.registry_api_url {
            self.register(request, api_url, &mut uploaded).await?;
        }
        Ok(uploaded)
    }

    async fn push_modelcar(
        &self,
        request: &UploadRequest,
        oci_uri: &str,
        auth_blob: Option<&str>,
    ) -> Result<String> {
        let destination = strip_transport(oci_uri).to_string();
        let base_image = request.modelcar_base_image.as_deref().ok_or_else(|| {
            TuneflowError::InvalidConfig("modelcar base image is required for OCI upload".to_string())
        })?;
        let base_image = strip_transport(base_image).to_string();
        let auth_blob = auth_blob.ok_or_else(|| {
            TuneflowError::InvalidConfig("registry credentials are required for OCI upload".to_string())
        })?;

        let layout = match &request.oci_temp_dir {
            Some(parent) => tempfile::Builder::new().suffix("-modelcar").tempdir_in(parent)?,
            None => tempfile::Builder::new().suffix("-modelcar").tempdir()?,
        };
        let oci_dir = layout.path().to_path_buf();

        info!(image = %base_image, "pulling modelcar base image");
        let images = self.images.clone();
        self.pull_retry
            .execute("modelcar base image pull", || {
                let images = images.clone();
                let (image, dir) = (base_image.clone(), oci_dir.clone());
                async move { images.pull(&image, &dir).await }
            })
            .await?;

        let files = model_files(&request.model_dir)?;
        info!(files = files.len(), "adding model files to the modelcar image");
        self.images.append_layers(&oci_dir, &files).await?;

        let mut authfile = tempfile::NamedTempFile::new()?;
        authfile.write_all(auth_blob.as_bytes())?;
        authfile.flush()?;
        let authfile_path = authfile.path().to_path_buf();

        info!(destination = %destination, "pushing modelcar image");
        self.retry
            .execute("modelcar image push", || {
                let images = images.clone();
                let (dir, dest, auth) = (oci_dir.clone(), destination.clone(), authfile_path.clone());
                async move { images.push(&dir, &dest, &auth).await }
            })
            .await?;

        Ok(format!("oci://{}", destination))
    }

    async fn register(
        &self,
        request: &UploadRequest,
        api_url: &str,
        uploaded: &mut UploadedModel,
    ) -> Result<()> {
        let registry = self.registry.clone().ok_or_else(|| {
            TuneflowError::InvalidConfig("no model registry client configured".to_string())
        })?;
        let name = request.model_name.clone().ok_or_else(|| {
            TuneflowError::InvalidConfig("model registration requires a model name".to_string())
        })?;
        let version = request.model_version.clone().ok_or_else(|| {
            TuneflowError::InvalidConfig("model registration requires a model version".to_string())
        })?;

        let mut metadata = BTreeMap::new();
        for (key, value) in [
            ("_registeredFromPipelineRunId", &request.run_id),
            ("_registeredFromPipelineRunName", &request.run_name),
            ("_registeredFromPipelineProject", &request.namespace),
        ] {
            if let Some(v) = value {
                metadata.insert(key.to_string(), v.clone());
            }
        }
        let registration = ModelRegistration {
            name: name.clone(),
            version: version.clone(),
            uri: uploaded.uri.clone(),
            format: MODEL_FORMAT.to_string(),
            metadata,
        };

        info!(model = %name, version = %version, "registering model");
        let model_id = self
            .retry
            .execute("model registration", || {
                let registry = registry.clone();
                let registration = registration.clone();
                async move { registry.register(&registration).await }
            })
            .await?;

        let version_id = self
            .retry
            .execute("model version lookup", || {
                let registry = registry.clone();
                let (name, version) = (name.clone(), version.clone());
                async move { registry.version_id(&name, &version).await }
            })
            .await?;

        let registry_name = match &request.registry_name {
            Some(n) => n.clone(),
            None => registry_name_from_url(api_url)?,
        };
        let ids = RegisteredModel {
            registered_model_id: model_id,
            model_version_id: version_id,
        };
        uploaded.metadata.extend([
            ("modelRegistryName".to_string(), registry_name),
            ("registeredModelName".to_string(), name),
            ("modelVersionName".to_string(), version),
            ("modelVersionId".to_string(), ids.model_version_id),
            ("registeredModelId".to_string(), ids.registered_model_id),
        ]);
        Ok(())
    }
}

/// In-memory fakes for testing.
pub mod fakes {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};

    use super::*;

    /// Records calls; each operation can fail a set number of times first.
    #[derive(Default)]
    pub struct RecordingImageTool {
        pub pull_failures: AtomicU32,
        pub push_failures: AtomicU32,
        pub pulls: AtomicU32,
        pub pushes: AtomicU32,
        pub layered: Mutex<Vec<PathBuf>>,
        pub pushed_auth: Mutex<Option<String>>,
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl ImageTool for RecordingImageTool {
        async fn pull(&self, _image: &str, _oci_dir: &Path) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.pull_failures) {
                return Err(TuneflowError::TransientNetwork("pull reset".to_string()));
            }
            Ok(())
        }

        async fn append_layers(&self, _oci_dir: &Path, files: &[PathBuf]) -> Result<()> {
            self.layered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(files.iter().cloned());
            Ok(())
        }

        async fn push(&self, _oci_dir: &Path, _destination: &str, authfile: &Path) -> Result<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.push_failures) {
                return Err(TuneflowError::TransientNetwork("push reset".to_string()));
            }
            let auth = std::fs::read_to_string(authfile)?;
            *self.pushed_auth.lock().unwrap_or_else(PoisonError::into_inner) = Some(auth);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryModelRegistry {
        pub register_failures: AtomicU32,
        pub registrations: Mutex<Vec<ModelRegistration>>,
    }

    #[async_trait]
    impl ModelRegistryClient for MemoryModelRegistry {
        async fn register(&self, registration: &ModelRegistration) -> Result<String> {
            if take_failure(&self.register_failures) {
                return Err(TuneflowError::TransientNetwork("registry 503".to_string()));
            }
            let mut regs = self.registrations.lock().unwrap_or_else(PoisonError::into_inner);
            regs.push(registration.clone());
            Ok(format!("model-{}", regs.len()))
        }

        async fn version_id(&self, name: &str, version: &str) -> Result<String> {
            let regs = self.registrations.lock().unwrap_or_else(PoisonError::into_inner);
            regs.iter()
                .position(|r| r.name == name && r.version == version)
                .map(|idx| format!("version-{}", idx + 1))
                .ok_or_else(|| TuneflowError::Registry(format!("{}:{} not found", name, version)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{MemoryModelRegistry, RecordingImageTool};
    use super::*;
    use std::sync::atomic::Ordering;

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("tokenizer")).unwrap();
        std::fs::write(dir.path().join("tokenizer/vocab.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn test_strip_transport() {
        assert_eq!(strip_transport("oci://quay.io/a/b:1"), "quay.io/a/b:1");
        assert_eq!(strip_transport("docker://quay.io/a/b:1"), "quay.io/a/b:1");
        assert_eq!(strip_transport("quay.io/a/b:1"), "quay.io/a/b:1");
    }

    #[test]
    fn test_registry_name_and_port() {
        let url = "https://my-registry-rest.apps.example.com";
        assert_eq!(registry_name_from_url(url).unwrap(), "my-registry");
        assert_eq!(registry_port(url).unwrap(), 443);
        assert_eq!(registry_port("http://registry.local").unwrap(), 80);
        assert_eq!(registry_port("https://registry.local:8443").unwrap(), 8443);
        assert_eq!(registry_name_from_url("plain.example.com").unwrap(), "plain");
    }

    #[test]
    fn test_model_files_recurses_sorted() {
        let dir = model_dir();
        let files = model_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("config.json"));
        assert!(files[1].ends_with("tokenizer/vocab.json"));
    }

    #[tokio::test]
    async fn test_upload_without_oci_copies_directory() {
        let src = model_dir();
        let dest = tempfile::tempdir().unwrap();
        let request = UploadRequest {
            model_dir: src.path().to_path_buf(),
            artifact_dir: dest.path().join("model"),
            ..Default::default()
        };
        let uploader = ModelUploader::new(Arc::new(RecordingImageTool::default()), RetryPolicy::default());

        let uploaded = uploader.upload(&request, None).await.unwrap();
        assert!(dest.path().join("model/tokenizer/vocab.json").exists());
        assert!(uploaded.metadata.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_modelcar_push_retries_and_registers() {
        let src = model_dir();
        let images = Arc::new(RecordingImageTool::default());
        images.pull_failures.store(2, Ordering::SeqCst);
        images.push_failures.store(1, Ordering::SeqCst);
        let registry = Arc::new(MemoryModelRegistry::default());
        registry.register_failures.store(2, Ordering::SeqCst);

        let request = UploadRequest {
            model_dir: src.path().to_path_buf(),
            oci_model_uri: Some("oci://quay.io/org/granite:1.0".to_string()),
            modelcar_base_image: Some("docker://quay.io/org/modelcar-base:latest".to_string()),
            registry_api_url: Some("https://mr-rest.apps.example.com".to_string()),
            model_name: Some("granite".to_string()),
            model_version: Some("1.0".to_string()),
            run_id: Some("run-1".to_string()),
            namespace: Some("training".to_string()),
            ..Default::default()
        };
        let uploader = ModelUploader::new(images.clone(), RetryPolicy::fixed(3, Duration::from_secs(1)))
            .with_registry(registry.clone());

        let uploaded = uploader
            .upload(&request, Some(r#"{"auths":{}}"#))
            .await
            .unwrap();

        assert_eq!(uploaded.uri, "oci://quay.io/org/granite:1.0");
        assert_eq!(images.pulls.load(Ordering::SeqCst), 3);
        assert_eq!(images.pushes.load(Ordering::SeqCst), 2);
        assert_eq!(images.layered.lock().unwrap().len(), 2);
        assert_eq!(
            images.pushed_auth.lock().unwrap().as_deref(),
            Some(r#"{"auths":{}}"#)
        );
        assert_eq!(uploaded.metadata["modelRegistryName"], "mr");
        assert_eq!(uploaded.metadata["modelVersionId"], "version-1");
        assert_eq!(uploaded.metadata["registeredModelId"], "model-1");

        let regs = registry.registrations.lock().unwrap();
        assert_eq!(regs[0].format, MODEL_FORMAT);
        assert_eq!(regs[0].metadata["_registeredFromPipelineRunId"], "run-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_exhausts_after_three_attempts() {
        let src = model_dir();
        let images = Arc::new(RecordingImageTool::default());
        images.push_failures.store(5, Ordering::SeqCst);
        let request = UploadRequest {
            model_dir: src.path().to_path_buf(),
            oci_model_uri: Some("quay.io/org/granite:1.0".to_string()),
            modelcar_base_image: Some("quay.io/org/base".to_string()),
            ..Default::default()
        };
        let uploader = ModelUploader::new(images.clone(), RetryPolicy::default());

        let err = uploader.upload(&request, Some("{}")).await.unwrap_err();
        assert!(matches!(err, TuneflowError::ExhaustedRetries { attempts: 3, .. }));
        assert_eq!(images.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_oci_upload_requires_credentials() {
        let src = model_dir();
        let request = UploadRequest {
            model_dir: src.path().to_path_buf(),
            oci_model_uri: Some("quay.io/org/granite:1.0".to_string()),
            modelcar_base_image: Some("quay.io/org/base".to_string()),
            ..Default::default()
        };
        let uploader = ModelUploader::new(Arc::new(RecordingImageTool::default()), RetryPolicy::default());
        assert!(matches!(
            uploader.upload(&request, None).await,
            Err(TuneflowError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_http_registry_registers_and_looks_up_version() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/model_registry/v1alpha3/registered_models")
            .match_header("authorization", "Bearer sa-token")
            .with_status(201)
            .with_body(r#"{"id":"7"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/model_registry/v1alpha3/registered_models/7/versions")
            .with_status(201)
            .with_body(r#"{"id":"11"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/model_registry/v1alpha3/model_versions/11/artifacts")
            .match_body(mockito::Matcher::PartialJson(json!({"modelFormatName": "vLLM"})))
            .with_status(201)
            .with_body(r#"{"id":"3"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/model_registry/v1alpha3/registered_model")
            .match_query(mockito::Matcher::UrlEncoded("name".into(), "granite".into()))
            .with_status(200)
            .with_body(r#"{"id":"7"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/model_registry/v1alpha3/model_version")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("name".into(), "1.0".into()),
                mockito::Matcher::UrlEncoded("parentResourceId".into(), "7".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"id":"11"}"#)
            .create_async()
            .await;

        let registry = HttpModelRegistry::new(&server.url(), "sa-token").unwrap();
        let registration = ModelRegistration {
            name: "granite".to_string(),
            version: "1.0".to_string(),
            uri: "oci://quay.io/org/granite:1.0".to_string(),
            format: MODEL_FORMAT.to_string(),
            metadata: BTreeMap::new(),
        };
        assert_eq!(registry.register(&registration).await.unwrap(), "7");
        assert_eq!(registry.version_id("granite", "1.0").await.unwrap(), "11");
    }
}
