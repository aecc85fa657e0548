//! Run configuration, built once at process start and passed by reference.
//!
//! Every value that used to be read ad hoc from the process environment
//! (secret fallbacks, CA certificate paths, service-account location) lives
//! here so components never touch `std::env` themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, TuneflowError};
use crate::retry::RetryPolicy;

/// Default in-cluster Kubernetes API server.
pub const DEFAULT_KUBE_API: &str = "https://kubernetes.default.svc";

/// Default service-account mount.
pub const DEFAULT_SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Credentials for an OpenAI-compatible endpoint. Any field may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointFallback {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

/// Timings for the ephemeral serving subprocess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServingSettings {
    pub health_max_attempts: u32,
    pub health_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for ServingSettings {
    fn default() -> Self {
        Self {
            health_max_attempts: 120,
            health_delay_ms: 10_000,
            shutdown_timeout_ms: 20_000,
            settle_delay_ms: 30_000,
        }
    }
}

impl ServingSettings {
    pub fn health_delay(&self) -> Duration {
        Duration::from_millis(self.health_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Optional output publication settings checked by [`RunConfig::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishSettings {
    pub oci_model_uri: Option<String>,
    pub oci_registry_secret: Option<String>,
    pub model_registry_api_url: Option<String>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
}

/// Process-wide run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Fallback for the synthetic-data teacher endpoint.
    pub teacher_fallback: EndpointFallback,
    /// Fallback for the judge endpoint.
    pub judge_fallback: EndpointFallback,
    pub judge_ca_cert_path: Option<PathBuf>,
    pub teacher_ca_cert_path: Option<PathBuf>,
    pub taxonomy_ca_cert_path: Option<PathBuf>,
    pub service_account_dir: PathBuf,
    pub kube_api_url: String,
    pub storage_class: String,
    pub storage_size: String,
    pub sdg_batch_size: u32,
    pub sdg_num_workers: u32,
    pub retry: RetryPolicy,
    pub serving: ServingSettings,
    pub publish: PublishSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            teacher_fallback: EndpointFallback::default(),
            judge_fallback: EndpointFallback::default(),
            judge_ca_cert_path: None,
            teacher_ca_cert_path: None,
            taxonomy_ca_cert_path: None,
            service_account_dir: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_DIR),
            kube_api_url: DEFAULT_KUBE_API.to_string(),
            storage_class: "standard".to_string(),
            storage_size: "100Gi".to_string(),
            sdg_batch_size: 128,
            sdg_num_workers: 2,
            retry: RetryPolicy::default(),
            serving: ServingSettings::default(),
            publish: PublishSettings::default(),
        }
    }
}

impl RunConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            teacher_fallback: EndpointFallback {
                api_key: get("api_key"),
                model: get("model"),
                endpoint: get("endpoint"),
            },
            judge_fallback: EndpointFallback {
                api_key: get("JUDGE_API_KEY"),
                model: get("JUDGE_NAME"),
                endpoint: get("JUDGE_ENDPOINT"),
            },
            judge_ca_cert_path: get("JUDGE_CA_CERT_PATH").map(PathBuf::from),
            teacher_ca_cert_path: get("SDG_CA_CERT_PATH").map(PathBuf::from),
            taxonomy_ca_cert_path: get("TAXONOMY_CA_CERT_PATH").map(PathBuf::from),
            service_account_dir: get("TUNEFLOW_SERVICE_ACCOUNT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.service_account_dir),
            kube_api_url: get("TUNEFLOW_KUBE_API").unwrap_or(defaults.kube_api_url),
            storage_class: get("TUNEFLOW_STORAGE_CLASS").unwrap_or(defaults.storage_class),
            storage_size: get("TUNEFLOW_STORAGE_SIZE").unwrap_or(defaults.storage_size),
            ..defaults
        }
    }

    pub fn with_judge_fallback(mut self, fallback: EndpointFallback) -> Self {
        self.judge_fallback = fallback;
        self
    }

    pub fn with_teacher_fallback(mut self, fallback: EndpointFallback) -> Self {
        self.teacher_fallback = fallback;
        self
    }

    pub fn with_service_account_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.service_account_dir = dir.into();
        self
    }

    pub fn with_kube_api_url(mut self, url: impl Into<String>) -> Self {
        self.kube_api_url = url.into();
        self
    }

    pub fn with_serving(mut self, serving: ServingSettings) -> Self {
        self.serving = serving;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_publish(mut self, publish: PublishSettings) -> Self {
        self.publish = publish;
        self
    }

    /// Judge CA certificate, only when the file exists and is non-empty.
    pub fn judge_ca_cert(&self) -> Option<&Path> {
        usable_cert(self.judge_ca_cert_path.as_deref())
    }

    /// Teacher CA certificate, only when the file exists and is non-empty.
    pub fn teacher_ca_cert(&self) -> Option<&Path> {
        usable_cert(self.teacher_ca_cert_path.as_deref())
    }

    /// Taxonomy repository CA certificate, only when the file exists and is non-empty.
    pub fn taxonomy_ca_cert(&self) -> Option<&Path> {
        usable_cert(self.taxonomy_ca_cert_path.as_deref())
    }

    pub fn namespace_path(&self) -> PathBuf {
        self.service_account_dir.join("namespace")
    }

    pub fn token_path(&self) -> PathBuf {
        self.service_account_dir.join("token")
    }

    pub fn service_ca_path(&self) -> PathBuf {
        self.service_account_dir.join("ca.crt")
    }

    /// Prerequisite checks run before any stage is submitted.
    pub fn validate(&self) -> Result<()> {
        if self.sdg_batch_size == 0 {
            return Err(TuneflowError::InvalidConfig(
                "sdg batch size must be positive".to_string(),
            ));
        }
        if self.sdg_num_workers == 0 {
            return Err(TuneflowError::InvalidConfig(
                "sdg worker count must be positive".to_string(),
            ));
        }
        if self.storage_size.trim().is_empty() {
            return Err(TuneflowError::InvalidConfig(
                "storage size must not be empty".to_string(),
            ));
        }

        let publish = &self.publish;
        if publish.model_registry_api_url.is_some() {
            if publish.model_name.as_deref().unwrap_or("").is_empty() {
                return Err(TuneflowError::InvalidConfig(
                    "model registration requires a model name".to_string(),
                ));
            }
            if publish.model_version.as_deref().unwrap_or("").is_empty() {
                return Err(TuneflowError::InvalidConfig(
                    "model registration requires a model version".to_string(),
                ));
            }
        }
        if publish.oci_model_uri.is_some() && publish.oci_registry_secret.is_none() {
            return Err(TuneflowError::InvalidConfig(
                "pushing to an OCI registry requires a registry secret".to_string(),
            ));
        }
        Ok(())
    }
}

fn usable_cert(path: Option<&Path>) -> Option<&Path> {
    let path = path?;
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
        _ => None,
    }
}
