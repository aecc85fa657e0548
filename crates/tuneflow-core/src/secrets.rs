//! Read-only access to namespaced credential material.
//!
//! - `SecretBackend`: where secrets actually live (Kubernetes API, memory)
//! - `SecretStore`: field selection, optional/mandatory semantics, retries
//!
//! The namespace and credentials come from the local process identity
//! (service-account files); callers never pass a credential in.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

use crate::config::{EndpointFallback, RunConfig};
use crate::domain::error::{Result, TuneflowError};
use crate::retry::RetryPolicy;

/// Decoded secret data, keyed by field name.
pub type SecretData = BTreeMap<String, String>;

/// Storage behind [`SecretStore`].
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Namespace of the running process.
    async fn namespace(&self) -> Result<String>;

    /// Read a secret. `Ok(None)` when it does not exist.
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;
}

/// Whether a missing secret or field fails the fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretRequirement {
    /// Missing secret or field resolves to absent.
    Optional,
    /// Missing secret or field is an error.
    Mandatory,
}

/// Requested fields mapped to their value, `None` when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretValues {
    values: HashMap<String, Option<String>>,
}

impl SecretValues {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|v| v.as_deref())
    }

    pub fn is_absent(&self, field: &str) -> bool {
        self.get(field).is_none()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Field layout of an endpoint secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Synthetic-data teacher: `api_token`, `model_name`, `endpoint`.
    Teacher,
    /// Judge: `api_key`, `model_name`, `endpoint`.
    Judge,
}

impl EndpointRole {
    fn fields(self) -> [&'static str; 3] {
        match self {
            EndpointRole::Teacher => ["api_token", "model_name", "endpoint"],
            EndpointRole::Judge => ["api_key", "model_name", "endpoint"],
        }
    }
}

/// Resolved credentials for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointCredentials {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

/// Secret accessor with retrying reads.
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    retry: RetryPolicy,
}

impl SecretStore {
    pub fn new(backend: Arc<dyn SecretBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Fetch `fields` from the secret `name` in the process namespace.
    pub async fn fetch(
        &self,
        name: &str,
        fields: &[&str],
        requirement: SecretRequirement,
    ) -> Result<SecretValues> {
        let namespace = self.backend.namespace().await?;
        let backend = self.backend.clone();
        let operation = format!("secret fetch {}", name);

        let data = self
            .retry
            .execute_if(&operation, TuneflowError::is_transient, || {
                let backend = backend.clone();
                let namespace = namespace.clone();
                async move { backend.read(&namespace, name).await }
            })
            .await
            .map_err(|err| {
                if err.last_error().is_transient() {
                    TuneflowError::from(err)
                } else {
                    err.into_last_error()
                }
            })?;

        let Some(data) = data else {
            if requirement == SecretRequirement::Mandatory {
                return Err(TuneflowError::SecretNotFound {
                    name: name.to_string(),
                    namespace,
                });
            }
            debug!(secret = %name, "optional secret absent");
            return Ok(SecretValues {
                values: fields.iter().map(|f| (f.to_string(), None)).collect(),
            });
        };

        let mut values = HashMap::with_capacity(fields.len());
        for field in fields {
            let value = data.get(*field).cloned();
            if value.is_none() && requirement == SecretRequirement::Mandatory {
                return Err(TuneflowError::SecretFieldMissing {
                    secret: name.to_string(),
                    field: field.to_string(),
                });
            }
            values.insert(field.to_string(), value);
        }
        Ok(SecretValues { values })
    }

    /// Resolve endpoint credentials from an optional secret, falling back to
    /// the configured environment values field by field.
    pub async fn endpoint_credentials(
        &self,
        secret_name: Option<&str>,
        role: EndpointRole,
        config: &RunConfig,
    ) -> Result<EndpointCredentials> {
        let fallback: &EndpointFallback = match role {
            EndpointRole::Teacher => &config.teacher_fallback,
            EndpointRole::Judge => &config.judge_fallback,
        };
        let [key_field, model_field, endpoint_field] = role.fields();

        let values = match secret_name {
            Some(name) => {
                self.fetch(
                    name,
                    &[key_field, model_field, endpoint_field],
                    SecretRequirement::Optional,
                )
                .await?
            }
            None => SecretValues::default(),
        };

        let pick = |field: &str, fallback: &Option<String>| {
            values
                .get(field)
                .map(str::to_string)
                .or_else(|| fallback.clone())
        };

        Ok(EndpointCredentials {
            api_key: pick(key_field, &fallback.api_key),
            model: pick(model_field, &fallback.model),
            endpoint: pick(endpoint_field, &fallback.endpoint),
        })
    }
}

#[derive(Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: HashMap<String, String>,
}

/// Secrets read from the Kubernetes API using the pod's service account.
pub struct KubernetesSecretBackend {
    client: reqwest::Client,
    api_url: String,
    namespace_path: std::path::PathBuf,
    token_path: std::path::PathBuf,
}

impl KubernetesSecretBackend {
    /// Build a backend from the service-account paths in `config`.
    ///
    /// The service-account CA is trusted when present.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        let ca_path = config.service_ca_path();
        if ca_path.is_file() {
            let pem = std::fs::read(&ca_path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            api_url: config.kube_api_url.trim_end_matches('/').to_string(),
            namespace_path: config.namespace_path(),
            token_path: config.token_path(),
        })
    }

    fn decode(name: &str, raw: HashMap<String, String>) -> Result<SecretData> {
        raw.into_iter()
            .map(|(field, encoded)| {
                let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
                    TuneflowError::InvalidConfig(format!(
                        "secret {} field {} is not valid base64: {}",
                        name, field, e
                    ))
                })?;
                let value = String::from_utf8(bytes).map_err(|_| {
                    TuneflowError::InvalidConfig(format!(
                        "secret {} field {} is not valid UTF-8",
                        name, field
                    ))
                })?;
                Ok((field, value))
            })
            .collect()
    }
}

#[async_trait]
impl SecretBackend for KubernetesSecretBackend {
    async fn namespace(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.namespace_path).await?;
        Ok(raw.trim().to_string())
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let token = tokio::fs::read_to_string(&self.token_path).await?;
        let url = format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.api_url, namespace, name
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(token.trim())
            .send()
            .await
            .map_err(|e| TuneflowError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TuneflowError::TransientNetwork(format!(
                "secret {} returned HTTP {}",
                name, status
            )));
        }

        let object: SecretObject = response
            .json()
            .await
            .map_err(|e| TuneflowError::TransientNetwork(e.to_string()))?;
        Self::decode(name, object.data).map(Some)
    }
}

/// In-memory fakes for testing.
pub mod fakes {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};

    use super::*;

    /// Secrets held in memory. Can be told to fail the next N reads.
    #[derive(Default)]
    pub struct MemorySecretBackend {
        namespace: String,
        secrets: Mutex<HashMap<(String, String), SecretData>>,
        failures_remaining: AtomicU32,
        reads: AtomicU32,
    }

    impl MemorySecretBackend {
        pub fn new(namespace: impl Into<String>) -> Self {
            Self {
                namespace: namespace.into(),
                ..Default::default()
            }
        }

        pub fn insert(&self, name: &str, fields: &[(&str, &str)]) {
            let data = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.secrets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((self.namespace.clone(), name.to_string()), data);
        }

        pub fn fail_next(&self, count: u32) {
            self.failures_remaining.store(count, Ordering::SeqCst);
        }

        pub fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SecretBackend for MemorySecretBackend {
        async fn namespace(&self) -> Result<String> {
            Ok(self.namespace.clone())
        }

        async fn read(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(TuneflowError::TransientNetwork(
                    "connection refused".to_string(),
                ));
            }
            Ok(self
                .secrets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }
}
