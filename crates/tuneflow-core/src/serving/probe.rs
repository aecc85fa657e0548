//! Liveness probing for serving endpoints.

use std::time::Duration;

use async_trait::async_trait;

/// Result of a single liveness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Endpoint answered 200.
    Ready,
    /// Endpoint answered with another status.
    NotReady(u16),
    /// Connection failed.
    Unreachable,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn poll(&self, endpoint: &str) -> ProbeOutcome;
}

/// `GET {endpoint}/models`, ready on HTTP 200.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn poll(&self, endpoint: &str) -> ProbeOutcome {
        let url = format!("{}/models", endpoint.trim_end_matches('/'));
        match self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => ProbeOutcome::Ready,
            Ok(resp) => ProbeOutcome::NotReady(resp.status().as_u16()),
            Err(_) => ProbeOutcome::Unreachable,
        }
    }
}
