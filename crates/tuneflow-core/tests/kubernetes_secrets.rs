//! Kubernetes-backed secret retrieval against a mock API server.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tuneflow_core::secrets::{KubernetesSecretBackend, SecretRequirement, SecretStore};
use tuneflow_core::upload::registry_auth_blob;
use tuneflow_core::{RetryPolicy, RunConfig, TuneflowError};

fn service_account() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("namespace"), "training\n").unwrap();
    std::fs::write(dir.path().join("token"), "sa-token\n").unwrap();
    dir
}

fn store(url: &str, sa: &tempfile::TempDir) -> SecretStore {
    let config = RunConfig::default()
        .with_service_account_dir(sa.path())
        .with_kube_api_url(url);
    let backend = KubernetesSecretBackend::from_config(&config).unwrap();
    SecretStore::new(Arc::new(backend), RetryPolicy::fixed(3, Duration::ZERO))
}

#[tokio::test]
async fn fetch_decodes_requested_fields() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "kind": "Secret",
        "data": {
            "api_key": STANDARD.encode("judge-key"),
            "endpoint": STANDARD.encode("https://judge.example.com/v1"),
        }
    });
    let mock = server
        .mock("GET", "/api/v1/namespaces/training/secrets/judge-secret")
        .match_header("authorization", "Bearer sa-token")
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let sa = service_account();
    let values = store(&server.url(), &sa)
        .fetch(
            "judge-secret",
            &["api_key", "model_name", "endpoint"],
            SecretRequirement::Optional,
        )
        .await
        .unwrap();

    assert_eq!(values.get("api_key"), Some("judge-key"));
    assert_eq!(values.get("endpoint"), Some("https://judge.example.com/v1"));
    assert!(values.is_absent("model_name"));
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_secret_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/namespaces/training/secrets/absent")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let sa = service_account();
    let err = store(&server.url(), &sa)
        .fetch("absent", &["token"], SecretRequirement::Mandatory)
        .await
        .unwrap_err();

    assert!(matches!(err, TuneflowError::SecretNotFound { .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_are_retried_then_exhausted() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/namespaces/training/secrets/flaky")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let sa = service_account();
    let err = store(&server.url(), &sa)
        .fetch("flaky", &["token"], SecretRequirement::Optional)
        .await
        .unwrap_err();

    assert!(matches!(err, TuneflowError::ExhaustedRetries { attempts: 3, .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn registry_auth_prefers_dockerconfigjson_and_falls_back() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v1/namespaces/training/secrets/push-new")
        .with_status(200)
        .with_body(
            serde_json::json!({"data": {".dockerconfigjson": STANDARD.encode(r#"{"auths":{"quay.io":{}}}"#)}})
                .to_string(),
        )
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/namespaces/training/secrets/push-legacy")
        .with_status(200)
        .with_body(
            serde_json::json!({"data": {".dockercfg": STANDARD.encode(r#"{"quay.io":{}}"#)}})
                .to_string(),
        )
        .create_async()
        .await;

    let sa = service_account();
    let store = store(&server.url(), &sa);

    let blob = registry_auth_blob(&store, "push-new").await.unwrap();
    assert_eq!(blob, r#"{"auths":{"quay.io":{}}}"#);

    let blob = registry_auth_blob(&store, "push-legacy").await.unwrap();
    assert_eq!(blob, r#"{"quay.io":{}}"#);
}
