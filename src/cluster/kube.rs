//! Kubernetes / Istio adapter: merge-patches VirtualService weights and the
//! Deployment scale subresource.

use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cluster::{Ack, AppliedKeys, ApplyError, ClusterAdapter};
use crate::kube::KubeClient;
use crate::orchestrator::{IdempotencyKey, SubsetWeight};

const ISTIO_NETWORKING: &str = "networking.istio.io/v1beta1";

pub struct KubeClusterAdapter {
    kube: KubeClient,
    applied: AppliedKeys,
}

impl KubeClusterAdapter {
    pub fn new(kube: KubeClient) -> Self {
        Self {
            kube,
            applied: AppliedKeys::default(),
        }
    }

    async fn patch(&self, url: &str, body: &Value, key: &IdempotencyKey) -> Result<Ack, ApplyError> {
        if self.applied.contains(key) {
            debug!(key = %key, "Intent already applied");
            return Ok(Ack {
                key: key.clone(),
                already_applied: true,
            });
        }

        let resp = self
            .kube
            .merge_patch(url, body)
            .send()
            .await
            .map_err(|e| ApplyError::retryable(format!("PATCH {}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(classify(status, &format!("PATCH {} returned {}: {}", url, status, detail.trim())));
        }

        self.applied.insert(key);
        Ok(Ack {
            key: key.clone(),
            already_applied: false,
        })
    }
}

/// Conflicts, throttling and server errors are transient; any other client
/// error (missing object, forbidden, invalid body) is not.
pub fn classify(status: StatusCode, reason: &str) -> ApplyError {
    if status == StatusCode::CONFLICT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ApplyError::retryable(reason)
    } else {
        ApplyError::permanent(reason)
    }
}

fn route_patch(host: &str, weights: &[SubsetWeight]) -> Value {
    let route: Vec<Value> = weights
        .iter()
        .map(|w| {
            json!({
                "destination": { "host": host, "subset": w.subset },
                "weight": w.weight,
            })
        })
        .collect();
    json!({ "spec": { "http": [{ "route": route }] } })
}

#[async_trait::async_trait]
impl ClusterAdapter for KubeClusterAdapter {
    async fn reweight_route(
        &self,
        target: &str,
        route: &str,
        host: &str,
        weights: &[SubsetWeight],
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        let url = self
            .kube
            .group_url(ISTIO_NETWORKING, &format!("virtualservices/{}", route));
        let ack = self.patch(&url, &route_patch(host, weights), key).await?;
        if !ack.already_applied {
            info!(service = %target, route, key = %key, "VirtualService reweighted");
        }
        Ok(ack)
    }

    async fn scale_deployment(
        &self,
        target: &str,
        deployment: &str,
        replicas: u32,
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        let url = self
            .kube
            .group_url("apps/v1", &format!("deployments/{}/scale", deployment));
        let body = json!({ "spec": { "replicas": replicas } });
        let ack = self.patch(&url, &body, key).await?;
        if !ack.already_applied {
            info!(service = %target, deployment, replicas, key = %key, "Deployment scaled");
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KubernetesConfig;
    use crate::orchestrator::failover_intents;
    use crate::report::ReportId;
    use crate::target::Target;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::patch;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn spawn_api(status: StatusCode) -> (KubeClient, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/apis/networking.istio.io/v1beta1/namespaces/bookinfo/virtualservices/{name}",
                patch(
                    move |State(seen): State<Seen>, Path(name): Path<String>, headers: HeaderMap, body: String| async move {
                        assert_eq!(headers["content-type"], "application/merge-patch+json");
                        let body: Value = serde_json::from_str(&body).unwrap();
                        seen.lock().unwrap().push((format!("vs/{}", name), body));
                        (status, Json(json!({})))
                    },
                ),
            )
            .route(
                "/apis/apps/v1/namespaces/bookinfo/deployments/{name}/scale",
                patch(
                    move |State(seen): State<Seen>, Path(name): Path<String>, body: String| async move {
                        let body: Value = serde_json::from_str(&body).unwrap();
                        seen.lock().unwrap().push((format!("scale/{}", name), body));
                        (status, Json(json!({})))
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let kube = KubeClient::from_config(&KubernetesConfig {
            api_url: format!("http://{}", addr),
            namespace: "bookinfo".to_string(),
            token_path: None,
            ca_path: None,
            timeout_ms: 2000,
        })
        .unwrap();
        (kube, seen)
    }

    fn intents() -> Vec<crate::orchestrator::MutationIntent> {
        let report = ReportId::for_window("ratings", Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap());
        failover_intents(&Target::new("ratings"), &report)
    }

    #[tokio::test]
    async fn test_failover_patches_route_and_scale() {
        let (kube, seen) = spawn_api(StatusCode::OK).await;
        let adapter = KubeClusterAdapter::new(kube);

        for intent in intents() {
            assert!(!adapter.apply(&intent).await.unwrap().already_applied);
        }
        // Repeats are acknowledged without another PATCH.
        for intent in intents() {
            assert!(adapter.apply(&intent).await.unwrap().already_applied);
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let (path, body) = &seen[0];
        assert_eq!(path, "vs/ratings-route");
        assert_eq!(body["spec"]["http"][0]["route"][0]["destination"]["subset"], "v1");
        assert_eq!(body["spec"]["http"][0]["route"][0]["weight"], 0);
        assert_eq!(body["spec"]["http"][0]["route"][1]["weight"], 100);
        assert_eq!(seen[1].0, "scale/ratings-v1");
        assert_eq!(seen[1].1["spec"]["replicas"], 0);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let (kube, _) = spawn_api(StatusCode::NOT_FOUND).await;
        let adapter = KubeClusterAdapter::new(kube);
        let err = adapter.apply(&intents()[0]).await.unwrap_err();
        assert!(!err.retryable);

        let (kube, _) = spawn_api(StatusCode::CONFLICT).await;
        let adapter = KubeClusterAdapter::new(kube);
        let err = adapter.apply(&intents()[1]).await.unwrap_err();
        assert!(err.retryable);

        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "x").retryable);
        assert!(classify(StatusCode::BAD_GATEWAY, "x").retryable);
        assert!(!classify(StatusCode::FORBIDDEN, "x").retryable);
    }
}
