//! Reads proxy access logs through the Kubernetes pod log API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::analysis::Event;
use crate::collect::{parse_access_log, CollectError, LogSource};
use crate::kube::KubeClient;
use crate::target::{Target, TargetRegistry};

pub struct KubeLogSource {
    kube: KubeClient,
    registry: Arc<TargetRegistry>,
    /// Runtime timestamp of the last line handed out per target.
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMeta,
    status: Option<PodStatus>,
}

#[derive(Deserialize)]
struct PodMeta {
    name: String,
}

#[derive(Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

impl KubeLogSource {
    pub fn new(kube: KubeClient, registry: Arc<TargetRegistry>) -> Self {
        Self {
            kube,
            registry,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Name of a running pod serving the target's primary subset.
    async fn resolve_pod(&self, target: &Target) -> Result<String, CollectError> {
        let selector = format!("app={},version={}", target.host, target.primary_subset);
        let url = self.kube.core_url("pods");
        let resp = self
            .kube
            .get(&url)
            .query(&[("labelSelector", selector.as_str())])
            .send()
            .await
            .map_err(|e| CollectError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollectError::Http(format!("listing pods returned {}", resp.status())));
        }
        let pods: PodList = resp
            .json()
            .await
            .map_err(|e| CollectError::Http(format!("malformed pod list: {}", e)))?;

        pods.items
            .into_iter()
            .find(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map_or(true, |phase| phase == "Running")
            })
            .map(|p| p.metadata.name)
            .ok_or_else(|| CollectError::NoInstance(target.name.clone()))
    }
}

#[async_trait::async_trait]
impl LogSource for KubeLogSource {
    async fn collect(&self, target: &Target, since: DateTime<Utc>) -> Result<Vec<Event>, CollectError> {
        let pod = self.resolve_pod(target).await?;
        self.registry.set_physical_id(&target.name, &pod);

        let cursor = self
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target.name)
            .copied();
        let from = cursor.unwrap_or(since);
        // sinceSeconds has one-second granularity; the overlap is filtered below.
        let since_secs = ((Utc::now() - from).num_seconds() + 1).max(1).to_string();
        let url = self.kube.core_url(&format!("pods/{}/log", pod));
        let resp = self
            .kube
            .get(&url)
            .query(&[
                ("container", target.container.as_str()),
                ("sinceSeconds", since_secs.as_str()),
                ("timestamps", "true"),
            ])
            .send()
            .await
            .map_err(|e| CollectError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollectError::Http(format!("reading log of {} returned {}", pod, resp.status())));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| CollectError::Http(e.to_string()))?;

        let parsed = parse_access_log(&text, &target.name);
        debug!(
            service = %target.name,
            pod = %pod,
            events = parsed.events.len(),
            skipped = parsed.skipped,
            "Collected pod log"
        );
        let events: Vec<Event> = parsed
            .events
            .into_iter()
            .filter(|e| match cursor {
                Some(c) => e.timestamp > c,
                None => e.timestamp >= since,
            })
            .collect();
        if let Some(last) = events.iter().map(|e| e.timestamp).max() {
            self.cursors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(target.name.clone(), last);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KubernetesConfig;
    use axum::extract::{Path, Query};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_collects_from_resolved_pod_without_repeats() {
        let base = Utc::now() - chrono::Duration::seconds(30);
        let polls = Arc::new(AtomicUsize::new(0));
        let served = polls.clone();
        let app = Router::new()
            .route(
                "/api/v1/namespaces/default/pods",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q["labelSelector"], "app=ratings,version=v1");
                    Json(json!({ "items": [
                        { "metadata": { "name": "ratings-v1-old" }, "status": { "phase": "Terminating" } },
                        { "metadata": { "name": "ratings-v1-856f65bcff-xb6kr" }, "status": { "phase": "Running" } }
                    ]}))
                }),
            )
            .route(
                "/api/v1/namespaces/default/pods/{pod}/log",
                get(move |Path(pod): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(pod, "ratings-v1-856f65bcff-xb6kr");
                    assert_eq!(q["container"], "istio-proxy");
                    assert_eq!(q["timestamps"], "true");
                    let first = base.to_rfc3339();
                    let mut body = format!(
                        "{first} {{\"client_ip\":\"10.0.0.1\",\"response_code\":200,\"duration\":3}}\n\
                         {first} garbage\n"
                    );
                    // The log API returns overlapping history on every poll.
                    if served.fetch_add(1, Ordering::SeqCst) > 0 {
                        let second = (base + chrono::Duration::seconds(5)).to_rfc3339();
                        body.push_str(&format!(
                            "{second} {{\"client_ip\":\"10.0.0.2\",\"response_code\":503,\"duration\":9}}\n"
                        ));
                    }
                    body
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let kube = KubeClient::from_config(&KubernetesConfig {
            api_url: format!("http://{}", addr),
            namespace: "default".to_string(),
            token_path: None,
            ca_path: None,
            timeout_ms: 2000,
        })
        .unwrap();
        let registry = Arc::new(TargetRegistry::new([Target::new("ratings")]));
        let source = KubeLogSource::new(kube, registry.clone());
        let target = registry.get("ratings").unwrap();
        let since = base - chrono::Duration::seconds(60);

        let events = source.collect(&target, since).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "10.0.0.1");
        assert_eq!(
            registry.physical_id("ratings").as_deref(),
            Some("ratings-v1-856f65bcff-xb6kr")
        );

        let events = source.collect(&target, since).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "10.0.0.2");
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }
}
