//! Minimal Kubernetes API client shared by the pod log source and the
//! cluster adapter.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};

use crate::config::KubernetesConfig;

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn from_config(cfg: &KubernetesConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms));

        if let Some(ca_path) = cfg.ca_path.as_ref().filter(|p| p.exists()) {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("reading CA bundle {}", ca_path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parsing CA bundle {}", ca_path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match cfg.token_path.as_ref().filter(|p| p.exists()) {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading service account token {}", path.display()))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        Ok(Self {
            client: builder.build().context("building Kubernetes HTTP client")?,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            namespace: cfg.namespace.clone(),
            token,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `<api>/api/v1/namespaces/<ns>/<path>`
    pub fn core_url(&self, path: &str) -> String {
        format!("{}/api/v1/namespaces/{}/{}", self.api_url, self.namespace, path)
    }

    /// `<api>/apis/<group_version>/namespaces/<ns>/<path>`
    pub fn group_url(&self, group_version: &str, path: &str) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/{}",
            self.api_url, group_version, self.namespace, path
        )
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.authorize(self.client.get(url))
    }

    /// JSON merge-patch request for `url`.
    pub fn merge_patch(&self, url: &str, body: &serde_json::Value) -> RequestBuilder {
        self.authorize(
            self.client
                .patch(url)
                .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
                .body(body.to_string()),
        )
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let cfg = KubernetesConfig {
            api_url: "http://127.0.0.1:8001/".to_string(),
            namespace: "bookinfo".to_string(),
            token_path: None,
            ca_path: None,
            timeout_ms: 1000,
        };
        let kube = KubeClient::from_config(&cfg).unwrap();
        assert_eq!(
            kube.core_url("pods?labelSelector=app%3Dratings"),
            "http://127.0.0.1:8001/api/v1/namespaces/bookinfo/pods?labelSelector=app%3Dratings"
        );
        assert_eq!(
            kube.group_url("apps/v1", "deployments/ratings-v1/scale"),
            "http://127.0.0.1:8001/apis/apps/v1/namespaces/bookinfo/deployments/ratings-v1/scale"
        );
    }
}
