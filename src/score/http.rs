use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::analysis::{Window, WindowFeatures};
use crate::score::{Score, ScoreError, Scorer};

/// Body POSTed to a remote model.
#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    target: &'a str,
    start: String,
    end: String,
    features: &'a WindowFeatures,
    feature_names: &'a [&'a str],
    vector: Vec<f64>,
}

/// Scorer that delegates to a remote model over HTTP.
///
/// Any transport failure, non-2xx status or malformed body maps to
/// [`ScoreError::Unavailable`].
pub struct HttpScorer {
    client: Client,
    url: String,
}

impl HttpScorer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ScoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoreError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, window: &Window) -> Result<Score, ScoreError> {
        let body = ScoreRequest {
            target: &window.target,
            start: window.start.to_rfc3339(),
            end: window.end.to_rfc3339(),
            features: &window.features,
            feature_names: &WindowFeatures::NAMES,
            vector: window.features.to_vector(),
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ScoreError::Unavailable(format!("request to {} failed: {}", self.url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScoreError::Unavailable(format!("model returned {}", status)));
        }

        let score: Score = resp
            .json()
            .await
            .map_err(|e| ScoreError::Unavailable(format!("malformed model response: {}", e)))?;

        if !(0.0..=1.0).contains(&score.confidence) {
            return Err(ScoreError::Unavailable(format!(
                "model confidence {} outside [0, 1]",
                score.confidence
            )));
        }

        debug!(service = %window.target, label = ?score.label, confidence = score.confidence, "Remote score");
        Ok(score)
    }
}
