//! Anomaly scoring -- classifies a closed window as normal or anomalous.
//!
//! The model itself is an external collaborator; this module defines the
//! interface plus two backends: an embedded logistic model and a remote HTTP
//! model.

pub mod health;
pub mod http;
pub mod logistic;

pub use health::ScorerHealth;
pub use http::HttpScorer;
pub use logistic::LogisticScorer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::Window;

#[derive(Debug, Error)]
pub enum ScoreError {
    /// The model backend could not produce a decision. Callers treat this as
    /// "no decision" and try again with the next window.
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    #[error("model rejected input: {0}")]
    Model(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Anomalous,
}

/// Contribution of one feature to the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub feature: String,
    pub contribution: f64,
}

/// Classification of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub label: Label,
    /// Confidence in `label`, within [0, 1].
    pub confidence: f64,
    /// Feature contributions, largest magnitude first.
    pub explanation: Vec<Contribution>,
}

impl Score {
    pub fn is_anomalous(&self) -> bool {
        self.label == Label::Anomalous
    }
}

/// A window classifier. Implementations must not mutate shared state.
#[async_trait::async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, window: &Window) -> Result<Score, ScoreError>;
}
