use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::analysis::{Window, WindowFeatures};
use crate::score::{Contribution, Label, Score, ScoreError, Scorer};

// Embed default model for fallback
const DEFAULT_MODEL_JSON: &str = include_str!("default_model.json");

/// Explanation terms kept per score.
const EXPLANATION_TERMS: usize = 6;

/// Window classifier (standardized multinomial logistic regression).
#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    pub feature_names: Vec<String>,
    pub class_names: Vec<String>,
    pub weights: Vec<Vec<f64>>, // [n_classes][n_features]
    pub bias: Vec<f64>,         // [n_classes]
    pub means: Vec<f64>,        // For standardization
    pub stds: Vec<f64>,         // For standardization
}

impl LogisticModel {
    /// The model compiled into the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_json(DEFAULT_MODEL_JSON).context("embedded default model is invalid")
    }

    /// Load model from a JSON file, falling back to the embedded default if
    /// the file is missing. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let model = Self::from_json(&content)
                    .with_context(|| format!("failed to parse model at {}", path.display()))?;
                info!(path = %path.display(), "Loaded scoring model");
                Ok(model)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Model file not readable. Using embedded default.");
                Self::embedded()
            }
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(content)?;
        model.check_shape()?;
        Ok(model)
    }

    fn check_shape(&self) -> Result<()> {
        let n = WindowFeatures::NAMES.len();
        if self.feature_names.len() != n || self.means.len() != n || self.stds.len() != n {
            bail!("model expects {} features, window provides {}", self.means.len(), n);
        }
        if self.weights.len() != self.class_names.len() || self.bias.len() != self.class_names.len() {
            bail!("weights/bias do not match {} classes", self.class_names.len());
        }
        if self.weights.iter().any(|row| row.len() != n) {
            bail!("every weight row must have {} entries", n);
        }
        if self.stds.iter().any(|s| *s <= 0.0) {
            bail!("standard deviations must be positive");
        }
        if self.class_index("anomalous").is_none() {
            bail!("model has no 'anomalous' class");
        }
        Ok(())
    }

    fn class_index(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|c| c == name)
    }

    /// Classify one feature vector.
    pub fn predict(&self, features: &WindowFeatures) -> Result<Score, ScoreError> {
        let raw = features.to_vector();
        if raw.len() != self.means.len() {
            return Err(ScoreError::Model(format!(
                "feature vector length mismatch: expected {}, got {}",
                self.means.len(),
                raw.len()
            )));
        }

        // 1. Standardize
        let norm: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(i, v)| (v - self.means[i]) / self.stds[i])
            .collect();

        // 2. Class scores (dot product + bias)
        let scores: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&norm).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect();

        // 3. Softmax
        let max_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = scores.iter().map(|s| (s - max_score).exp()).collect();
        let sum_exp: f64 = exp.iter().sum();

        let anomalous = self
            .class_index("anomalous")
            .ok_or_else(|| ScoreError::Model("no anomalous class".to_string()))?;
        let p_anomalous = exp[anomalous] / sum_exp;

        let (label, confidence) = if p_anomalous >= 0.5 {
            (Label::Anomalous, p_anomalous)
        } else {
            (Label::Normal, 1.0 - p_anomalous)
        };

        // 4. Explanation: each feature's share of the anomalous logit over the
        //    mean of the other classes.
        let others = (self.weights.len() - 1).max(1) as f64;
        let mut explanation: Vec<Contribution> = (0..norm.len())
            .map(|j| {
                let rest: f64 = self
                    .weights
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != anomalous)
                    .map(|(_, row)| row[j])
                    .sum::<f64>()
                    / others;
                Contribution {
                    feature: self.feature_names[j].clone(),
                    contribution: (self.weights[anomalous][j] - rest) * norm[j],
                }
            })
            .collect();
        explanation.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
        explanation.truncate(EXPLANATION_TERMS);

        Ok(Score {
            label,
            confidence,
            explanation,
        })
    }
}

/// In-process scorer backed by a [`LogisticModel`].
#[derive(Debug, Clone)]
pub struct LogisticScorer {
    model: LogisticModel,
}

impl LogisticScorer {
    pub fn new(model: LogisticModel) -> Self {
        Self { model }
    }
}

#[async_trait::async_trait]
impl Scorer for LogisticScorer {
    async fn score(&self, window: &Window) -> Result<Score, ScoreError> {
        self.model.predict(&window.features)
    }
}
