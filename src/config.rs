//! TOML configuration for meshguard.
//!
//! Layered lookup: an explicit path, then `MESHGUARD_CONFIG`, then
//! `/etc/meshguard/meshguard.toml`, then compiled-in defaults. Every section
//! carries `#[serde(default)]` so partial files are valid.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::target::Target;

pub const CONFIG_ENV: &str = "MESHGUARD_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/meshguard/meshguard.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the meshguard process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), targets = config.targets.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration file.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MESHGUARD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for t in &self.targets {
            if t.name.trim().is_empty() {
                bail!("target with empty name");
            }
            if !seen.insert(t.name.as_str()) {
                bail!("duplicate target '{}'", t.name);
            }
        }
        if self.collector.window_secs == 0 {
            bail!("collector.window_secs must be greater than zero");
        }
        if self.collector.poll_interval_secs == 0 {
            bail!("collector.poll_interval_secs must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            bail!(
                "detection.confidence_threshold must be within [0, 1], got {}",
                self.detection.confidence_threshold
            );
        }
        if self.report.retry.max_attempts == 0 || self.orchestrator.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.detection.scorer == ScorerKind::Http && self.detection.scorer_url.is_none() {
            bail!("detection.scorer = \"http\" requires detection.scorer_url");
        }
        Ok(())
    }

    /// Targets with conventional defaults filled in.
    pub fn targets(&self) -> Vec<Target> {
        self.targets.iter().map(TargetConfig::to_target).collect()
    }

    /// Like [`Config::targets`], but errors when none are configured.
    pub fn require_targets(&self) -> Result<Vec<Target>> {
        if self.targets.is_empty() {
            bail!("no [[targets]] configured");
        }
        Ok(self.targets())
    }
}

// ---------------------------------------------------------------------------
// Storage / API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding routing state, reports and alerts.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/meshguard.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Tail `<log_dir>/<target>.log`.
    File,
    /// Read the proxy container log through the Kubernetes API.
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Width of one aggregation window.
    pub window_secs: u64,
    /// How often the log source is drained.
    pub poll_interval_secs: u64,
    pub source: SourceKind,
    pub log_dir: PathBuf,
    /// Consecutive failed collections of one target before it is reported
    /// as unmonitored.
    pub degraded_after: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window_secs: 20,
            poll_interval_secs: 60,
            source: SourceKind::File,
            log_dir: PathBuf::from("data/logs"),
            degraded_after: 3,
        }
    }
}

impl CollectorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScorerKind {
    /// Logistic model evaluated in-process.
    Embedded,
    /// Remote model behind an HTTP endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub scorer: ScorerKind,
    /// Model JSON for the embedded scorer; the built-in model is used when absent.
    pub model_path: Option<PathBuf>,
    pub scorer_url: Option<String>,
    pub scorer_timeout_ms: u64,
    /// Minimum confidence for an anomalous score to become a report.
    pub confidence_threshold: f64,
    /// Per-target quiet time after an emitted report.
    pub cooldown_secs: u64,
    /// Consecutive scorer failures before health reports `degraded`.
    pub degraded_after: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scorer: ScorerKind::Embedded,
            model_path: None,
            scorer_url: None,
            scorer_timeout_ms: 5_000,
            confidence_threshold: 0.8,
            cooldown_secs: 300,
            degraded_after: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Report transport / orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Receiver endpoint, e.g. `http://meshguard-receiver:8000/api/v1/reports`.
    /// When unset, reports go straight to the in-process orchestrator.
    pub receiver_url: Option<String>,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            receiver_url: None,
            timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Restore failed-over targets automatically once traffic has been quiet.
    pub auto_restore: bool,
    /// Time without incident activity before an automatic restore.
    pub quiet_period_secs: u64,
    pub recovery_check_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            auto_restore: true,
            quiet_period_secs: 600,
            recovery_check_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster / Kubernetes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// Log intents without touching the cluster.
    DryRun,
    /// Patch VirtualServices and Deployments through the Kubernetes API.
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::DryRun,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub api_url: String,
    pub namespace: String,
    pub token_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            token_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            ca_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One `[[targets]]` entry. Only `name` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub route: Option<String>,
    pub host: Option<String>,
    pub primary_subset: Option<String>,
    pub standby_subset: Option<String>,
    pub deployment: Option<String>,
    pub replicas: Option<u32>,
    pub failover_replicas: Option<u32>,
    pub container: Option<String>,
}

impl TargetConfig {
    pub fn to_target(&self) -> Target {
        let mut t = Target::new(&self.name);
        if let Some(primary) = &self.primary_subset {
            t.primary_subset = primary.clone();
            t.deployment = format!("{}-{}", self.name, primary);
        }
        if let Some(v) = &self.standby_subset {
            t.standby_subset = v.clone();
        }
        if let Some(v) = &self.route {
            t.route = v.clone();
        }
        if let Some(v) = &self.host {
            t.host = v.clone();
        }
        if let Some(v) = &self.deployment {
            t.deployment = v.clone();
        }
        if let Some(v) = self.replicas {
            t.replicas = v;
        }
        if let Some(v) = self.failover_replicas {
            t.failover_replicas = v;
        }
        if let Some(v) = &self.container {
            t.container = v.clone();
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.collector.window_secs, 20);
        assert_eq!(cfg.collector.poll_interval_secs, 60);
        assert_eq!(cfg.detection.cooldown_secs, 300);
        assert_eq!(cfg.cluster.mode, ClusterMode::DryRun);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_with_targets() {
        let cfg = Config::from_toml(
            r#"
            [detection]
            confidence_threshold = 0.9

            [[targets]]
            name = "ratings"

            [[targets]]
            name = "reviews"
            primary_subset = "v2"
            standby_subset = "v3"
            replicas = 3
            "#,
        )
        .unwrap();

        assert_eq!(cfg.detection.confidence_threshold, 0.9);
        assert_eq!(cfg.detection.cooldown_secs, 300);

        let targets = cfg.targets();
        assert_eq!(targets[0].route, "ratings-route");
        assert_eq!(targets[1].deployment, "reviews-v2");
        assert_eq!(targets[1].standby_subset, "v3");
        assert_eq!(targets[1].replicas, 3);
    }

    #[test]
    fn test_rejects_duplicate_targets() {
        let err = Config::from_toml(
            r#"
            [[targets]]
            name = "ratings"
            [[targets]]
            name = "ratings"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate target"));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        assert!(Config::from_toml("[detection]\nconfidence_threshold = 1.5\n").is_err());
    }

    #[test]
    fn test_http_scorer_needs_url() {
        assert!(Config::from_toml("[detection]\nscorer = \"http\"\n").is_err());
        assert!(Config::from_toml(
            "[detection]\nscorer = \"http\"\nscorer_url = \"http://model:9000/score\"\n"
        )
        .is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshguard.toml");
        std::fs::write(&path, "[api]\nbind = \"127.0.0.1:9999\"\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:9999");
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
