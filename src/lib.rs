//! meshguard -- traffic anomaly detection and automated failover for
//! service-mesh targets.
//!
//! This crate provides the detection pipeline (log collection, window
//! aggregation, scoring, reporting) and the failover orchestrator that turns
//! anomaly reports into idempotent route and replica changes.

pub mod alert;
pub mod analysis;
pub mod api;
pub mod cluster;
pub mod collect;
pub mod config;
pub mod detect;
pub mod kube;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod score;
pub mod storage;
pub mod target;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::alert::AlertManager;
use crate::cluster::{ClusterAdapter, DryRunAdapter, KubeClusterAdapter};
use crate::collect::{FileLogSource, KubeLogSource, LogSource};
use crate::config::{ClusterMode, Config, ScorerKind, SourceKind};
use crate::detect::{Detector, DetectorSettings};
use crate::orchestrator::Orchestrator;
use crate::report::{HttpReportSink, LocalReportSink, ReportDispatcher, ReportSink};
use crate::score::logistic::LogisticModel;
use crate::score::{HttpScorer, LogisticScorer, Scorer};
use crate::storage::{Pool, ReportStore, StateStore};
use crate::target::TargetRegistry;

/// Start the full daemon: detector, orchestrator, recovery timer and API.
pub async fn serve(config: &Config) -> Result<()> {
    let registry = Arc::new(TargetRegistry::new(config.require_targets()?));
    let pool = open_storage(config)?;
    let alerts = AlertManager::new(pool.clone());

    let orchestrator = start_orchestrator(config, &pool, &registry, &alerts).await?;

    let sink: Arc<dyn ReportSink> = match &config.report.receiver_url {
        Some(url) => Arc::new(HttpReportSink::new(url, Duration::from_millis(config.report.timeout_ms))?),
        None => Arc::new(LocalReportSink::new(orchestrator.clone())),
    };
    let detector = start_detector(config, &pool, &registry, &alerts, sink).await?;

    serve_api(config, &pool, orchestrator, Some(detector), alerts).await
}

/// Run only the detection side, shipping reports to a remote receiver.
pub async fn detect(config: &Config) -> Result<()> {
    let Some(url) = &config.report.receiver_url else {
        bail!("detect mode requires report.receiver_url");
    };
    let registry = Arc::new(TargetRegistry::new(config.require_targets()?));
    let pool = open_storage(config)?;
    let alerts = AlertManager::new(pool.clone());

    let sink = Arc::new(HttpReportSink::new(url, Duration::from_millis(config.report.timeout_ms))?);
    start_detector(config, &pool, &registry, &alerts, sink).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}

/// Run only the receiving side: orchestrator, recovery timer and API.
pub async fn receive(config: &Config) -> Result<()> {
    let registry = Arc::new(TargetRegistry::new(config.require_targets()?));
    let pool = open_storage(config)?;
    let alerts = AlertManager::new(pool.clone());

    let orchestrator = start_orchestrator(config, &pool, &registry, &alerts).await?;
    serve_api(config, &pool, orchestrator, None, alerts).await
}

fn open_storage(config: &Config) -> Result<Pool> {
    let path = &config.storage.path;
    tracing::info!(path = %path.display(), "Initializing database");
    storage::open_pool(path)
}

fn build_adapter(config: &Config) -> Result<Arc<dyn ClusterAdapter>> {
    let adapter: Arc<dyn ClusterAdapter> = match config.cluster.mode {
        ClusterMode::DryRun => {
            tracing::warn!("Cluster adapter in dry-run mode; no changes will be applied");
            Arc::new(DryRunAdapter::new())
        }
        ClusterMode::Kubernetes => Arc::new(KubeClusterAdapter::new(kube::KubeClient::from_config(
            &config.kubernetes,
        )?)),
    };
    Ok(adapter)
}

fn build_scorer(config: &Config) -> Result<Arc<dyn Scorer>> {
    let detection = &config.detection;
    let scorer: Arc<dyn Scorer> = match detection.scorer {
        ScorerKind::Embedded => {
            let model = match &detection.model_path {
                Some(path) => LogisticModel::load(path)?,
                None => LogisticModel::embedded()?,
            };
            Arc::new(LogisticScorer::new(model))
        }
        ScorerKind::Http => {
            let url = detection
                .scorer_url
                .as_deref()
                .context("detection.scorer_url is required for the http scorer")?;
            Arc::new(HttpScorer::new(url, Duration::from_millis(detection.scorer_timeout_ms))?)
        }
    };
    Ok(scorer)
}

fn build_source(config: &Config, registry: &Arc<TargetRegistry>) -> Result<Arc<dyn LogSource>> {
    let source: Arc<dyn LogSource> = match config.collector.source {
        SourceKind::File => Arc::new(FileLogSource::new(config.collector.log_dir.clone())),
        SourceKind::Kubernetes => Arc::new(KubeLogSource::new(
            kube::KubeClient::from_config(&config.kubernetes)?,
            registry.clone(),
        )),
    };
    Ok(source)
}

async fn start_orchestrator(
    config: &Config,
    pool: &Pool,
    registry: &Arc<TargetRegistry>,
    alerts: &AlertManager,
) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::new(
        registry.clone(),
        build_adapter(config)?,
        StateStore::new(pool.clone()),
        alerts.clone(),
        config.orchestrator.retry.clone(),
    )?;

    let resumed = orchestrator.resume().await;
    if resumed > 0 {
        tracing::info!(resumed, "Resumed interrupted transitions");
    }

    if config.orchestrator.auto_restore {
        let orch = orchestrator.clone();
        let check = Duration::from_secs(config.orchestrator.recovery_check_secs.max(1));
        let quiet = Duration::from_secs(config.orchestrator.quiet_period_secs);
        tokio::spawn(async move {
            orchestrator::run_recovery_loop(orch, check, quiet).await;
        });
    }

    Ok(orchestrator)
}

async fn start_detector(
    config: &Config,
    pool: &Pool,
    registry: &Arc<TargetRegistry>,
    alerts: &AlertManager,
    sink: Arc<dyn ReportSink>,
) -> Result<Arc<Detector>> {
    let dispatcher = ReportDispatcher::new(
        sink,
        ReportStore::new(pool.clone()),
        alerts.clone(),
        config.report.retry.clone(),
    );

    let redelivery = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = redelivery.redeliver_pending().await {
            tracing::error!("Redelivering pending reports failed: {:#}", e);
        }
    });

    let poll = config.collector.poll_interval();
    let origin = Utc::now() - chrono::Duration::from_std(poll).unwrap_or_default();
    let detector = Arc::new(Detector::new(
        registry.clone(),
        build_source(config, registry)?,
        build_scorer(config)?,
        dispatcher,
        alerts.clone(),
        DetectorSettings {
            window: config.collector.window(),
            poll_interval: poll,
            confidence_threshold: config.detection.confidence_threshold,
            cooldown: Duration::from_secs(config.detection.cooldown_secs),
            degraded_after: config.detection.degraded_after,
            collector_degraded_after: config.collector.degraded_after,
            origin,
        },
    ));

    let engine = detector.clone();
    tokio::spawn(async move {
        detect::run_detector_loop(engine, poll).await;
    });

    Ok(detector)
}

async fn serve_api(
    config: &Config,
    pool: &Pool,
    orchestrator: Orchestrator,
    detector: Option<Arc<Detector>>,
    alerts: AlertManager,
) -> Result<()> {
    let state = api::state::AppState {
        orchestrator,
        detector,
        reports: ReportStore::new(pool.clone()),
        alerts,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid api.bind '{}'", config.api.bind))?;
    tracing::info!(%addr, "meshguard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
