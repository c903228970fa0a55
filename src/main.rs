use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshguard::config::{Config, LogFormat};
use meshguard::orchestrator::RoutingState;
use meshguard::storage::{self, StateStore};

#[derive(Parser)]
#[command(
    name = "meshguard",
    about = "Traffic anomaly detection and automated failover for service-mesh targets",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $MESHGUARD_CONFIG, /etc/meshguard/meshguard.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (detector + orchestrator + API)
    Serve {
        /// Bind address, overrides api.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run only the detector and ship reports to report.receiver_url
    Detect,

    /// Run only the orchestrator and its API (report receiver)
    Receive {
        /// Bind address, overrides api.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the persisted routing state of every target
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Ask a running daemon to restore a failed-over target
    Restore {
        /// Logical target name
        #[arg(long)]
        target: String,

        /// Daemon API base URL
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        api: String,
    },

    /// Validate the configuration and print the resolved targets
    CheckConfig,
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, targets = config.targets.len(), "Starting meshguard daemon");
            meshguard::serve(&config).await?;
        }
        Commands::Detect => {
            tracing::info!(targets = config.targets.len(), "Starting detector");
            meshguard::detect(&config).await?;
        }
        Commands::Receive { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting report receiver");
            meshguard::receive(&config).await?;
        }
        Commands::Status { json } => {
            let pool = storage::open_pool(&config.storage.path)?;
            let store = StateStore::new(pool);
            let states: Vec<RoutingState> = config
                .targets()
                .iter()
                .map(|t| Ok(store.load(&t.name)?.unwrap_or_else(|| RoutingState::initial(t))))
                .collect::<Result<_>>()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else if states.is_empty() {
                println!("No targets configured.");
            } else {
                println!(
                    "{:<16} | {:<13} | {:<9} | {:<8} | Last report",
                    "Target", "Phase", "Weights", "Replicas"
                );
                println!("{:-<16}-|-{:-<13}-|-{:-<9}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
                for s in states {
                    println!(
                        "{:<16} | {:<13} | {:<9} | {:<8} | {}",
                        s.target,
                        s.phase,
                        format!("{}/{}", s.applied.weights.primary, s.applied.weights.standby),
                        s.applied.replicas,
                        s.last_report.as_ref().map(|r| r.as_str()).unwrap_or("-")
                    );
                }
            }
        }
        Commands::Restore { target, api } => {
            let url = format!(
                "{}/api/v1/targets/{}/restore",
                api.trim_end_matches('/'),
                target
            );
            let resp = reqwest::Client::new()
                .post(&url)
                .send()
                .await
                .with_context(|| format!("contacting {}", url))?;
            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            if !status.is_success() {
                let reason = body["error"].as_str().unwrap_or("no details");
                bail!("restore of '{}' rejected ({}): {}", target, status, reason);
            }
            println!("Restore of '{}' started.", target);
            if let Some(intents) = body["data"]["intents"].as_array() {
                for intent in intents {
                    println!(" - {}", intent["key"].as_str().unwrap_or("?"));
                }
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            let targets = config.require_targets()?;
            println!("Configuration OK: {} target(s)", targets.len());
            for t in targets {
                println!(
                    " - {:<12} route={} host={} {}->{} deployment={} replicas={}",
                    t.name, t.route, t.host, t.primary_subset, t.standby_subset, t.deployment, t.replicas
                );
            }
        }
    }

    Ok(())
}
