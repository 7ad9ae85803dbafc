//! Repair manager entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;

use prometheus_cluster_manager::config::ManagerConfig;
use prometheus_cluster_manager::infra::kube::RestKube;
use prometheus_cluster_manager::infra::store::{DataStore, InMemoryStore};
use prometheus_cluster_manager::repair::{
    instantiate_rules, AgentClient, RepairManager, RepairMetrics, StaticRuleData,
};
use prometheus_cluster_manager::runtime::{serve_metrics, RepairLoop};
use prometheus_cluster_manager::util::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "repair-manager")]
#[command(about = "Node repair loop for the Prometheus AI Platform")]
#[command(version)]
struct Cli {
    /// Path to config.yaml or the directory containing it.
    #[arg(long, short = 'c', default_value = "/etc/cluster-manager")]
    config: PathBuf,

    /// Log directory (the subscriber reads RUST_LOG; kept for parity with
    /// deployment manifests).
    #[arg(long, short = 'l', default_value = "/var/log/repairmanager")]
    log: PathBuf,

    /// Seconds between repair ticks; overrides the config value.
    #[arg(long, short = 'i')]
    interval: Option<u64>,

    /// Port of the metrics exporter.
    #[arg(long, short = 'p', default_value_t = 9080)]
    port: u16,

    /// Port of the on-node repair agents; overrides the config value.
    #[arg(long, short = 'a')]
    agent_port: Option<u16>,

    /// Log intended patches without mutating Kubernetes.
    #[arg(long, short = 'd', default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match ManagerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            return ExitCode::from(2);
        }
    };
    let interval_secs = cli.interval.unwrap_or(config.repair.interval_secs);
    let agent_port = cli.agent_port.unwrap_or(config.repair.agent_port);
    let dry_run = cli.dry_run || config.repair.dry_run;

    let registry = Registry::new();
    let metrics = match RepairMetrics::new(&registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::error!("failed to set up metrics: {e}");
            return ExitCode::from(2);
        }
    };

    let kube = match RestKube::new(config.kube.api_url.clone(), config.kube.token.clone()) {
        Ok(kube) => Arc::new(kube),
        Err(e) => {
            tracing::error!("failed to build kubernetes client: {e}");
            return ExitCode::from(2);
        }
    };
    // The relational store and the rule metrics source are
    // deployment-specific; in-memory stand-ins until wired here.
    let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
    let rules = instantiate_rules(&config.repair.rules, Arc::new(StaticRuleData::new()));

    let agent = match AgentClient::new(agent_port) {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!("failed to build agent client: {e}");
            return ExitCode::from(2);
        }
    };

    tracing::info!("starting repair manager");
    let manager = RepairManager::new(rules, kube, store, agent, metrics, dry_run);

    tokio::spawn(async move {
        if let Err(e) = serve_metrics(registry, cli.port).await {
            tracing::error!("metrics server failed: {e}");
        }
    });

    RepairLoop::new(manager, interval_secs).run().await;
    ExitCode::SUCCESS
}
