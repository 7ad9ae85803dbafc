//! Job manager entry point.
//!
//! Two instances of this binary form the job manager: one launched with
//! `--status queued` runs the scheduling pass, the other with
//! `--status unapproved,scheduling,running,killing,pausing` runs the
//! per-job action loop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;

use prometheus_cluster_manager::config::{LauncherConfig, ManagerConfig};
use prometheus_cluster_manager::infra::email::EmailSender;
use prometheus_cluster_manager::infra::kube::RestKube;
use prometheus_cluster_manager::infra::launcher::{
    ControllerLauncherStub, InProcessLauncher, Launcher,
};
use prometheus_cluster_manager::infra::logs::NullLogExtractor;
use prometheus_cluster_manager::infra::notify::{LogSink, MessageSink, Notifier};
use prometheus_cluster_manager::infra::store::{DataStore, InMemoryStore};
use prometheus_cluster_manager::infra::timing::RedisTimingStore;
use prometheus_cluster_manager::runtime::{serve_metrics, JobManagerLoop};
use prometheus_cluster_manager::scheduler::latency::StateLatency;
use prometheus_cluster_manager::scheduler::Services;
use prometheus_cluster_manager::util::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "job-manager")]
#[command(about = "Job scheduling and lifecycle loop for the Prometheus AI Platform")]
#[command(version)]
struct Cli {
    /// Port of the redis coordination store.
    #[arg(long, short = 'r', default_value_t = 9300)]
    redis_port: u16,

    /// Port of the metrics exporter.
    #[arg(long, short = 'p', default_value_t = 9200)]
    port: u16,

    /// Target statuses to process; `queued` selects the scheduling pass.
    #[arg(long, short = 's', default_value = "queued")]
    status: String,

    /// Path to config.yaml or the directory containing it.
    #[arg(long, short = 'c', default_value = "/etc/cluster-manager")]
    config: PathBuf,
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

    let registry = Registry::new();
    let latency = match StateLatency::new(&registry) {
        Ok(latency) => latency,
        Err(e) => {
            tracing::error!("failed to set up metrics: {e}");
            return ExitCode::from(2);
        }
    };

    // The relational store is deployment-specific; the in-memory store
    // stands in until one is wired here.
    let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
    let kube = match RestKube::new(config.kube.api_url.clone(), config.kube.token.clone()) {
        Ok(kube) => Arc::new(kube),
        Err(e) => {
            tracing::error!("failed to build kubernetes client: {e}");
            return ExitCode::from(2);
        }
    };
    let launcher: Arc<dyn Launcher> = match config.job_manager.launcher {
        LauncherConfig::Process => Arc::new(InProcessLauncher::new(store.clone())),
        LauncherConfig::Controller => {
            Arc::new(ControllerLauncherStub::new(store.clone(), kube.clone()))
        }
    };
    let timing = match RedisTimingStore::new(cli.redis_port) {
        Ok(timing) => Arc::new(timing),
        Err(e) => {
            tracing::error!("failed to build redis client: {e}");
            return ExitCode::from(2);
        }
    };
    let sink: Arc<dyn MessageSink> = match &config.job_manager.email {
        Some(email) => Arc::new(EmailSender::new(email.clone())),
        None => Arc::new(LogSink),
    };

    let services = Services {
        store,
        launcher,
        kube,
        timing,
        latency,
        notifier: Notifier::spawn(sink),
        logs: Arc::new(NullLogExtractor),
    };

    let job_loop = match JobManagerLoop::new(
        services,
        config.job_manager.storage_mount_path.clone(),
        &cli.status,
    ) {
        Ok(job_loop) => job_loop,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    tokio::spawn(async move {
        if let Err(e) = serve_metrics(registry, cli.port).await {
            tracing::error!("metrics server failed: {e}");
        }
    });

    job_loop.run().await;
    ExitCode::SUCCESS
}
