use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chaos_common::Logger;
use chaos_controller::cluster::MemoryCluster;
use chaos_controller::config::{Config, DEFAULT_CONFIG_PATH};
use chaos_controller::daemon::TargetDecoder;
use chaos_controller::impls::default_dispatcher;
use chaos_controller::queue::WorkQueue;
use chaos_controller::sources::FileSources;
use chaos_controller::timer::SystemClock;
use chaos_controller::{Controller, Reconciler};
use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chaos-controller")]
#[command(about = "Reconciles chaos experiments against cluster targets")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override `sources.manifests_dir`
    #[arg(long, value_name = "DIR")]
    manifests: Option<PathBuf>,
    /// Override `sources.inventory_path`
    #[arg(long, value_name = "PATH")]
    inventory: Option<PathBuf>,
    /// Override `sources.proxy_config_dir`
    #[arg(long, value_name = "DIR")]
    proxy_config_dir: Option<PathBuf>,
    /// Override `controller.workers`
    #[arg(long)]
    workers: Option<usize>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[controller] failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("[controller] failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[controller] shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config);
    if let Some(dir) = args.manifests {
        config.sources.manifests_dir = dir;
    }
    if let Some(path) = args.inventory {
        config.sources.inventory_path = path;
    }
    if let Some(dir) = args.proxy_config_dir {
        config.sources.proxy_config_dir = Some(dir);
    }
    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }

    let log = Logger::new("controller");
    let clock = Arc::new(SystemClock);

    let mut cluster = MemoryCluster::new(clock.clone());
    if let Some(dir) = &config.sources.proxy_config_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        cluster = cluster.with_object_dir(dir);
    }
    let cluster = Arc::new(cluster);

    let decoder = TargetDecoder::new(
        cluster.clone(),
        config.daemon.port,
        config.daemon.request_timeout(),
        log.with_name("daemon"),
    );
    let dispatcher = default_dispatcher(decoder, cluster.clone(), &log)
        .context("fault implementations are incomplete")?;
    let reconciler = Reconciler::new(
        cluster.clone(),
        cluster.clone(),
        dispatcher,
        clock,
        log.clone(),
    )
    .with_max_apply_attempts(config.controller.max_apply_attempts);
    let queue = WorkQueue::new(
        config.controller.backoff_base(),
        config.controller.backoff_max(),
    );
    let controller = Controller::new(reconciler, cluster.clone(), queue, log.clone());
    let sources = FileSources::new(config.sources.clone(), log.clone());

    let workers = controller.spawn_workers(config.controller.workers);
    info!(
        "[controller] started {} workers, watching {}",
        config.controller.workers.max(1),
        config.sources.manifests_dir.display()
    );

    let resync = async {
        let mut ticker = tokio::time::interval(config.controller.resync_interval());
        loop {
            ticker.tick().await;
            match sources.sync(&cluster).await {
                Ok(touched) => {
                    for key in touched {
                        controller.queue().add(key);
                    }
                }
                Err(e) => warn!("[controller] sync failed: {e:#}"),
            }
            if let Err(e) = controller.enqueue_all().await {
                warn!("[controller] failed to list resources: {e}");
            }
        }
    };

    tokio::select! {
        _ = resync => {},
        _ = shutdown_signal() => {},
    }

    controller.shutdown(workers).await;
    info!("[controller] stopped");
    Ok(())
}
