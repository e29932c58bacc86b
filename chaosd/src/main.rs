use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use caps::{CapSet, Capability};
use chaos_common::Logger;
use chaosd::config::{Config, DEFAULT_CONFIG_PATH};
use chaosd::server::{all_routes, AppState};
use chaosd::Executor;
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::Notify;

#[derive(Parser, Debug)]
#[command(name = "chaosd")]
#[command(about = "Per-node chaos daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override `server.listen_addr`
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

/// Joining another process's namespaces needs CAP_SYS_ADMIN; attaching to a
/// JVM needs CAP_SYS_PTRACE.
fn check_capabilities() -> anyhow::Result<()> {
    if std::env::var("CHAOSD_SKIP_CAP_CHECK").is_ok() {
        warn!("[chaosd] skipping capability check (CHAOSD_SKIP_CAP_CHECK set)");
        return Ok(());
    }

    let has_admin = caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)
        .context("failed to query CAP_SYS_ADMIN")?;
    let has_ptrace = caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_PTRACE)
        .context("failed to query CAP_SYS_PTRACE")?;

    if has_admin && has_ptrace {
        info!("[chaosd] running with CAP_SYS_ADMIN + CAP_SYS_PTRACE");
        return Ok(());
    }

    eprintln!("\nERROR: chaosd needs CAP_SYS_ADMIN and CAP_SYS_PTRACE");
    eprintln!("\nRun it as a privileged daemonset with hostPID enabled.\n");
    anyhow::bail!("missing CAP_SYS_ADMIN or CAP_SYS_PTRACE")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[chaosd] failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("[chaosd] failed to listen for SIGTERM: {e}");
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
    info!("[chaosd] shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    check_capabilities()?;

    let mut config = Config::load(&args.config);
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if config.attach.byteman_home.is_none() {
        warn!("[chaosd] BYTEMAN_HOME not set; jvm rule installs will fail");
    }

    let log = Logger::new("chaosd");
    let state = Arc::new(AppState {
        executor: Executor::from_config(&config, log.with_name("executor")),
        request_timeout: config.server.request_timeout(),
        log: log.with_name("server"),
    });
    let app = all_routes(state);

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!("[chaosd] listening on {}", config.server.listen_addr);

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let stop = Arc::clone(&stop);
        async move { stop.notified().await }
    });
    let handle = tokio::spawn(async move { server.await });

    shutdown_signal().await;
    stop.notify_one();
    // In-flight requests get a bounded window to finish.
    let drain = config.server.request_timeout() + Duration::from_secs(5);
    match tokio::time::timeout(drain, handle).await {
        Ok(Ok(result)) => result.context("server error")?,
        Ok(Err(e)) => anyhow::bail!("server task failed: {e}"),
        Err(_) => warn!("[chaosd] graceful shutdown timed out, forcing exit"),
    }
    Ok(())
}
