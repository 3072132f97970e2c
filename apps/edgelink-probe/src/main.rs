//! Edgelink Probe - headless worker-manager connectivity probe.
//!
//! Asks the access point for worker managers (or connects straight to one),
//! keeps the connection alive with heartbeats and recovers from failures the
//! way a real client would. Useful for checking a deployment end to end.

mod config;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use edgelink_core::{ApMode, ChannelRuntime, RuntimeOptions};
use tokio::signal;

use crate::config::ProbeConfig;
use crate::session::Session;

/// Edgelink Probe - holds a worker-manager connection and reports its health.
#[derive(Parser, Debug)]
#[command(name = "edgelink-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "EDGELINK_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Connect straight to this worker manager, skipping the AP.
    #[arg(short = 'w', long)]
    worker_manager: Option<std::net::SocketAddr>,

    /// Application id (overrides config file).
    #[arg(short = 'a', long)]
    app_id: Option<String>,

    /// Channel name (overrides config file).
    #[arg(long)]
    cname: Option<String>,

    /// Use TLS for TCP connections.
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Edgelink Probe v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ProbeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(addr) = args.worker_manager {
        config.worker_manager = Some(addr);
    }
    if let Some(app_id) = args.app_id {
        config.app_id = app_id;
    }
    if let Some(cname) = args.cname {
        config.cname = cname;
    }
    if args.tls {
        config.channel.use_tls = true;
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    let ap = match config.direct_response()? {
        Some(response) => {
            log::info!(
                "Configuration: worker_manager={:?}, tls={}",
                config.worker_manager,
                config.channel.tls_enabled()
            );
            ApMode::Static { response }
        }
        None => {
            log::info!(
                "Configuration: ap_domains={:?}, ports={:?}, tls={}",
                config.channel.domains,
                config.channel.default_ports,
                config.channel.tls_enabled()
            );
            ApMode::Http
        }
    };

    let (handle, events) = ChannelRuntime::spawn(RuntimeOptions {
        ap,
        ..RuntimeOptions::default()
    })
    .context("Failed to start channel runtime")?;

    let sid = uuid::Uuid::new_v4().simple().to_string();
    log::info!("Session {}", sid);

    let mut session = Session::new(
        handle,
        config.channel.clone(),
        config.identity(sid),
        config.service_type.clone(),
        Duration::from_secs(config.heartbeat_interval_secs),
        Duration::from_secs(config.retry_delay_secs),
    );
    session.start().await?;

    let outcome = tokio::select! {
        result = session.run(events) => result,
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            Ok(())
        }
    };

    let stats = session.shutdown().await;
    log::info!(
        "Shutdown complete: {} connection(s), {} error(s), {} heartbeat(s), {} message(s)",
        stats.connections,
        stats.errors,
        stats.heartbeats_sent,
        stats.messages
    );
    outcome
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
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
}
