//! vmscaled — the vmscale daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Control-plane client (Proxmox VE, or simulated)
//! - Autoscaling controller
//! - REST API
//!
//! # Usage
//!
//! ```text
//! vmscaled serve --config /etc/vmscale/vmscale.toml --port 8080
//! vmscaled serve --simulate --data-dir ./data --log-format json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vmscale_api::{ApiState, build_router};
use vmscale_autoscale::{AutoscaleController, Autoscaler, Thresholds};
use vmscale_control::{ControlPlane, InMemoryControlPlane, ProxmoxClient, ResourceProbe};
use vmscale_core::{Settings, load_env_file};
use vmscale_state::{StateStore, VmLocks};

const DEFAULT_FILTER: &str = "info,vmscaled=debug,vmscale=debug";
const SIMULATED_NODE: &str = "pve-sim";

#[derive(Parser)]
#[command(name = "vmscaled", about = "vmscale daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and run the autoscaler.
    Serve {
        /// TOML settings file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Env file read before anything else. Defaults to `.env`.
        #[arg(long)]
        env_file: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,

        /// Use an in-process control plane instead of Proxmox VE.
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            env_file,
            data_dir,
            port,
            log_format,
            simulate,
        } => {
            // RUST_LOG may come from the env file.
            let env_loaded = load_env_file(env_file.as_deref());
            init_tracing(log_format);
            if let Some(path) = env_loaded {
                info!(path = %path.display(), "env file loaded");
            }
            let mut settings = Settings::load(config.as_deref())?;
            if let Some(dir) = data_dir {
                settings.server.data_dir = dir;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            run_serve(settings, simulate).await
        }
    }
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn init_tracing(format: LogFormat) {
    let filter = log_filter();
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run_serve(settings: Settings, simulate: bool) -> anyhow::Result<()> {
    info!(?settings, simulate, "vmscale daemon starting");

    // State store.
    std::fs::create_dir_all(&settings.server.data_dir)?;
    let db_path = settings.server.data_dir.join("vmscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Control plane.
    let call_timeout = settings.autoscale.call_timeout();
    let control: Arc<dyn ControlPlane> = if simulate {
        let plane = InMemoryControlPlane::new();
        plane.add_node(SIMULATED_NODE);
        info!(node = SIMULATED_NODE, "using simulated control plane");
        Arc::new(plane)
    } else {
        let client = ProxmoxClient::new(&settings.proxmox, call_timeout)?;
        info!(url = %settings.proxmox.base_url(), "using proxmox control plane");
        Arc::new(client)
    };

    // Autoscaler.
    let locks = VmLocks::new();
    let probe = ResourceProbe::new(control.clone(), call_timeout);
    let autoscaler = Autoscaler::new(
        store.clone(),
        probe,
        locks.clone(),
        Thresholds::from(&settings.autoscale),
    );
    let controller = Arc::new(AutoscaleController::new(
        autoscaler,
        settings.autoscale.interval(),
        settings.autoscale.stop_timeout(),
    ));
    if settings.autoscale.autostart {
        controller.start().await;
    } else {
        info!("autoscaler autostart disabled");
    }

    // API server.
    let router = build_router(ApiState {
        store,
        control,
        controller: controller.clone(),
        locks,
        call_timeout,
        software: Arc::new(settings.software.clone()),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.stop().await;
    info!("vmscale daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_honours_rust_log_from_env_file() {
        // Variables already in the environment take precedence over the file.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "RUST_LOG=warn\n").unwrap();

        assert!(load_env_file(Some(path.as_path())).is_some());
        let filter = log_filter().to_string();
        assert!(filter.contains("warn"), "filter was {filter}");
        assert_ne!(filter, DEFAULT_FILTER);
    }

    #[test]
    fn serve_accepts_env_file_flag() {
        let cli = Cli::try_parse_from(["vmscaled", "serve", "--env-file", "/etc/vmscale/env"])
            .unwrap();
        let Command::Serve { env_file, .. } = cli.command;
        assert_eq!(env_file, Some(PathBuf::from("/etc/vmscale/env")));
    }
}
