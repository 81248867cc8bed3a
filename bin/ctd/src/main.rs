//! ---
//! ct_section: "01-core-functionality"
//! ct_subsection: "binary"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Binary entrypoint for the coffee table service daemon."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ct_common::{init_tracing, AppConfig};
use ct_metrics::{new_registry, spawn_http_server, DaemonMetrics};
use ct_msg::MessagingMetricsExporter;
use ct_net::{TcpServerBuilder, TcpTransport};
use ct_router::{register_builtin_handlers, spawn_change_broadcaster, ApplicationStore, Router};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Coffee table service daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the service until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then print the effective settings")]
    CheckConfig,
    #[command(about = "List the applications found in the applications directory")]
    Apps,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/ctd.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("ctd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::CheckConfig => {
            println!("# {}", loaded.source.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Apps => {
            let store = ApplicationStore::new();
            store.load_from_directory(&config.applications.directory)?;
            let infos: Vec<_> = store.applications().into_iter().map(|app| app.info).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, config_load_seconds: f64) -> Result<()> {
    let store = Arc::new(ApplicationStore::new());
    let installed = store
        .load_from_directory(&config.applications.directory)
        .with_context(|| format!("failed to scan {}", config.applications.directory.display()))?;
    info!(installed, directory = %config.applications.directory.display(), "applications discovered");

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.observe_config_load(config_load_seconds);
    daemon_metrics.set_installed_applications(installed);
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );
    let messaging_metrics = Arc::new(MessagingMetricsExporter::register(&registry)?);

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let transport = Arc::new(TcpTransport::new());
    let router = Router::builder(store.clone(), transport.clone())
        .service_name(config.service.name.clone())
        .request_timeout(config.messaging.request_timeout)
        .metrics(messaging_metrics)
        .build();
    register_builtin_handlers(&router)?;

    let reaper = router.dispatcher().spawn_reaper(config.messaging.sweep_interval);
    let broadcaster = spawn_change_broadcaster(router.clone(), store.subscribe());

    let observer_metrics = daemon_metrics.clone();
    let server = TcpServerBuilder::new(config.transport.listen, transport, router.clone())
        .max_frame_bytes(config.transport.max_frame_bytes)
        .on_connection_change(move |opened| {
            if opened {
                observer_metrics.connection_opened();
            } else {
                observer_metrics.connection_closed();
            }
        })
        .spawn()
        .await?;

    info!(address = %server.local_addr(), service = %config.service.name, "service running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");

    server.shutdown().await?;
    reaper.abort();
    broadcaster.abort();
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["ctd", "--config", "x.toml", "check-config"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(Cli::try_parse_from(["ctd"]).expect("parse").command.is_none());
    }
}
