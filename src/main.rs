//! wsrelay - WebSocket relay
//!
//! Usage:
//!   wsrelay [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -i, --instance-id <ID>     Instance id carried on bridged messages
//!   -l, --log-level <LEVEL>    Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help
//!
//! Without `--log-level`, a `WSRELAY_LOG` filter directive (for example
//! `wsrelay=debug,tokio_tungstenite=warn`) takes precedence over `log.level`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wsrelay::config::{Config, ListenerConfig};
use wsrelay::{Metrics, MetricsServer, Relay};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// wsrelay - WebSocket relay with bridged listener pools
#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(version)]
#[command(about = "WebSocket relay with direct and pub/sub bridging")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance id carried as sourceId on bridged messages
    #[arg(short, long)]
    instance_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // CLI overrides WSRELAY_LOG, which overrides config, then default (info)
    let filter = match args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_env("WSRELAY_LOG").unwrap_or_else(|_| {
            let level = match config.log.level.to_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                _ => LogLevel::Info,
            };
            EnvFilter::new(level.as_str())
        }),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(instance_id) = args.instance_id {
        config.relay.instance_id = Some(instance_id);
    }
    if config.listener.is_empty() {
        let bind: SocketAddr = ([0, 0, 0, 0], 8080).into();
        config.listener.push(ListenerConfig::new("default", bind));
    }

    info!("Starting wsrelay");
    info!("  Instance id: {}", config.relay.get_instance_id());
    for listener in &config.listener {
        info!(
            "  Listener: {} on {} (bridge path {})",
            listener.name, listener.bind, listener.bridge_path
        );
    }
    let enabled_bridges = config.enabled_bridges().count();
    info!(
        "  Bridges: {} configured ({} enabled)",
        config.bridge.len(),
        enabled_bridges
    );
    for bridge in &config.bridge {
        let status = if bridge.enabled { "enabled" } else { "disabled" };
        let target = match bridge.strategy {
            wsrelay::StrategyKind::Direct => bridge.url.clone().unwrap_or_default(),
            wsrelay::StrategyKind::Pubsub => format!("channel {}", bridge.channel),
        };
        info!(
            "    - {} -> {} ({}, feeds {}) [{}]",
            bridge.name, target, bridge.strategy, bridge.endpoint, status
        );
    }

    let metrics = Arc::new(Metrics::new());
    let metrics_task = if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let server = MetricsServer::bind(metrics.clone(), config.metrics.bind).await?;
        Some(tokio::spawn(server.run()))
    } else {
        info!("  Metrics: disabled");
        None
    };

    let handle = match Relay::with_metrics(config, metrics).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start relay: {}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    handle.shutdown().await;
    if let Some(task) = metrics_task {
        task.abort();
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
