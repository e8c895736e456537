//! mcp-on-demand: a multiplexing proxy for MCP servers.
//!
//! Presents one MCP server to the host while federating many upstream MCP
//! servers, each a child process over stdio. Tool schemas are served from a
//! persistent cache, children are spawned on first call and reaped after an
//! idle window, and an optional tool-search mode compresses the catalog into
//! two meta-tools backed by a BM25 index.

mod cache;
mod client;
mod commands;
mod config;
mod dashboard;
mod error;
mod index;
mod modes;
mod protocol;
mod proxy;
mod sse;
mod stdio;
mod supervisor;

use crate::cache::SchemaCache;
use crate::config::{Config, ServerMap, Settings};
use crate::proxy::ProxyServer;
use crate::supervisor::ChildManager;
use clap::{Parser, Subcommand};
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Delay between sequential background discoveries at startup.
const DISCOVERY_SPACING: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "mcp-on-demand")]
#[command(
    version,
    about = "Multiplexing MCP proxy: lazy server startup, schema cache, tool search"
)]
struct Cli {
    /// Path to the config file (JSON). Defaults to the user config directory.
    #[arg(short = 'c', long = "config", env = "MCP_ON_DEMAND_CONFIG")]
    config: Option<PathBuf>,

    /// Log level. Supports tracing filter syntax. Logs always go to stderr.
    #[arg(short = 'l', long = "log-level", env = "MCP_ON_DEMAND_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy on HTTP/SSE only (no stdio transport).
    Serve,
    /// Spawn each configured server once, persist tool schemas, stop them.
    Generate,
    /// Start the dashboard HTTP server.
    Dashboard {
        #[arg(long, default_value_t = dashboard::DEFAULT_DASHBOARD_PORT)]
        port: u16,
    },
    /// Print configured servers and a cache summary.
    Status,
    /// Delete cache files.
    Reset,
    /// Run an offline full-text query against the cached schemas.
    Search { query: Vec<String> },
}

enum Transport {
    Stdio,
    Sse,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.clone()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.effective_log_level(cli.log_level.as_deref()));
    tracing::info!("mcp-on-demand v{}", env!("CARGO_PKG_VERSION"));

    let outcome: anyhow::Result<bool> = match &cli.command {
        None => run_proxy(config, Transport::Stdio).await.map(|()| true),
        Some(Command::Serve) => run_proxy(config, Transport::Sse).await.map(|()| true),
        Some(Command::Generate) => commands::generate(&config).await,
        Some(Command::Dashboard { port }) => {
            run_dashboard(config, *port).await.map(|()| true)
        }
        Some(Command::Status) => commands::status(&config).await.map(|()| true),
        Some(Command::Reset) => commands::reset(&config).await.map(|()| true),
        Some(Command::Search { query }) => {
            commands::search(&config, &query.join(" ")).await.map(|()| true)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_proxy(config: Config, transport: Transport) -> anyhow::Result<()> {
    let settings = config.settings().clone();
    let order = config.file.servers.names();

    let cache = Arc::new(SchemaCache::new(config.cache_file(), order.clone()));
    cache.load().await;
    cache.retain_servers(&order);

    let manager = ChildManager::new(&config.file.servers, &settings);
    let mode = modes::build(
        settings.mode,
        cache.clone(),
        manager.clone(),
        settings.prefix_tools,
    );
    let proxy = Arc::new(ProxyServer::new(mode));

    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());
    spawn_warmup(
        cache.clone(),
        manager.clone(),
        settings.clone(),
        config.file.servers.clone(),
        shutdown.clone(),
    );

    match transport {
        Transport::Stdio => stdio::run(proxy, manager, shutdown).await?,
        Transport::Sse => {
            let served = sse::serve(
                proxy,
                manager.clone(),
                settings.sse_port,
                settings.sse_session_timeout_duration(),
                shutdown.clone(),
            )
            .await;
            manager.shutdown_all().await;
            served?;
        }
    }

    tracing::info!("proxy shut down");
    Ok(())
}

async fn run_dashboard(config: Config, port: u16) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());
    dashboard::serve(config, port, shutdown).await
}

/// Fill cache gaps in the background, then warm the preload set. Discovery is
/// sequential with spacing; discovered children stay up until the idle reaper
/// takes them down.
fn spawn_warmup(
    cache: Arc<SchemaCache>,
    manager: Arc<ChildManager>,
    settings: Settings,
    servers: ServerMap,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let missing: Vec<String> = servers
            .names()
            .into_iter()
            .filter(|name| !cache.is_cached(name))
            .collect();

        for (i, name) in missing.iter().enumerate() {
            if shutdown.is_cancelled() {
                return;
            }
            if i > 0 {
                tokio::time::sleep(DISCOVERY_SPACING).await;
            }
            match manager.discover_tools(name).await {
                Ok(tools) => {
                    tracing::info!(server = %name, tools = tools.len(), "discovered tool schemas");
                    cache.update_server(name, tools);
                    if let Err(e) = cache.save().await {
                        tracing::warn!(error = %e, "failed to persist schema cache");
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "background schema discovery failed");
                }
            }
        }

        if !shutdown.is_cancelled() {
            manager.preload(&settings.preload, &servers).await;
        }
    });
}

fn spawn_signal_watcher(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("received Ctrl+C; shutting down");
            }
            () = terminate => {
                tracing::info!("received SIGTERM; shutting down");
            }
        }
        shutdown.cancel();
    });
}

/// Logging goes to stderr unconditionally: in stdio mode stdout belongs to the
/// protocol channel. Human-readable on a TTY, JSON otherwise.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let is_tty = std::io::stderr().is_terminal();

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
