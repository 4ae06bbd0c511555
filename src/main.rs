//! API gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client
//!     │
//!     ▼
//!   net ─────────── listener, TLS with SNI certificate selection
//!     │
//!     ▼
//!   http::server ── request ID, access log, panic recovery
//!     │
//!     ▼
//!   routing ─────── vhost by host pattern, then endpoint by path and method
//!     │
//!     ▼
//!   http::cors ──── vhost rules, then endpoint rules
//!     │
//!     ├──▶ http::proxy ───── one HTTP round trip ──────▶ Backend
//!     └──▶ http::websocket ─ bidirectional relay ──────▶ Backend
//!
//!   Cross-cutting: config (load, validate, watch), observability, lifecycle
//! ```

use std::path::PathBuf;

use clap::Parser;

use api_gateway::config::schema::{LogFormat, DEFAULT_BIND_ADDRESS};
use api_gateway::config::{load_config, watcher::ConfigWatcher};
use api_gateway::http::server::DRAIN_TIMEOUT;
use api_gateway::lifecycle::{spawn_signal_handler, Shutdown};
use api_gateway::net;
use api_gateway::observability::{init_tracing, metrics};
use api_gateway::HttpServer;

/// Command-line options; flags win over the configuration file.
#[derive(Parser, Debug)]
#[command(name = "api-gateway", version, about = "Virtual-host API gateway for HTTP and WebSocket backends")]
struct Cli {
    /// Listen address; a bare `:port` binds every interface [default: :1973]
    #[arg(short, long)]
    addr: Option<String>,

    /// Gateway configuration file (JSON, or TOML by extension)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Reload the configuration when the file changes
    #[arg(long)]
    watch: bool,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.log_format.unwrap_or_default(), "info");
            tracing::error!(path = ?cli.config, error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    init_tracing(
        cli.log_format.unwrap_or(config.observability.log_format),
        &config.observability.log_level,
    );
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = %config.identifier(),
        vhosts = config.vhosts.len(),
        "api-gateway starting"
    );

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    if let Some(address) = &config.observability.metrics_address {
        metrics::init_metrics(net::listen_address(address)?)?;
    }

    let server = HttpServer::new(&config)?;
    let sessions = server.sessions();

    let address = cli
        .addr
        .or_else(|| config.listener.bind_address.clone())
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
    let listener = net::bind(&address).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    // Dropping the watcher stops it.
    let _watcher = if cli.watch {
        let (watcher, updates) = ConfigWatcher::new(&cli.config);
        let handle = watcher.run()?;
        tokio::spawn(server.reload_handle().watch(updates));
        Some(handle)
    } else {
        None
    };

    server.run(listener, shutdown).await?;

    let open = sessions.active_count();
    if open > 0 {
        tracing::info!(sessions = open, "Waiting for WebSocket sessions to end");
        if tokio::time::timeout(DRAIN_TIMEOUT, sessions.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                sessions = sessions.active_count(),
                "WebSocket sessions still open at exit"
            );
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
