//! online-server — the reverse tunnel server CLI.
//!
//! Thin wrapper around the `online_server` library: parses the CLI surface
//! `spec.md` §6 defines, resolves config-file/environment/flag overrides,
//! and drives [`OnlineServer`] until a shutdown signal.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use online_server::port_allocator::PortRange;
use online_server::{CliOverrides, OnlineServer, ServerConfig};

/// online-server — self-hosted HTTP reverse tunnel server
#[derive(Parser, Debug)]
#[command(name = "online-server", version, about = "Self-hosted HTTP reverse tunnel server")]
struct Cli {
    /// Address the control-channel WebSocket listener binds to.
    #[arg(long)]
    listen: Option<String>,

    /// Host the per-client public listeners bind to.
    #[arg(long)]
    public_bind_host: Option<String>,

    /// Public port range handed out to clients, e.g. "20000-20100".
    #[arg(long)]
    port_range: Option<String>,

    /// Seconds to wait for a client's response before a public request times out.
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Maximum number of simultaneously registered clients.
    #[arg(long)]
    max_clients: Option<usize>,

    /// Seconds to let in-flight requests drain before a session is force-closed at shutdown.
    #[arg(long)]
    shutdown_grace_secs: Option<u64>,

    /// Maximum accepted public request body size, in bytes.
    #[arg(long)]
    max_request_body_bytes: Option<usize>,

    /// Path to a TOML config file.
    #[arg(long, default_value = "~/.online/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting online-server");

    let port_range = match cli.port_range {
        Some(s) => match s.parse::<PortRange>() {
            Ok(r) => Some(r),
            Err(e) => {
                error!(error = %e, "invalid --port-range");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let config_path = online_server::config::expand_tilde(&PathBuf::from(&cli.config));
    let overrides = CliOverrides {
        listen: cli.listen,
        public_bind_host: cli.public_bind_host,
        port_range,
        request_timeout_secs: cli.request_timeout,
        max_clients: cli.max_clients,
        shutdown_grace_secs: cli.shutdown_grace_secs,
        max_request_body_bytes: cli.max_request_body_bytes,
    };

    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        listen = %server_config.listen,
        port_range = %server_config.port_range,
        max_clients = server_config.max_clients,
        "configuration loaded"
    );

    let server = OnlineServer::new(server_config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server failed to bind");
                std::process::exit(2);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, draining sessions");
            server.shutdown().await;
        }
    }

    info!("online-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
