//! online — the reverse tunnel client CLI.
//!
//! Thin wrapper around `online-client`: parses the CLI surface `spec.md`
//! §6 defines, resolves environment-variable and flag overrides, and drives
//! the forwarder until SIGINT.

mod config;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use online_client::forwarder::{self, ForwarderEvent};
use online_client::ClientConfig;

/// online — expose a local web service through a public tunnel
#[derive(Parser, Debug)]
#[command(name = "online", version, about = "Reverse-tunnel client: expose a local port through a public tunnel")]
struct Cli {
    /// Local port the forwarder sends requests to.
    #[arg(long)]
    port: u16,

    /// Tunnel server control-channel URL or host[:port].
    #[arg(long)]
    server: Option<String>,

    /// Host the local service is reachable on.
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

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

    if cli.port == 0 {
        eprintln!("online: --port must be a nonzero TCP port");
        std::process::exit(1);
    }

    let server_input = cli.server.clone().unwrap_or_else(config::default_server_from_env);
    let server_url = match config::normalize_server_url(&server_input) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("online: invalid --server {server_input:?}: {e}");
            std::process::exit(1);
        }
    };

    let client_config = ClientConfig::new(server_url, cli.port, &cli.local_host);

    let (events_tx, mut events_rx) = mpsc::channel::<ForwarderEvent>(16);
    let events_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ForwarderEvent::Registered { client_id, public_port } => {
                    info!(client_id, public_port, "tunnel established");
                }
                ForwarderEvent::Disconnected { reason, retry_in } => {
                    eprintln!("online: disconnected ({reason}), retrying in {retry_in:?}");
                }
            }
        }
    });

    let forward = tokio::spawn(forwarder::run(client_config, Some(events_tx), Some(config::MAX_INITIAL_ATTEMPTS)));

    tokio::select! {
        result = forward => {
            events_task.abort();
            match result {
                Ok(Ok(())) => unreachable!("forwarder::run only returns on giving up"),
                Ok(Err(reason)) => {
                    error!(error = %reason, "giving up after repeated connection failures");
                    eprintln!("online: giving up after repeated connection failures: {reason}");
                    std::process::exit(2);
                }
                Err(join_err) => {
                    error!(error = %join_err, "forwarder task panicked");
                    std::process::exit(2);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            std::process::exit(0);
        }
    }
}
