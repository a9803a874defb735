//! ciphertalk-server: encrypted chat relay.
//!
//! Accepts TCP connections, authenticates peers with the ciphertalk key
//! handshake, and relays broadcast and direct messages between them.

use ciphertalk_core::Framing;
use ciphertalk_server::keyfile::{load_server_keys, PASSPHRASE_ENV};
use ciphertalk_server::{ChatServer, ConfigOverrides, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// ciphertalk-server: encrypted chat relay
#[derive(Parser, Debug)]
#[command(name = "ciphertalk-server", version, about = "Encrypted chat relay server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Message framing on the wire (length-prefixed or raw)
    #[arg(long)]
    framing: Option<Framing>,

    /// Handshake timeout in seconds (0 disables)
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Passphrase-protected server key file (created if missing)
    #[arg(long)]
    key_file: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ciphertalk/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ciphertalk-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        framing: cli.framing,
        handshake_timeout: cli.handshake_timeout,
        key_file: cli.key_file,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let keys = match load_server_keys(&config, std::env::var(PASSPHRASE_ENV).ok()) {
        Ok(keys) => keys,
        Err(e) => {
            error!(error = %e, "failed to load server key");
            std::process::exit(1);
        }
    };

    let server = Arc::new(ChatServer::new(config, keys));

    let signalled = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signalled.shutdown();
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
