//! ciphertalk: terminal chat client.
//!
//! Reads lines from stdin: plain text is broadcast, `/users` lists who is
//! online, `/whisper <user> <message>` sends privately, `/exit` leaves.

mod commands;
mod config;

use anyhow::{Context, Result};
use ciphertalk_client::{ChatClient, ClientDispatch};
use ciphertalk_core::messages::{fields, BROADCAST_MESSAGE, USER_CONNECT, USER_DISCONNECT, WHISPER};
use ciphertalk_core::{Framing, KeyPairManager};
use clap::Parser;
use commands::Command;
use rand::distributions::{Alphanumeric, DistString};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

/// ciphertalk: encrypted terminal chat
#[derive(Parser, Debug)]
#[command(name = "ciphertalk", version, about = "Encrypted terminal chat client")]
struct Cli {
    /// Server host
    #[arg(short = 'i', long, visible_alias = "ip")]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Identity to claim
    #[arg(short, long, visible_alias = "uid")]
    user: Option<String>,

    /// Message framing on the wire (length-prefixed or raw)
    #[arg(long)]
    framing: Option<Framing>,

    /// Config file path
    #[arg(long, default_value = "~/.ciphertalk/client.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("ciphertalk: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::Config::load(&cli.config)?;
    let client_config = cfg.client_config(config::Overrides {
        host: cli.host,
        port: cli.port,
        user: cli.user,
        framing: cli.framing,
    });

    // Keys live for this process only; the passphrase never leaves memory.
    let passphrase = Alphanumeric.sample_string(&mut rand::thread_rng(), 32);
    let keys = KeyPairManager::generate(&passphrase).context("failed to generate keys")?;

    eprintln!("connecting to {} as {}...", client_config.addr(), client_config.user);
    let own = client_config.user.clone();
    let client = ChatClient::connect_with(&client_config, &keys, printing_dispatch(own))
        .await
        .with_context(|| format!("failed to join {}", client_config.addr()))?;
    eprintln!(
        "connected as {} (server key {})",
        client.identity(),
        ciphertalk_core::short_fingerprint(client.server_fingerprint(), 16)
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = client.closed() => {
                eprintln!("connection closed by server");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match Command::parse(&line).execute(&client).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("! {e:#}"),
                }
            }
        }
    }

    let _ = client.close().await;
    Ok(())
}

/// Print server pushes; our own broadcasts are already on screen.
fn printing_dispatch(own: String) -> ClientDispatch {
    ClientDispatch::new()
        .on(BROADCAST_MESSAGE, move |env| {
            let author = env.get_str(fields::AUTHOR).unwrap_or("?");
            if author != own {
                println!("[{author}] {}", env.get_str(fields::MESSAGE).unwrap_or_default());
            }
        })
        .on(WHISPER, |env| {
            println!(
                "[{} whispers] {}",
                env.get_str(fields::FROM).unwrap_or("?"),
                env.get_str(fields::MESSAGE).unwrap_or_default()
            );
        })
        .on(USER_CONNECT, |env| {
            println!("* {} joined", env.get_str(fields::USER).unwrap_or("?"));
        })
        .on(USER_DISCONNECT, |env| {
            println!("* {} left", env.get_str(fields::USER).unwrap_or("?"));
        })
}
