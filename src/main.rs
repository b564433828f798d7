//! relaylink - chat with a peer over a relay-negotiated data channel

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use relaylink::network::{
    default_ice_servers, HttpRelay, IceServer, RelayConfig, Session, SessionConfig,
    WebRtcTransport, DEFAULT_RELAY_URL,
};

#[derive(Parser)]
#[command(name = "relaylink")]
#[command(about = "Peer-to-peer chat negotiated over a polling HTTP relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a connection and wait for a peer to join
    Host(LinkArgs),

    /// Join a peer that is hosting
    Join(LinkArgs),
}

#[derive(Args)]
struct LinkArgs {
    /// Client ID, unique per participant (random if omitted)
    #[arg(short, long)]
    id: Option<String>,

    /// Relay base URL
    #[arg(short, long, env = "RELAYLINK_RELAY", default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// STUN server URL; repeat to use several (replaces the defaults)
    #[arg(long)]
    stun: Vec<String>,

    /// Do not use the default TURN fallbacks
    #[arg(long)]
    no_turn: bool,

    /// Seconds to wait for the channel to open
    #[arg(long, default_value = "120")]
    timeout: u64,

    /// Send a single message and exit (non-interactive mode)
    #[arg(short = 'm', long)]
    message: Option<String>,
}

#[derive(Clone, Copy)]
enum Side {
    Host,
    Join,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn ice_servers(args: &LinkArgs) -> Vec<IceServer> {
    let defaults = default_ice_servers();
    let mut servers: Vec<IceServer> = if args.stun.is_empty() {
        defaults.iter().filter(|s| !s.is_turn()).cloned().collect()
    } else {
        args.stun.iter().map(IceServer::stun).collect()
    };
    if !args.no_turn {
        servers.extend(defaults.into_iter().filter(|s| s.is_turn()));
    }
    servers
}

fn print_payload(payload: &Value) {
    match payload.get("text").and_then(|t| t.as_str()) {
        Some(text) => println!("💬 Peer: {}", text),
        None => println!("📦 Peer: {}", payload),
    }
}

async fn run_link(side: Side, args: LinkArgs) -> Result<()> {
    let client_id = args
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string()[..8].to_string());

    let relay = HttpRelay::new(RelayConfig {
        base_url: args.relay.clone(),
        ..Default::default()
    })
    .context("Failed to build relay client")?;

    let config = SessionConfig {
        ice_servers: ice_servers(&args),
        ..Default::default()
    };
    println!("Client ID: {}", client_id);
    println!("Relay: {}", relay.base_url());

    let mut session = Session::new(config, Arc::new(WebRtcTransport::new()), Arc::new(relay));

    let on_message = |payload: Value| print_payload(&payload);
    let ready = match side {
        Side::Host => session.host(client_id.as_str(), on_message)?,
        Side::Join => session.join(client_id.as_str(), on_message)?,
    };

    println!("Negotiating...");
    match tokio::time::timeout(Duration::from_secs(args.timeout), ready.wait()).await {
        Ok(Ok(())) => println!("✅ Connected"),
        Ok(Err(e)) => bail!("Connection failed: {}", e),
        Err(_) => bail!("Timed out after {}s waiting for the peer", args.timeout),
    }

    if let Some(message) = args.message {
        session.send(&json!({ "text": message })).await?;
        println!("💬 You: {}", message);
        // Give the frame a moment to leave before tearing down
        tokio::time::sleep(Duration::from_millis(500)).await;
        session.disconnect().await?;
        return Ok(());
    }

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    let mut state_check = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = state_check.tick() => {
                if !session.is_open() {
                    println!("Peer closed the connection");
                    return Ok(());
                }
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match session.send(&json!({ "text": line })).await {
                            Ok(()) => println!("💬 You: {}", line),
                            Err(e) => warn!("Failed to send: {}", e),
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    if session.is_open() {
        session.disconnect().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Host(args) => run_link(Side::Host, args).await?,
        Commands::Join(args) => run_link(Side::Join, args).await?,
    }

    Ok(())
}
