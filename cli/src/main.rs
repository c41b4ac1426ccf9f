// multipro CLI: run a Ping/Echo node, host a relay, inspect identities

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use multipro_core::transport::NetworkEvent;
use multipro_core::{
    bootstrap_connect, load_identity, start_swarm, Driver, ExchangeEvent, ExchangeOutcome,
    IdentityKeys, NodeConfig, PeerNode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser)]
#[command(name = "multipro")]
#[command(about = "Authenticated Ping/Echo between peers, with relay fallback", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and probe the configured peers until Ctrl-C
    Run(RunArgs),
    /// Host a circuit relay for other peers
    Relay {
        #[arg(short, long, default_value = "8000")]
        port: u16,
        /// Derive the relay identity from a seed byte
        #[arg(long)]
        seed: Option<u8>,
    },
    /// Print the peer id derived from a seed
    Id {
        #[arg(long)]
        seed: u8,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Derive the identity from a seed byte
    #[arg(long)]
    seed: Option<u8>,
    /// Listen address (repeatable)
    #[arg(long)]
    listen: Vec<String>,
    /// Peer id to probe (repeatable)
    #[arg(long)]
    peer: Vec<String>,
    /// Bootstrap multiaddr with /p2p/<id> (repeatable)
    #[arg(long)]
    bootstrap: Vec<String>,
    /// Relay multiaddr with /p2p/<id>
    #[arg(long)]
    relay: Option<String>,
    /// Seconds between attempts
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config_path = config::resolve_path(cli.config)?;

    match cli.command {
        Commands::Run(args) => cmd_run(&config_path, args).await,
        Commands::Relay { port, seed } => cmd_relay(&config_path, port, seed).await,
        Commands::Id { seed } => cmd_id(seed),
        Commands::Config { action } => cmd_config(&config_path, action),
    }
}

fn print_listen_events(mut event_rx: mpsc::Receiver<NetworkEvent>, local: libp2p::PeerId) {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NetworkEvent::ListeningOn(addr) => {
                    println!("{} Listening on {}/p2p/{}", "✓".green(), addr, local);
                }
                NetworkEvent::ReservationAccepted {
                    relay_peer_id,
                    renewal: false,
                } => {
                    println!("{} Reservation held on relay {}", "✓".green(), relay_peer_id);
                }
                NetworkEvent::PeerConnected { peer_id, relayed } => {
                    tracing::debug!(peer = %peer_id, relayed, "Peer connected");
                }
                _ => {}
            }
        }
    });
}

fn print_exchange_events(mut events: broadcast::Receiver<ExchangeEvent>) {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Exchange events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let peer = event.peer.to_string();
            match event.outcome {
                ExchangeOutcome::RequestReceived => {
                    println!("{} {} request from {}", "←".bright_blue(), event.protocol, peer.bright_cyan());
                }
                ExchangeOutcome::Matched { payload } => {
                    println!(
                        "{} {} response from {}: {}",
                        "✓".green(),
                        event.protocol,
                        peer.bright_cyan(),
                        payload
                    );
                }
                ExchangeOutcome::TimedOut => {
                    println!("{} {} to {} timed out", "✗".red(), event.protocol, peer.bright_cyan());
                }
                ExchangeOutcome::Dropped { .. } | ExchangeOutcome::Unmatched => {}
            }
        }
    });
}

async fn cmd_run(config_path: &std::path::Path, args: RunArgs) -> Result<()> {
    let mut node_config = config::load_or_default(config_path)?;
    config::Overrides {
        seed: args.seed,
        listen: args.listen,
        peers: args.peer,
        bootstrap: args.bootstrap,
        relay: args.relay,
        interval: args.interval,
    }
    .apply(&mut node_config);

    let keys = load_identity(&node_config.identity).context("Failed to load identity")?;
    let local = keys.peer_id();

    println!("{}", "multipro: starting...".bold());
    println!("Peer ID: {}", local.to_string().bright_cyan());
    println!();

    let (event_tx, event_rx) = mpsc::channel(256);
    let handle = start_swarm(&keys, node_config.swarm_options()?, event_tx)
        .await
        .context("Failed to start network")?;
    print_listen_events(event_rx, local);

    let transport = Arc::new(handle.clone());
    let node = Arc::new(PeerNode::from_config(keys, transport.clone(), &node_config)?);
    node.start().context("Failed to register protocol handlers")?;
    print_exchange_events(node.subscribe());

    let bootstrap = node_config.bootstrap_addrs()?;
    if !bootstrap.is_empty() {
        match bootstrap_connect(transport.as_ref(), &bootstrap).await {
            Ok(n) => println!("{} Bootstrapped with {} peer(s)", "✓".green(), n),
            Err(e) => println!("{} {}", "✗".red(), e),
        }
    }

    if let Some(result) = node.reserve_relay().await {
        if let Err(e) = result {
            println!("{} {}", "✗".red(), e);
        }
    }

    let peers = node_config.peer_ids()?;
    if peers.is_empty() {
        println!("{}", "No peers configured; serving requests only.".dimmed());
    }
    let driver = Driver::new(node.clone(), peers, node_config.round_interval());

    tokio::select! {
        _ = driver.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Shutting down...");
        }
    }

    node.shutdown();
    let _ = handle.shutdown().await;
    Ok(())
}

async fn cmd_relay(config_path: &std::path::Path, port: u16, seed: Option<u8>) -> Result<()> {
    let mut node_config = config::load_or_default(config_path)?;
    if let Some(seed) = seed {
        node_config.identity.seed = Some(seed);
        node_config.identity.secret_key_hex = None;
    }
    node_config.relay_server = true;
    node_config.listen_addrs = vec![format!("/ip4/0.0.0.0/tcp/{}", port)];

    let keys = load_identity(&node_config.identity).context("Failed to load identity")?;
    let local = keys.peer_id();

    println!("{}", "multipro relay: starting...".bold());
    println!("Peer ID: {}", local.to_string().bright_cyan());

    let (event_tx, event_rx) = mpsc::channel(256);
    let handle = start_swarm(&keys, node_config.swarm_options()?, event_tx)
        .await
        .context("Failed to start relay")?;
    print_listen_events(event_rx, local);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    println!();
    println!("Shutting down...");
    let _ = handle.shutdown().await;
    Ok(())
}

fn cmd_id(seed: u8) -> Result<()> {
    let keys = IdentityKeys::from_seed(seed)?;
    println!("{}", keys.peer_id());
    Ok(())
}

fn cmd_config(config_path: &std::path::Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            NodeConfig::default().save(config_path)?;
            println!("{} Wrote {}", "✓".green(), config_path.display());
        }
        ConfigAction::Show => {
            let node_config = config::load_or_default(config_path)?;
            println!("{}", format!("# {}", config_path.display()).dimmed());
            println!("{}", serde_json::to_string_pretty(&node_config)?);
        }
    }
    Ok(())
}
