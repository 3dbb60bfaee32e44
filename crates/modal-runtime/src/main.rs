//! Modal CLI - run a mesh node or the hub over UDP

use std::net::SocketAddrV4;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use modal_core::{ModalError, ModalResult, NodeId, Personality};
use modal_runtime::{
    init_tracing, spawn_node, HubCommand, HubController, NodeOptions, RuntimeConfig,
    SessionState, SilentRenderer,
};
use modal_topology::preset;
use modal_transport::UdpLink;

#[derive(Parser)]
#[command(name = "modal")]
#[command(about = "Distributed modal resonator mesh", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Runtime settings (JSON); MODAL_* variables apply on top
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a resonator node
    Node {
        /// Local UDP address
        #[arg(short, long, default_value = "0.0.0.0:4800")]
        bind: SocketAddrV4,

        /// Subnet broadcast address
        #[arg(long, default_value = "255.255.255.255:4800")]
        broadcast: SocketAddrV4,

        /// Fixed node id (assigned by the hub if omitted)
        #[arg(short, long)]
        id: Option<u8>,

        /// resonator or self-oscillator
        #[arg(short, long, default_value = "resonator")]
        personality: Personality,

        /// Name announced to the hub
        #[arg(short, long, default_value = "modal-node")]
        name: String,
    },

    /// Run the hub: discover, configure, then read note commands from stdin
    Hub {
        #[arg(short, long, default_value = "0.0.0.0:4800")]
        bind: SocketAddrV4,

        #[arg(long, default_value = "255.255.255.255:4800")]
        broadcast: SocketAddrV4,

        /// ring, small-world, clusters or hub-spoke (default: ring over discovered nodes)
        #[arg(long)]
        preset: Option<String>,

        /// Start the session as soon as it is configured
        #[arg(long)]
        autostart: bool,
    },
}

fn load_config(cli: &Cli) -> ModalResult<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ModalError::InvalidConfig(format!("{}: {e}", path.display())))?;
            RuntimeConfig::from_json(&text)?
        }
        None => RuntimeConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    if cli.log_json {
        config.log.json = true;
    }
    config.validate()?;
    Ok(config)
}

/// Parse one stdin line: `on N V`, `hold N V`, `off N`, `start`, `stop`,
/// `reset`, `query ID`
fn parse_command(line: &str) -> Option<HubCommand> {
    let mut words = line.split_whitespace();
    let command = match (words.next()?, words.next(), words.next()) {
        ("on", Some(n), v) => HubCommand::NoteOn {
            note: n.parse().ok()?,
            velocity: v.map_or(Some(100), |v| v.parse().ok())?,
        },
        ("hold", Some(n), v) => HubCommand::NoteHold {
            note: n.parse().ok()?,
            velocity: v.map_or(Some(100), |v| v.parse().ok())?,
        },
        ("off", Some(n), None) => HubCommand::NoteOff {
            note: n.parse().ok()?,
        },
        ("start", None, None) => HubCommand::Start,
        ("stop", None, None) => HubCommand::Stop,
        ("reset", None, None) => HubCommand::Reset,
        ("query", Some(id), None) => HubCommand::Query(NodeId(id.parse().ok()?)),
        _ => return None,
    };
    Some(command)
}

async fn run_node(
    config: RuntimeConfig,
    bind: SocketAddrV4,
    broadcast: SocketAddrV4,
    options: NodeOptions,
) -> ModalResult<()> {
    let link = UdpLink::bind(bind, broadcast).await?;
    info!(addr = %link.socket_addr(), id = %options.id, "node starting");

    let mut node = spawn_node(link, options, &config, SilentRenderer)?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        result = node.wait_for(SessionState::Error) => result?,
    }

    let (stats, modal) = node.shutdown().await?;
    info!(?stats, steps = modal.step_count(), "node stopped");
    Ok(())
}

async fn run_hub(
    config: RuntimeConfig,
    bind: SocketAddrV4,
    broadcast: SocketAddrV4,
    preset_name: Option<String>,
    autostart: bool,
) -> ModalResult<()> {
    let link = UdpLink::bind(bind, broadcast).await?;
    let mut hub = HubController::new(link, &config);

    let discovered = hub.discover().await?;
    let custom = match preset_name {
        Some(name) => Some(preset(&name, discovered)?),
        None => None,
    };
    hub.finish_discovery(custom)?;
    let configured = hub.distribute().await?;
    info!(discovered, configured, "session ready");

    if autostart {
        hub.start_session().await?;
    }

    let (tx, rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(line = %line, "unrecognized command"),
            }
        }
    });
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let stats = hub.run(rx, shutdown_rx).await?;
    info!(?stats, "hub stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log)?;

    match cli.command {
        Commands::Node {
            bind,
            broadcast,
            id,
            personality,
            name,
        } => {
            let options = NodeOptions {
                id: id.map_or(NodeId::UNASSIGNED, NodeId),
                personality,
                name,
                seed: None,
            };
            run_node(config, bind, broadcast, options).await?;
        }
        Commands::Hub {
            bind,
            broadcast,
            preset,
            autostart,
        } => run_hub(config, bind, broadcast, preset, autostart).await?,
    }
    Ok(())
}
