//! The `nodeio` binary: a broker server or a node of the shared world.

mod input;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use nodeio_config::{CliArgs, Config, default_config_dir};
use nodeio_net::{BrokerServer, FrameConfig, RemoteBroker, ServerConfig};
use nodeio_node::{NodeError, Session, SessionConfig, SessionEvent};
use nodeio_world::WorldEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::input::{Input, parse_line};

/// Errors that end the process with a failure status.
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("invalid broker address {0}")]
    Address(String),

    #[error("broker connection failed: {0}")]
    Connect(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Node(#[from] NodeError),
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(2);
    }

    let log_dir = config_dir.join("logs");
    nodeio_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let result = if args.serve {
        serve(&config).await
    } else {
        run_node(&config).await
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Run the broker server until Ctrl-C.
async fn serve(config: &Config) -> Result<(), AppError> {
    let endpoint = config.broker_endpoint();
    let bind_addr: SocketAddr = endpoint
        .parse()
        .map_err(|_| AppError::Address(endpoint.clone()))?;
    let server = BrokerServer::new(ServerConfig {
        bind_addr,
        max_connections: config.network.max_connections,
        frame: FrameConfig::default(),
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            server.shutdown();
        }
    }
    Ok(())
}

/// Join the session and play from stdin until `quit` or end of input.
async fn run_node(config: &Config) -> Result<(), AppError> {
    let endpoint = config.broker_endpoint();
    let broker = RemoteBroker::connect(endpoint.as_str())
        .await
        .map_err(AppError::Connect)?;
    info!("Connected to broker at {endpoint}");

    let (handle, mut events) = Session::start(broker, SessionConfig::from_config(config)).await?;
    info!("Joined as {} ({})", handle.player_id(), handle.role());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(Input::Move(direction))) => handle.move_player(direction)?,
                    Ok(Some(Input::Say(message))) => handle.speak(message)?,
                    Err(e) => warn!("{e}"),
                }
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => {
                    warn!("Session ended");
                    return Ok(());
                }
            },
        }
    }

    handle.leave().await?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::WorldReady(world) => info!(
            "World ready: {} zones, {} players",
            world.zones.len(),
            world.players.len()
        ),
        SessionEvent::WorldChanged(change) => match change {
            WorldEvent::ZoneAdded { zone, kind } => info!("Zone {zone} added ({kind:?})"),
            WorldEvent::ZoneOwnerChanged { zone, owner } => match owner {
                Some(owner) => info!("Zone {zone} now owned by {owner}"),
                None => info!("Zone {zone} is unowned"),
            },
            WorldEvent::PlayerAdded { player, cell } => info!("{player} joined at {cell}"),
            WorldEvent::PlayerRemoved { player } => info!("{player} left"),
            WorldEvent::PlayerMoved { player, to, .. } => info!("{player} moved to {to}"),
            WorldEvent::PlayerSpoke { player, message } => info!("{player}: {message}"),
        },
    }
}
