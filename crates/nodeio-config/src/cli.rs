//! Command-line argument parsing for the `nodeio` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// nodeio command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nodeio", about = "Serverless shared grid world over a message broker")]
pub struct CliArgs {
    /// Broker server address.
    #[arg(long)]
    pub broker: Option<String>,

    /// Broker server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Name of the well-known host queue.
    #[arg(long)]
    pub host_queue: Option<String>,

    /// Rows and columns per zone (only used if this node becomes host).
    #[arg(long)]
    pub zone_size: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run the broker server instead of a node.
    #[arg(long)]
    pub serve: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.broker {
            self.network.broker_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.broker_port = port;
        }
        if let Some(ref queue) = args.host_queue {
            self.network.host_queue = queue.clone();
        }
        if let Some(size) = args.zone_size {
            self.world.zone_size = size;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            broker: Some("192.168.1.1".to_string()),
            zone_size: Some(16),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.broker_address, "192.168.1.1");
        assert_eq!(config.world.zone_size, 16);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.broker_port, 5673);
        assert_eq!(config.world.zone_line, 4);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::try_parse_from([
            "nodeio",
            "--serve",
            "--port",
            "7000",
            "--host-queue",
            "arena/host",
        ])
        .unwrap();
        assert!(args.serve);
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.host_queue.as_deref(), Some("arena/host"));
    }
}
