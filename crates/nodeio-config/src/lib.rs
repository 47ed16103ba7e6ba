//! Configuration system for nodeio nodes and the broker server.
//!
//! Settings persist to disk as a RON file, accept CLI overrides via clap,
//! and deserialize with per-section defaults so older files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, WorldConfig, default_config_dir};
pub use error::ConfigError;
