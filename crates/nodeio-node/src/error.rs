//! Node-level error type.

use nodeio_net::BrokerError;
use nodeio_world::{CodecError, WorldError};

/// Errors surfaced by election, replication, and the session handle.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A broker operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// An action could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A commit could not be applied.
    #[error("world error: {0}")]
    World(#[from] WorldError),

    /// The session actor has stopped.
    #[error("session has stopped")]
    SessionClosed,

    /// A bounded wait ran out.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
