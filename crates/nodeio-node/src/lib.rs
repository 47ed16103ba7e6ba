//! A node of the shared world: host election, the propose/broadcast message
//! flows, and the single-writer session actor that keeps the local replica
//! in step with the host.

pub mod election;
pub mod error;
pub mod replicator;
pub mod session;

pub use election::{Election, Role, elect};
pub use error::NodeError;
pub use replicator::{Replicator, Topology};
pub use session::{Session, SessionConfig, SessionEvent, SessionHandle};
