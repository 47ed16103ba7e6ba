//! Broker transport: queue/exchange primitives, an in-process broker, and a
//! TCP broker server and client speaking a framed postcard protocol.

pub mod broker;
pub mod framing;
pub mod memory;
pub mod protocol;
pub mod tcp_client;
pub mod tcp_server;

pub use broker::{
    Body, Broker, BrokerError, ConnectionId, Consumer, DIRECT_EXCHANGE, IdGenerator, QueueOptions,
};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use memory::{MemoryBroker, MemoryConnection};
pub use protocol::{Frame, ProtocolError, Reply, Request};
pub use tcp_client::{ConnectionState, ConnectionStateWatch, RemoteBroker};
pub use tcp_server::{BrokerServer, ConnectionLimitReached, ConnectionMap, ServerConfig};
