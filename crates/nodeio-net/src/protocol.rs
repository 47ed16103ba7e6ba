//! Broker wire protocol.
//!
//! Every frame payload is a protocol version byte followed by a
//! [`postcard`]-encoded [`Frame`]. Clients send [`Frame::Request`]s tagged
//! with an id; the server answers each with a [`Frame::Reply`] carrying the
//! same id and pushes queue traffic as [`Frame::Deliver`].

use serde::{Deserialize, Serialize};

use crate::broker::{Body, BrokerError, QueueOptions};

/// Current wire-protocol version. Prepended to every encoded frame.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One broker operation, mirroring the [`Broker`](crate::Broker) trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Create a server-named private queue.
    DeclareAnonymous,
    /// Check that a queue exists.
    DeclarePassive {
        /// Queue name.
        queue: String,
    },
    /// Create a queue, failing if it exists.
    Declare {
        /// Queue name.
        queue: String,
        /// Declaration flags.
        options: QueueOptions,
    },
    /// Bind a queue to a fan-out exchange.
    Bind {
        /// Queue name.
        queue: String,
        /// Exchange name.
        exchange: String,
    },
    /// Start consuming a queue on this connection.
    Consume {
        /// Queue name.
        queue: String,
    },
    /// Publish a message.
    Publish {
        /// Exchange name, empty for direct-to-queue.
        exchange: String,
        /// Target queue for direct publish.
        routing_key: String,
        /// Opaque message body.
        body: Body,
    },
    /// Delete a queue.
    Delete {
        /// Queue name.
        queue: String,
    },
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The operation completed.
    Done,
    /// The operation completed and produced a queue name.
    Queue(String),
}

/// Top-level unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → server operation.
    Request {
        /// Correlation id chosen by the client.
        id: u64,
        /// The operation.
        request: Request,
    },
    /// Server → client answer to the request with the same id.
    Reply {
        /// Correlation id of the request.
        id: u64,
        /// Outcome.
        result: Result<Reply, BrokerError>,
    },
    /// Server → client message from a consumed queue.
    Deliver {
        /// Queue the message was taken from.
        queue: String,
        /// Opaque message body.
        body: Body,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding a frame payload.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a [`Frame`] as `[version] [postcard Frame]`.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = postcard::to_allocvec(frame)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a payload produced by [`encode_frame`].
pub fn decode_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    let (&version, body) = data.split_first().ok_or(ProtocolError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = Frame::Request {
            id: 9,
            request: Request::Publish {
                exchange: String::new(),
                routing_key: "nodeio/host".to_string(),
                body: vec![0xDE, 0xAD],
            },
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_error_reply_survives_encoding() {
        let frame = Frame::Reply {
            id: 3,
            result: Err(BrokerError::QueueNotFound("nodeio/host".to_string())),
        };
        let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = encode_frame(&Frame::Reply {
            id: 1,
            result: Ok(Reply::Done),
        })
        .unwrap();
        bytes[0] = 200;
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::UnsupportedVersion(200))
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode_frame(&[]), Err(ProtocolError::EmptyPayload)));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        assert!(decode_frame(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
