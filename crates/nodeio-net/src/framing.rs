//! Length-prefixed framing for broker TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. Both directions enforce
//! [`FrameConfig::max_payload_size`] so a corrupt prefix cannot make the
//! reader allocate an arbitrary buffer.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Configuration for the framing layer.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1 << 20,
        }
    }
}

impl FrameConfig {
    fn check(&self, size: u32) -> Result<(), FrameError> {
        if size > self.max_payload_size {
            Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream before a complete frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}

/// Read one frame and return its payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(prefix);
    config.check(len)?;

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: u32::MAX,
        max: config.max_payload_size,
    })?;
    config.check(len)?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_unmerged() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        for body in [&b"declare"[..], b"bind", b"publish"] {
            write_frame(&mut client, body, &config).await.unwrap();
        }
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"declare");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"bind");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"publish");
    }

    #[tokio::test]
    async fn test_partial_reads_reassemble() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let payload = vec![7u8; 300];

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload, &config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };
        client.write_all(&1024u32.to_le_bytes()).await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge {
                size: 1024,
                max: 16
            })
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };
        let result = write_frame(&mut client, &[0u8; 64], &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_empty_frame_is_valid() {
        let (mut client, mut server) = duplex(64);
        let config = FrameConfig::default();
        write_frame(&mut client, &[], &config).await.unwrap();
        assert!(read_frame(&mut server, &config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_stream_reported() {
        let (client, mut server) = duplex(64);
        drop(client);
        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_payload_reported_as_closed() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
