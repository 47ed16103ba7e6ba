//! Message body encoding for actions and commits.
//!
//! Bodies are a version byte followed by the [`postcard`] encoding of the
//! value, so nodes running a different world format fail loudly instead of
//! misreading each other.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current body format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The body was empty.
    #[error("empty message body")]
    Empty,

    /// The version byte does not match [`WIRE_VERSION`].
    #[error("unsupported body version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode `value` as `[version] [postcard value]`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(WIRE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a body produced by [`encode`].
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let (&version, body) = data.split_first().ok_or(CodecError::Empty)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
