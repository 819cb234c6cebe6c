//! Codec trait and implementations for serializing/deserializing values.
//!
//! A "codec" (coder/decoder) converts between Rust types and raw bytes.
//! The transport doesn't care HOW envelopes are serialized: it only needs
//! something that implements [`Codec`]. Both ends of a connection must be
//! built with the same codec.
//!
//! Two codecs ship with the crate:
//!
//! - [`BincodeCodec`]: compact binary, the default on the wire.
//! - [`JsonCodec`]: human-readable, handy when debugging a capture.
//!   Behind the `json` feature (enabled by default).
//!
//! A deployment can plug in its own codec, for instance one that rewrites
//! object references against a different in-memory game snapshot while
//! decoding.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// ## Trait bounds explained
///
/// - `Send + Sync` → one codec is shared by a connection's reader and
///   writer tasks, which Tokio may run on different threads.
/// - `Clone` → every connection gets its own copy, so a codec that keeps
///   per-stream state never sees two streams interleaved.
/// - `'static` → the codec is stored in long-lived tasks.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value can't be represented
    /// in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;

    /// Drops any per-stream cache of previously written values.
    ///
    /// The connection writer calls this every time its outbound queue
    /// runs empty. Stateless codecs (both shipped here) ignore it.
    fn reset(&self) {}
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses `bincode` 1.x.
///
/// Bincode is not self-describing: it relies on both sides agreeing on the
/// exact Rust types. That's the case here, since every peer links the same
/// protocol crate. The upside is small frames and fast decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(value).map_err(|e| ProtocolError::Encode(e))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e))
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use spoke_protocol::{Codec, Envelope, JsonCodec, Node, Payload};
///
/// let codec = JsonCodec;
/// let from = Node::new("host", "127.0.0.1:3300".parse().unwrap());
///
/// let envelope = Envelope::broadcast(from, Payload::Application(vec![1, 2, 3]));
/// let bytes = codec.encode(&envelope).unwrap();
/// let decoded: Envelope = codec.decode(&bytes).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(Box::new(e)))
    }
}
