//! Error types for the protocol layer.
//!
//! Each crate in spoke defines its own error enum. A `ProtocolError`
//! always means the problem is in turning values into bytes or back,
//! never in networking or routing.

/// The boxed source error produced by whichever codec was in use.
///
/// Codecs are pluggable, so the protocol layer cannot name a concrete
/// serde backend error type here. Boxing keeps `ProtocolError` the same
/// shape no matter which codec produced it.
pub type CodecFailure = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust value into bytes).
    #[error("encode failed: {0}")]
    Encode(#[source] CodecFailure),

    /// Deserialization failed (turning bytes into a Rust value).
    ///
    /// Common causes: truncated frames, a peer using a different codec,
    /// or a payload decoded as the wrong contract.
    #[error("decode failed: {0}")]
    Decode(#[source] CodecFailure),

    /// The message decoded fine but violates the protocol, e.g. a login
    /// frame arriving out of turn.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
