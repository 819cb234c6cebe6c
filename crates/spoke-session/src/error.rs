//! Error types for the session layer.

use spoke_transport::TransportError;

/// Errors that can occur while logging a peer in.
///
/// `LoginRejected` is the one callers usually care about: the server
/// looked at the request and said no. Everything else means the
/// handshake itself broke down.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server refused the login. The reason is meant for humans.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// The client's credential provider declined to answer the challenge.
    #[error("login cancelled by credential provider")]
    LoginCancelled,

    /// A login frame arrived out of turn.
    #[error("unexpected login frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    /// The peer hung up mid-handshake.
    #[error("peer disconnected during login")]
    Disconnected,

    /// The peer took longer than the handshake timeout.
    #[error("login timed out")]
    Timeout,

    /// Framing, I/O or codec failure underneath the handshake.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
