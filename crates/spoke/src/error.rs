//! Unified error type for spoke.

use spoke_protocol::ProtocolError;
use spoke_session::SessionError;
use spoke_transport::TransportError;

use crate::invoke::InvokeError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `spoke` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant auto-generates `From` impls, so the `?`
/// operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum SpokeError {
    /// A transport-level error (connect, send, receive, identity exchange).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A login handshake that broke down (not a rejection, see
    /// [`SpokeError::CouldNotLogIn`]).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An invocation-layer error.
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// The server refused the login.
    #[error("could not log in: {0}")]
    CouldNotLogIn(String),

    /// `remove_connection` was asked to remove the server itself.
    #[error("the server cannot remove its own node")]
    CannotRemoveSelf,

    /// Socket setup failed outside the transport layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SpokeError {
    /// Maps a client-side login failure, keeping rejections distinct.
    pub(crate) fn from_login(error: SessionError) -> Self {
        match error {
            SessionError::LoginRejected(reason) => SpokeError::CouldNotLogIn(reason),
            other => SpokeError::Session(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let spoke_err: SpokeError = err.into();
        assert!(matches!(spoke_err, SpokeError::Transport(_)));
        assert!(spoke_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let spoke_err: SpokeError = err.into();
        assert!(matches!(spoke_err, SpokeError::Protocol(_)));
    }

    #[test]
    fn test_login_rejection_is_distinct_from_session_failure() {
        let rejected = SpokeError::from_login(SessionError::LoginRejected("full".into()));
        assert!(matches!(rejected, SpokeError::CouldNotLogIn(ref r) if r == "full"));

        let broken = SpokeError::from_login(SessionError::Timeout);
        assert!(matches!(broken, SpokeError::Session(SessionError::Timeout)));
    }

    #[test]
    fn test_from_invoke_error() {
        let err = InvokeError::Timeout;
        let spoke_err: SpokeError = err.into();
        assert!(matches!(spoke_err, SpokeError::Invoke(_)));
    }
}
