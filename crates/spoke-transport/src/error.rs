use spoke_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// A frame arrived but could not be decoded, or a value could not be
    /// encoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),

    /// The peer broke the identity exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer took too long to answer during connection setup.
    #[error("timed out waiting for peer")]
    Timeout,

    /// The connection was shut down locally.
    #[error("transport shut down")]
    Shutdown,
}
