//! TCP acceptor.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::{ConnectionId, TransportError};

/// Listens for incoming TCP sockets.
///
/// Accepted sockets are raw byte streams: the caller runs the login
/// handshake and the identity exchange before anything is routed.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a listener. Port 0 lets the OS pick a free port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        if let Ok(local) = listener.local_addr() {
            tracing::info!(%local, "tcp transport listening");
        }
        Ok(Self { listener })
    }

    /// Waits for the next socket.
    ///
    /// The returned [`ConnectionId`] labels the socket in logs until the
    /// peer's node identity is known.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionId), TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "could not disable nagle");
        }

        let id = ConnectionId::next();
        tracing::debug!(%id, %addr, "accepted tcp connection");
        Ok((stream, addr, id))
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}

/// Opens an outbound socket with Nagle's algorithm disabled.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionClosed(format!("connect failed: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "could not disable nagle");
    }
    Ok(stream)
}
