//! Transport layer for spoke.
//!
//! Turns a byte stream into an ordered, framed [`Connection`] between two
//! nodes:
//!
//! - [`FramedConnection`]: length-delimited frames over any
//!   `AsyncRead + AsyncWrite`, used directly by the login handshake.
//! - [`Connection`]: identity exchange, then one reader task and one
//!   writer task with an unbounded FIFO outbound queue, `flush` and
//!   idempotent `shutdown`.
//! - [`TcpTransport`]: the listening socket.
//!
//! # Feature Flags
//!
//! - `tcp` (default): [`TcpTransport`] and [`connect`].

mod connection;
mod error;
mod framing;
#[cfg(feature = "tcp")]
mod tcp;

pub use connection::{Connection, ConnectionListener};
pub use error::TransportError;
pub use framing::{FrameReader, FrameWriter, FramedConnection, MAX_FRAME_LENGTH};
#[cfg(feature = "tcp")]
pub use tcp::{TcpTransport, connect};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a socket, used in logs before (and after) the
/// peer's node is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_next_ids_are_distinct() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "alice");
        map.insert(ConnectionId::new(2), "bob");
        assert_eq!(map[&ConnectionId::new(1)], "alice");
    }
}
