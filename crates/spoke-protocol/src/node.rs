//! Node identity: who is on the other end of a connection.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// An addressable process endpoint: a display name plus the socket it
/// talks from.
///
/// Equality and hashing only look at `(address, port)`. Two nodes with
/// the same name on different sockets are different nodes; the server
/// guarantees names are unique anyway by renaming newcomers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    name: String,
    address: IpAddr,
    port: u16,
}

impl Node {
    /// Creates a node named `name` living at `addr`.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address: addr.ip(),
            port: addr.port(),
        }
    }

    /// The node's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's IP address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The node's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `address:port` as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Returns the same endpoint under a different display name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        ([10, 0, 0, 7], port).into()
    }

    #[test]
    fn test_same_socket_different_name_is_equal() {
        let a = Node::new("alice", addr(4000));
        let b = Node::new("bob", addr(4000));
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_name_different_port_is_distinct() {
        let a = Node::new("alice", addr(4000));
        let b = Node::new("alice", addr(4001));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_ignores_name() {
        let mut set = HashSet::new();
        set.insert(Node::new("alice", addr(4000)));
        set.insert(Node::new("renamed", addr(4000)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_display_and_accessors() {
        let node = Node::new("host", addr(3300));
        assert_eq!(node.to_string(), "host@10.0.0.7:3300");
        assert_eq!(node.port(), 3300);
        assert_eq!(node.socket_addr(), addr(3300));
        assert_eq!(node.with_name("other").name(), "other");
    }
}
