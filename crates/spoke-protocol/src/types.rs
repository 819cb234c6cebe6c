//! Core wire types.
//!
//! After the login handshake and the identity exchange, the only thing
//! that travels over a connection is an [`Envelope`]. The envelope says
//! who sent it, who it is for, and carries a [`Payload`].

use serde::{Deserialize, Serialize};

use crate::{InvocationMessage, Node};

// ---------------------------------------------------------------------------
// Envelope: the unit on the wire
// ---------------------------------------------------------------------------

/// One routed message.
///
/// `to == None` is a broadcast: every node except the sender receives it.
/// Otherwise the server forwards the envelope to the connection that owns
/// `to`, or delivers it locally when `to` is the server itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination node, or `None` for a broadcast.
    pub to: Option<Node>,
    /// The node that created the envelope. The server drops connections
    /// whose envelopes claim someone else's identity.
    pub from: Node,
    /// What the message carries.
    pub payload: Payload,
}

impl Envelope {
    /// Builds a broadcast envelope.
    pub fn broadcast(from: Node, payload: Payload) -> Self {
        Self {
            to: None,
            from,
            payload,
        }
    }

    /// Builds an envelope addressed to one node.
    pub fn to(to: Node, from: Node, payload: Payload) -> Self {
        Self {
            to: Some(to),
            from,
            payload,
        }
    }

    /// True if this envelope is for everyone.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What an envelope carries.
///
/// Serde's default "externally tagged" representation is used on purpose:
/// it works for both self-describing (JSON) and non-self-describing
/// (bincode) codecs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Messenger bookkeeping. Consumed by the messengers, never handed to
    /// application message listeners on the client.
    System(SystemMessage),
    /// Channel and remote invocation traffic.
    Invocation(InvocationMessage),
    /// An opaque application value, already encoded with the codec.
    Application(Vec<u8>),
}

/// Node-membership updates pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMessage {
    /// Every node currently connected, server included. Always the first
    /// envelope a freshly promoted client receives.
    NodeSnapshot { nodes: Vec<Node> },
    /// A node finished logging in.
    NodeAdded { node: Node },
    /// A node disconnected or was removed.
    NodeRemoved { node: Node },
}
