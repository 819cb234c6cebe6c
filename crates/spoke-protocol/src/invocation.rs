//! Wire records for channel and remote invocations.
//!
//! A channel (one-to-many) and a remote (one-to-one) are both "endpoints":
//! named registry entries every process knows about. These records keep
//! the registries in sync across processes and carry the calls and their
//! results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CallId, Node};

/// Invocation-layer traffic, carried in [`crate::Payload::Invocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationMessage {
    /// A client asks the server for the current registry state.
    InitRequest,
    /// The server's answer to `InitRequest`.
    Init {
        /// Every endpoint the server knows about.
        endpoints: Vec<EndpointDef>,
        /// Which node implements which endpoints.
        implementors: Vec<(Node, Vec<String>)>,
    },
    /// An endpoint was created somewhere.
    EndpointCreated(EndpointDef),
    /// An endpoint was destroyed somewhere.
    EndpointDestroyed { name: String },
    /// The sender now has at least one local implementor for `name`.
    HasImplementor { name: String },
    /// The sender's last local implementor for `name` went away.
    NoLongerHasImplementor { name: String },
    /// A call on an endpoint.
    Invoke(Invoke),
    /// The outcome of an `Invoke` that asked for a reply.
    Results {
        call_id: CallId,
        outcome: InvocationOutcome,
    },
}

/// One call on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoke {
    /// Endpoint (channel or remote) name.
    pub endpoint: String,
    /// Method name, for logging and diagnostics.
    pub method: String,
    /// Set when the caller waits for a reply.
    pub call_id: Option<CallId>,
    /// Whether the callee should send back a `Results` record.
    pub need_reply: bool,
    /// The encoded call enum: method and arguments in one tagged value.
    pub call: Vec<u8>,
}

/// Whether an endpoint fans out or answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Multicast: every subscriber in every process receives each call.
    Channel,
    /// Unicast: exactly one implementor receives each call and may reply.
    Remote,
}

/// A registry entry as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDef {
    /// Endpoint name, unique across the fabric.
    pub name: String,
    /// Name of the contract the endpoint speaks.
    pub contract: String,
    /// Channel or remote.
    pub kind: EndpointKind,
}

/// What came back from a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationOutcome {
    /// The implementor ran and returned this encoded reply.
    Returned(Vec<u8>),
    /// The implementor ran and failed.
    Failed(RemoteFailure),
    /// The receiving process had no implementor for the endpoint.
    NotFound,
}

/// An error raised by the callee, shipped back to the caller as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BincodeCodec, Codec};

    #[test]
    fn test_invoke_survives_bincode() {
        let invoke = Invoke {
            endpoint: "chat".into(),
            method: "say".into(),
            call_id: Some(CallId::next()),
            need_reply: true,
            call: vec![1, 2, 3],
        };
        let msg = InvocationMessage::Invoke(invoke.clone());
        let bytes = BincodeCodec.encode(&msg).unwrap();
        let back: InvocationMessage = BincodeCodec.decode(&bytes).unwrap();
        assert_eq!(back, InvocationMessage::Invoke(invoke));
    }

    #[test]
    fn test_remote_failure_displays_message() {
        let failure = RemoteFailure::new("no such unit");
        assert_eq!(failure.to_string(), "no such unit");
    }
}
