//! Channels and remotes: method calls that cross the fabric.
//!
//! Both are "endpoints", named entries in a registry every process keeps
//! in sync through [`UnifiedMessenger`]:
//!
//! - A **channel** ([`ChannelMessenger`]) fans each call out to every
//!   subscriber in every process. Nothing comes back.
//! - A **remote** ([`RemoteMessenger`]) has exactly one implementor
//!   somewhere on the fabric. Calls are routed to it and may return a
//!   value.
//!
//! A contract is a trait impl plus a call enum: one enum variant per
//! method, serialized as a single tagged value. The caller and callee
//! share the enum, so there is no reflection and no per-method stub.
//!
//! ```text
//!  Broadcaster::call ─┐                      ┌─► subscriber (local)
//!                     ├─► endpoint actor ────┤
//!  Invoke (network) ──┘                      └─► subscriber (local)
//! ```
//!
//! Each endpoint runs its local calls on its own task, one at a time, in
//! arrival order.

mod channel;
mod contract;
mod endpoint;
mod remote;
mod unified;

use std::time::Duration;

use spoke_protocol::{ProtocolError, RemoteFailure};

pub use channel::{Broadcaster, ChannelMessenger};
pub use contract::{ChannelContract, ChannelSubscriber, RemoteContract, RemoteImplementor};
pub use remote::{RemoteMessenger, RemoteProxy};
pub use unified::UnifiedMessenger;

/// Errors from the invocation layer.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// No endpoint with this name was created on this messenger.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The endpoint exists but speaks another contract.
    #[error("endpoint {name} speaks {found}, not {expected}")]
    ContractMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// An endpoint with this name already exists with a different definition.
    #[error("endpoint {0} already exists with a different definition")]
    EndpointMismatch(String),

    /// No process on the fabric implements this remote.
    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    /// This process already implements this remote.
    #[error("remote {0} already has a local implementor")]
    AlreadyRegistered(String),

    /// The implementor ran and failed.
    #[error("remote call failed: {0}")]
    Remote(RemoteFailure),

    /// The node the call was sent to left before replying.
    #[error("connection to {0} lost before the reply arrived")]
    ConnectionLost(String),

    #[error("timed out")]
    Timeout,

    /// The messenger shut down or failed.
    #[error("messenger shut down")]
    Shutdown,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Invocation layer settings.
#[derive(Debug, Clone)]
pub struct InvokeConfig {
    /// How long a client waits for the server's registry on start-up.
    pub init_timeout: Duration,
    /// Upper bound on every remote call. `None` waits until the reply
    /// arrives or the destination goes away.
    pub call_timeout: Option<Duration>,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            call_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failure_is_distinct_from_lost_connection() {
        let failed = InvokeError::Remote(RemoteFailure::new("boom"));
        let lost = InvokeError::ConnectionLost("bob@127.0.0.1:4000".into());
        assert!(failed.to_string().contains("boom"));
        assert!(lost.to_string().contains("bob"));
        assert!(!matches!(lost, InvokeError::Remote(_)));
    }

    #[test]
    fn test_default_config_has_no_call_timeout() {
        let config = InvokeConfig::default();
        assert_eq!(config.init_timeout, Duration::from_secs(10));
        assert!(config.call_timeout.is_none());
    }
}
