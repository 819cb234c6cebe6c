//! Contract traits for channels and remotes.
//!
//! A contract names a call enum and maps each variant to a method name.
//! For example, a chat channel:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use spoke::invoke::{ChannelContract, ChannelSubscriber};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! enum ChatCall {
//!     Said { from: String, text: String },
//!     Me { from: String, action: String },
//! }
//!
//! struct Chat;
//!
//! impl ChannelContract for Chat {
//!     const NAME: &'static str = "chat";
//!     type Call = ChatCall;
//!
//!     fn method(call: &ChatCall) -> &'static str {
//!         match call {
//!             ChatCall::Said { .. } => "said",
//!             ChatCall::Me { .. } => "me",
//!         }
//!     }
//! }
//!
//! struct Printer;
//!
//! impl ChannelSubscriber<Chat> for Printer {
//!     fn on_call(&self, call: ChatCall) {
//!         if let ChatCall::Said { from, text } = call {
//!             println!("<{from}> {text}");
//!         }
//!     }
//! }
//! ```

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use spoke_protocol::RemoteFailure;

/// A multicast contract: calls in, nothing out.
pub trait ChannelContract: Send + Sync + 'static {
    /// Contract name. Endpoints record it so a subscriber or broadcaster
    /// for the wrong contract is refused.
    const NAME: &'static str;

    /// One variant per method.
    type Call: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// The method a call invokes, for diagnostics.
    fn method(call: &Self::Call) -> &'static str;
}

/// Receives every call made on a channel.
///
/// Runs on the endpoint's task; calls arrive one at a time.
pub trait ChannelSubscriber<C: ChannelContract>: Send + Sync + 'static {
    fn on_call(&self, call: C::Call);
}

/// A unicast contract: a call in, a reply out.
pub trait RemoteContract: Send + Sync + 'static {
    const NAME: &'static str;

    type Call: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Use `()` for methods that return nothing.
    type Reply: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn method(call: &Self::Call) -> &'static str;
}

/// The one object on the fabric that answers a remote.
pub trait RemoteImplementor<C: RemoteContract>: Send + Sync + 'static {
    fn invoke(
        &self,
        call: C::Call,
    ) -> impl Future<Output = Result<C::Reply, RemoteFailure>> + Send;
}
