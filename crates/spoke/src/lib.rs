//! # Spoke
//!
//! A peer-addressable messaging fabric for turn-based multiplayer games.
//!
//! One process hosts a [`ServerMessenger`]; every other process joins it
//! with a [`ClientMessenger`]. Any node can then address any other node,
//! broadcast to all of them, or make method calls that cross the fabric
//! through the [`invoke`] layer (channels for fan-out, remotes for
//! request/reply). The server relays everything; clients only ever talk to
//! it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spoke::prelude::*;
//!
//! # async fn run() -> Result<(), SpokeError> {
//! let server = ServerMessenger::builder().name("host").port(3300).build().await?;
//! let client = ClientMessenger::builder("127.0.0.1", 3300, "alice")
//!     .connect()
//!     .await?;
//!
//! client.add_message_listener(std::sync::Arc::new(|payload: &Payload, from: &Node| {
//!     println!("{from}: {payload:?}");
//! }));
//! server.broadcast(Payload::Application(b"welcome".to_vec()));
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod handler;
pub mod invoke;
mod messenger;
mod server;

pub use client::{ClientConfig, ClientMessenger, ClientMessengerBuilder};
pub use error::SpokeError;
pub use handler::BANNED_REASON;
pub use invoke::{InvokeConfig, InvokeError};
pub use messenger::{ConnectionListener, ErrorListener, MessageListener, Messenger};
pub use server::{ServerConfig, ServerMessenger, ServerMessengerBuilder};

pub use spoke_protocol as protocol;
pub use spoke_session as session;
pub use spoke_transport as transport;

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::invoke::{
        Broadcaster, ChannelContract, ChannelMessenger, ChannelSubscriber, InvokeConfig,
        InvokeError, RemoteContract, RemoteImplementor, RemoteMessenger, RemoteProxy,
        UnifiedMessenger,
    };
    pub use crate::{
        ClientMessenger, ConnectionListener, ErrorListener, MessageListener, Messenger,
        ServerMessenger, SpokeError,
    };
    pub use spoke_protocol::{BincodeCodec, Codec, Node, Payload, RemoteFailure};
    pub use spoke_session::{
        CredentialProvider, LoginValidator, Moderation, MuteStore, PasswordCredentials,
        PasswordValidator,
    };
}
