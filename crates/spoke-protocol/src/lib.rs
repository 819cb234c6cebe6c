//! Wire protocol for spoke.
//!
//! This crate defines the "language" every process on the fabric speaks:
//!
//! - **Identity** ([`Node`], [`CallId`]): who is talking, and how calls
//!   are correlated with their replies.
//! - **Types** ([`Envelope`], [`Payload`], [`SystemMessage`],
//!   [`InvocationMessage`]): the message structures on the wire.
//! - **Codec** ([`Codec`] trait, [`BincodeCodec`], [`JsonCodec`]): how
//!   those messages become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! The protocol layer doesn't know about sockets or routing. It only knows
//! how to describe and serialize messages.
//!
//! ```text
//! Transport (frames) → Protocol (Envelope) → Messenger (routing, invocation)
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod call_id;
mod codec;
mod error;
mod invocation;
mod node;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use call_id::CallId;
pub use codec::{BincodeCodec, Codec};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{CodecFailure, ProtocolError};
pub use invocation::{
    EndpointDef, EndpointKind, InvocationMessage, InvocationOutcome, Invoke, RemoteFailure,
};
pub use node::Node;
pub use types::{Envelope, Payload, SystemMessage};
