//! The contract shared by the server and client messengers.
//!
//! A messenger moves [`Payload`]s between nodes. Application code (and
//! the invocation layer) only talks to this trait, so it runs unchanged on
//! the host and on a joined client.

use std::future::Future;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use spoke_protocol::{Codec, Node, Payload, ProtocolError};
use tokio_util::sync::CancellationToken;

use crate::SpokeError;

// ---------------------------------------------------------------------------
// Listener traits
// ---------------------------------------------------------------------------

/// Receives every payload delivered to this process.
///
/// Called from network tasks; implementations should hand work off
/// rather than block.
pub trait MessageListener: Send + Sync + 'static {
    fn message_received(&self, payload: &Payload, from: &Node);
}

impl<F> MessageListener for F
where
    F: Fn(&Payload, &Node) + Send + Sync + 'static,
{
    fn message_received(&self, payload: &Payload, from: &Node) {
        self(payload, from)
    }
}

/// Told when nodes join or leave the fabric.
pub trait ConnectionListener: Send + Sync + 'static {
    fn connection_added(&self, node: &Node);
    fn connection_removed(&self, node: &Node);
}

/// Told once when a messenger dies on its own (not by `shutdown()`).
pub trait ErrorListener: Send + Sync + 'static {
    fn messenger_failed(&self, error: &SpokeError);
}

impl<F> ErrorListener for F
where
    F: Fn(&SpokeError) + Send + Sync + 'static,
{
    fn messenger_failed(&self, error: &SpokeError) {
        self(error)
    }
}

/// A registration list of listeners.
///
/// Callbacks always run on a snapshot taken outside the lock, so a
/// listener may add or remove listeners while being called.
pub(crate) struct Listeners<T: ?Sized> {
    inner: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Listeners<T> {
    pub(crate) fn add(&self, listener: Arc<T>) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Removes by identity (the `Arc`'s data pointer).
    pub(crate) fn remove(&self, listener: &Arc<T>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Sends payloads to nodes and tells listeners what arrives.
///
/// Implemented by [`crate::ServerMessenger`] and [`crate::ClientMessenger`].
/// Handles are cheap to clone; every clone drives the same messenger.
///
/// Delivery is FIFO per sender/receiver pair. Nothing is ordered across
/// different senders.
pub trait Messenger: Clone + Send + Sync + 'static {
    /// The codec shared by every connection of this messenger.
    type Codec: Codec;

    fn codec(&self) -> &Self::Codec;

    /// Sends `payload` to one node. Never blocks; silently dropped if the
    /// node is gone or the messenger is shut down.
    fn send(&self, payload: Payload, to: &Node);

    /// Sends `payload` to every node except this one.
    fn broadcast(&self, payload: Payload);

    fn local_node(&self) -> Node;

    fn server_node(&self) -> Node;

    /// Every node currently on the fabric, this one included.
    fn nodes(&self) -> Vec<Node>;

    fn is_server(&self) -> bool;

    /// False once shut down or failed.
    fn is_connected(&self) -> bool;

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>);
    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>);

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>);
    fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>);

    fn add_error_listener(&self, listener: Arc<dyn ErrorListener>);
    fn remove_error_listener(&self, listener: &Arc<dyn ErrorListener>);

    /// Cancelled when the messenger shuts down or fails.
    fn closed(&self) -> CancellationToken;

    /// Waits until everything sent so far has been written to the
    /// network, or until shutdown.
    fn flush(&self) -> impl Future<Output = ()> + Send;

    /// Closes every connection. Idempotent.
    fn shutdown(&self);

    /// Encodes `value` with the messenger's codec and sends it as an
    /// application payload.
    fn send_value<T: Serialize>(&self, value: &T, to: &Node) -> Result<(), ProtocolError> {
        let bytes = self.codec().encode(value)?;
        self.send(Payload::Application(bytes), to);
        Ok(())
    }

    /// Encodes `value` and broadcasts it as an application payload.
    fn broadcast_value<T: Serialize>(&self, value: &T) -> Result<(), ProtocolError> {
        let bytes = self.codec().encode(value)?;
        self.broadcast(Payload::Application(bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_listeners_are_removed_by_identity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let listeners: Listeners<dyn MessageListener> = Listeners::default();

        let counter = Arc::clone(&hits);
        let a: Arc<dyn MessageListener> = Arc::new(move |_: &Payload, _: &Node| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let b: Arc<dyn MessageListener> = Arc::new(|_: &Payload, _: &Node| {});

        listeners.add(Arc::clone(&a));
        listeners.add(Arc::clone(&b));
        listeners.remove(&b);

        let from = Node::new("x", ([127, 0, 0, 1], 1).into());
        for l in listeners.snapshot() {
            l.message_received(&Payload::Application(vec![]), &from);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.snapshot().len(), 1);
    }
}
