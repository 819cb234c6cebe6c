//! An ordered, framed connection to one peer node.
//!
//! After setup a [`Connection`] owns two background tasks:
//!
//! ```text
//!   send() ──► unbounded queue ──► writer task ──► socket
//!   socket ──► reader task ──► ConnectionListener::message_received
//! ```
//!
//! Envelopes are written in the order they were queued and handed to the
//! listener in the order they were read, so each direction is FIFO.
//! `send` never blocks; `flush` waits for the queue to drain.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use spoke_protocol::{Codec, Envelope, Node};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::framing::{FrameReader, FrameWriter, FramedConnection};
use crate::{ConnectionId, TransportError};

/// Receives everything a [`Connection`] reads, plus its fatal failure.
///
/// Both methods are called from the connection's background tasks, so
/// implementations should not block.
pub trait ConnectionListener: Send + Sync + 'static {
    /// Called once per decoded envelope, in arrival order.
    fn message_received(&self, envelope: Envelope, remote: &Node);

    /// Called at most once, when the connection dies without a local
    /// `shutdown()`. `unsent` holds every envelope that was queued but
    /// never written.
    fn fatal_error(&self, error: TransportError, remote: &Node, unsent: Vec<Envelope>);
}

/// A cloneable handle to one live connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    local: Node,
    remote: Node,
    outbound: mpsc::UnboundedSender<Envelope>,
    /// Envelopes queued but not yet written.
    pending: watch::Sender<usize>,
    shutdown: CancellationToken,
    /// First failure seen by either task, reported by the writer on exit.
    fatal: Mutex<Option<TransportError>>,
}

impl Inner {
    fn fail(&self, error: TransportError) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            *fatal = Some(error);
        }
        drop(fatal);
        self.shutdown.cancel();
    }

    fn take_fatal(&self) -> Option<TransportError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn written_one(&self) -> bool {
        let mut idle = false;
        self.pending.send_modify(|n| {
            *n = n.saturating_sub(1);
            idle = *n == 0;
        });
        idle
    }
}

impl Connection {
    /// Exchanges node identities over `framed`, then starts the reader and
    /// writer tasks.
    ///
    /// Both sides write their own [`Node`] first and then read the peer's,
    /// so the exchange is symmetric and cannot deadlock. The read is
    /// bounded by `timeout`.
    ///
    /// # Errors
    /// `Timeout` if the peer stays silent, `ConnectionClosed` if it hangs
    /// up, or an I/O or codec error.
    pub async fn establish<IO, C>(
        mut framed: FramedConnection<IO>,
        local: Node,
        codec: C,
        listener: Arc<dyn ConnectionListener>,
        timeout: Duration,
    ) -> Result<Self, TransportError>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
        C: Codec,
    {
        framed.write_value(&codec, &local).await?;

        let remote: Node = tokio::time::timeout(timeout, framed.read_value(&codec))
            .await
            .map_err(|_| TransportError::Timeout)??
            .ok_or_else(|| {
                TransportError::ConnectionClosed("peer left during identity exchange".into())
            })?;

        let (outbound, queue) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let inner = Arc::new(Inner {
            id: ConnectionId::next(),
            local,
            remote,
            outbound,
            pending,
            shutdown: CancellationToken::new(),
            fatal: Mutex::new(None),
        });

        tracing::debug!(
            id = %inner.id,
            local = %inner.local,
            remote = %inner.remote,
            "connection established"
        );

        let (reader, writer) = framed.into_parts();
        tokio::spawn(read_loop(
            Arc::clone(&inner),
            reader,
            codec.clone(),
            Arc::clone(&listener),
        ));
        tokio::spawn(write_loop(Arc::clone(&inner), writer, codec, queue, listener));

        Ok(Self { inner })
    }

    /// Queues an envelope for writing. Never blocks.
    ///
    /// Silently ignored once the connection is shut down.
    pub fn send(&self, envelope: Envelope) {
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!(id = %self.inner.id, "send after shutdown ignored");
            return;
        }
        self.inner.pending.send_modify(|n| *n += 1);
        if self.inner.outbound.send(envelope).is_err() {
            self.inner.written_one();
        }
    }

    /// Waits until every queued envelope has been written, or until the
    /// connection shuts down. Returns immediately if already shut down.
    pub async fn flush(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut pending = self.inner.pending.subscribe();
        tokio::select! {
            _ = pending.wait_for(|n| *n == 0) => {}
            _ = self.inner.shutdown.cancelled() => {}
        }
    }

    /// Closes the connection. Idempotent and callable from any task.
    ///
    /// A shutdown requested here is never reported as a fatal error.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!(id = %self.inner.id, remote = %self.inner.remote, "shutting down connection");
            self.inner.shutdown.cancel();
        }
    }

    /// True once `shutdown()` was called or the connection failed.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Completes when the connection is shut down for any reason.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// This side's node, as sent during the identity exchange.
    pub fn local_node(&self) -> &Node {
        &self.inner.local
    }

    /// The peer's node, as received during the identity exchange.
    pub fn remote_node(&self) -> &Node {
        &self.inner.remote
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn read_loop<IO, C>(
    inner: Arc<Inner>,
    mut reader: FrameReader<IO>,
    codec: C,
    listener: Arc<dyn ConnectionListener>,
) where
    IO: AsyncRead + AsyncWrite,
    C: Codec,
{
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = reader.read_value::<C, Envelope>(&codec) => next,
        };

        match next {
            Ok(Some(envelope)) => listener.message_received(envelope, &inner.remote),
            Ok(None) => {
                inner.fail(TransportError::ConnectionClosed(
                    "peer closed the stream".into(),
                ));
                break;
            }
            Err(e) => {
                tracing::debug!(id = %inner.id, error = %e, "read failed");
                inner.fail(e);
                break;
            }
        }
    }
}

async fn write_loop<IO, C>(
    inner: Arc<Inner>,
    mut writer: FrameWriter<IO>,
    codec: C,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    listener: Arc<dyn ConnectionListener>,
) where
    IO: AsyncRead + AsyncWrite,
    C: Codec,
{
    let mut in_flight = None;

    loop {
        let envelope = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = inner.shutdown.cancelled() => None,
            result = writer.write_value(&codec, &envelope) => Some(result),
        };

        match result {
            None => {
                in_flight = Some(envelope);
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(id = %inner.id, error = %e, "write failed");
                in_flight = Some(envelope);
                inner.fail(e);
                break;
            }
            Some(Ok(())) => {}
        }

        if inner.written_one() {
            codec.reset();
        }
    }

    queue.close();
    let mut unsent: Vec<Envelope> = in_flight.into_iter().collect();
    while let Ok(envelope) = queue.try_recv() {
        unsent.push(envelope);
    }
    inner.pending.send_replace(0);

    if let Some(error) = inner.take_fatal() {
        tracing::debug!(
            id = %inner.id,
            remote = %inner.remote,
            error = %error,
            unsent = unsent.len(),
            "connection failed"
        );
        listener.fatal_error(error, &inner.remote, unsent);
    } else {
        let _ = writer.close().await;
    }
}
