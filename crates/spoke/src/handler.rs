//! Per-socket handling on the server: quarantine, promotion and routing.
//!
//! Each accepted socket gets its own Tokio task running [`quarantine`].
//! The flow is:
//!   1. Login handshake → validated, admitted, unique name reserved
//!   2. Identity exchange → a live `Connection`
//!   3. Promotion → snapshot to the newcomer, `NodeAdded` to everyone else
//!   4. From then on every envelope goes through [`route`]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use spoke_protocol::{Codec, Envelope, InvocationMessage, Node, Payload, SystemMessage};
use spoke_session::{Admitted, LoginRequest, ServerLogin, names::same_name, unique_name};
use spoke_transport::{Connection, ConnectionId, FramedConnection, TransportError};
use tokio::net::TcpStream;

use crate::SpokeError;
use crate::server::ServerState;

/// Reason sent to mini-banned players.
pub const BANNED_REASON: &str = "You have been banned from this game";

/// A display name held for a login that is not promoted yet.
///
/// Released on drop, so a login that dies anywhere between admission and
/// promotion frees its name.
pub(crate) struct NameReservation {
    reserved: Arc<Mutex<Vec<String>>>,
    name: String,
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = reserved.iter().position(|n| *n == self.name) {
            reserved.swap_remove(pos);
        }
    }
}

/// Handles a single socket from accept to promotion.
pub(crate) async fn quarantine<C: Codec>(
    stream: TcpStream,
    remote: SocketAddr,
    id: ConnectionId,
    state: Arc<ServerState<C>>,
) -> Result<(), SpokeError> {
    tracing::debug!(%id, %remote, "socket quarantined");
    let mut framed = FramedConnection::new(stream);

    // --- Step 1: Login ---
    let validator = state.validator();
    let login = ServerLogin {
        validator: validator.as_deref(),
        remote,
        timeout: state.handshake_timeout,
    };
    let admitted = login
        .run(&mut framed, &state.codec, |request| admit(&state, request))
        .await?;

    tracing::debug!(%id, name = %admitted.name, "login accepted");

    // --- Step 2: Identity exchange ---
    let listener = Arc::new(RouteListener {
        state: Arc::downgrade(&state),
    });
    let conn = Connection::establish(
        framed,
        state.node.clone(),
        state.codec.clone(),
        listener,
        state.handshake_timeout,
    )
    .await?;

    // --- Step 3: Promotion ---
    promote(&state, conn, admitted)
}

/// The server's admission policy: mini-bans, then a unique name.
fn admit<C: Codec>(
    state: &ServerState<C>,
    request: &LoginRequest,
) -> Result<(String, NameReservation), String> {
    if state.moderation.is_login_banned(
        &request.requested_name,
        request.remote.ip(),
        request.hardware_address.as_deref(),
    ) {
        tracing::info!(
            name = %request.requested_name,
            remote = %request.remote,
            "mini-banned player turned away"
        );
        return Err(BANNED_REASON.to_string());
    }

    let routing = state.routing();
    let mut reserved = state.reserved.lock().unwrap_or_else(|e| e.into_inner());
    let name = unique_name(&request.requested_name, |candidate| {
        same_name(state.node.name(), candidate)
            || routing.keys().any(|n| same_name(n.name(), candidate))
            || reserved.iter().any(|n| same_name(n, candidate))
    });
    reserved.push(name.clone());

    Ok((
        name.clone(),
        NameReservation {
            reserved: Arc::clone(&state.reserved),
            name,
        },
    ))
}

/// Puts a logged-in connection into the routing table.
fn promote<C: Codec>(
    state: &ServerState<C>,
    conn: Connection,
    admitted: Admitted<NameReservation>,
) -> Result<(), SpokeError> {
    let remote = conn.remote_node().clone();

    if remote.name() != admitted.name {
        tracing::warn!(declared = %remote, accepted = %admitted.name, "node name differs from login");
        conn.shutdown();
        return Err(TransportError::Handshake(format!(
            "declared name {} but logged in as {}",
            remote.name(),
            admitted.name
        ))
        .into());
    }

    {
        let mut routing = state.routing_mut();
        // A connection that failed before this point has already reported
        // its fatal error, and nothing would ever remove it.
        if state.shutdown.is_cancelled() || conn.is_shut_down() {
            drop(routing);
            tracing::debug!(node = %remote, "connection closed before promotion");
            conn.shutdown();
            return Err(TransportError::ConnectionClosed(format!("{remote} left before promotion")).into());
        }
        if remote == state.node || routing.contains_key(&remote) {
            drop(routing);
            tracing::warn!(node = %remote, "node collides with an existing connection");
            conn.shutdown();
            return Err(TransportError::Handshake(format!("node {remote} already connected")).into());
        }

        let mut nodes: Vec<Node> = routing.keys().cloned().collect();
        nodes.push(state.node.clone());
        nodes.push(remote.clone());
        conn.send(Envelope::to(
            remote.clone(),
            state.node.clone(),
            Payload::System(SystemMessage::NodeSnapshot { nodes }),
        ));

        let added = Envelope::broadcast(
            state.node.clone(),
            Payload::System(SystemMessage::NodeAdded {
                node: remote.clone(),
            }),
        );
        for other in routing.values() {
            other.send(added.clone());
        }

        routing.insert(remote.clone(), conn);
        drop(admitted.ticket);
    }

    state
        .moderation
        .record_login(remote.name(), admitted.request.hardware_address.as_deref());
    tracing::info!(node = %remote, "connection added");
    state.notify_added(&remote);
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Connection listener for every server-side connection.
///
/// Holds the state weakly: connection tasks must not keep a shut-down
/// server alive.
struct RouteListener<C: Codec> {
    state: Weak<ServerState<C>>,
}

impl<C: Codec> spoke_transport::ConnectionListener for RouteListener<C> {
    fn message_received(&self, envelope: Envelope, remote: &Node) {
        if let Some(state) = self.state.upgrade() {
            route(&state, envelope, remote);
        }
    }

    fn fatal_error(&self, error: TransportError, remote: &Node, unsent: Vec<Envelope>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        tracing::info!(node = %remote, error = %error, unsent = unsent.len(), "connection lost");
        if let Err(e) = state.remove_connection(remote) {
            tracing::debug!(node = %remote, error = %e, "could not remove failed connection");
        }
    }
}

/// Routes one envelope received from `remote`.
pub(crate) fn route<C: Codec>(state: &ServerState<C>, envelope: Envelope, remote: &Node) {
    if envelope.from != *remote {
        tracing::warn!(
            claimed = %envelope.from,
            actual = %remote,
            "envelope with forged sender, dropping connection"
        );
        if let Err(e) = state.remove_connection(remote) {
            tracing::debug!(error = %e, "could not remove forging connection");
        }
        return;
    }

    if let Some(notice) = muted_chat_notice(state, &envelope, remote) {
        tracing::debug!(node = %remote, "chat from muted player dropped");
        if let Some(conn) = state.routing().get(remote) {
            conn.send(Envelope::to(remote.clone(), state.node.clone(), notice));
        }
        return;
    }

    match &envelope.to {
        None => {
            state.deliver_local(&envelope.payload, &envelope.from);
            for (node, conn) in state.routing().iter() {
                if node != remote {
                    conn.send(envelope.clone());
                }
            }
        }
        Some(to) if *to == state.node => {
            state.deliver_local(&envelope.payload, &envelope.from);
        }
        Some(to) => match state.routing().get(to) {
            Some(conn) => conn.send(envelope),
            None => tracing::debug!(%to, from = %remote, "dropping envelope for unknown node"),
        },
    }
}

fn muted_chat_notice<C: Codec>(
    state: &ServerState<C>,
    envelope: &Envelope,
    remote: &Node,
) -> Option<Payload> {
    let Payload::Invocation(InvocationMessage::Invoke(invoke)) = &envelope.payload else {
        return None;
    };
    let chat = state.chat_mute()?;
    if invoke.endpoint != chat.channel {
        return None;
    }
    let muted = state
        .moderation
        .is_sender_muted(remote.name(), remote.address(), None);
    muted.then_some(chat.notice)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spoke_protocol::BincodeCodec;

    use super::*;
    use crate::{Messenger, ServerMessenger};

    struct Ignore;

    impl spoke_transport::ConnectionListener for Ignore {
        fn message_received(&self, _: Envelope, _: &Node) {}
        fn fatal_error(&self, _: TransportError, _: &Node, _: Vec<Envelope>) {}
    }

    #[tokio::test]
    async fn test_connection_closed_before_promotion_is_not_added() {
        let server = ServerMessenger::builder().name("host").build().await.unwrap();
        let state = Arc::clone(&server.state);
        let alice = Node::new("alice", "127.0.0.1:4000".parse().unwrap());

        let (near, far) = tokio::io::duplex(4096);
        let listener: Arc<dyn spoke_transport::ConnectionListener> = Arc::new(Ignore);
        let (conn, peer) = tokio::join!(
            Connection::establish(
                FramedConnection::new(near),
                state.node.clone(),
                BincodeCodec,
                Arc::clone(&listener),
                Duration::from_secs(5),
            ),
            Connection::establish(
                FramedConnection::new(far),
                alice.clone(),
                BincodeCodec,
                listener,
                Duration::from_secs(5),
            ),
        );
        let conn = conn.unwrap();
        let _peer = peer.unwrap();

        let request = LoginRequest {
            requested_name: "alice".into(),
            hardware_address: None,
            remote: alice.socket_addr(),
        };
        let (name, ticket) = admit(&state, &request).unwrap();
        assert_eq!(name, "alice");

        // The peer is gone by the time promotion runs.
        conn.shutdown();
        let admitted = Admitted {
            request,
            name,
            ticket,
        };
        assert!(promote(&state, conn, admitted).is_err());

        assert_eq!(server.nodes().len(), 1);
        assert!(state.reserved.lock().unwrap().is_empty());
    }
}
