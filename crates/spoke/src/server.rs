//! `ServerMessenger` builder, shared state and accept loop.
//!
//! The server is the hub of the fabric: every client connects to it, and
//! every envelope between two clients passes through it. This module ties
//! the layers together: transport (accept) → session (login) → routing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use spoke_protocol::{
    BincodeCodec, Codec, Envelope, InvocationMessage, Invoke, Node, Payload, SystemMessage,
};
use spoke_session::{LoginValidator, Moderation, MuteStore, NoMuteStore};
use spoke_transport::{Connection, TcpTransport};
use tokio_util::sync::CancellationToken;

use crate::handler;
use crate::invoke::ChannelContract;
use crate::messenger::{ConnectionListener, ErrorListener, Listeners, MessageListener, Messenger};
use crate::SpokeError;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The server node's display name.
    pub name: String,
    /// Address to listen on. Port 0 lets the OS pick.
    pub bind_addr: String,
    /// Bound on every wait during login and identity exchange.
    pub handshake_timeout: Duration,
    /// Whether new sockets are let in at all.
    pub accept_new_connections: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            handshake_timeout: Duration::from_secs(30),
            accept_new_connections: true,
        }
    }
}

/// The private notice a muted player gets instead of their chat line.
#[derive(Clone)]
pub(crate) struct ChatMute {
    pub(crate) channel: String,
    pub(crate) notice: Payload,
}

/// Shared server state, one per server messenger.
///
/// Wrapped in `Arc` so the accept loop, every quarantine task and every
/// connection listener can reach it.
pub(crate) struct ServerState<C: Codec> {
    pub(crate) node: Node,
    pub(crate) local_addr: SocketAddr,
    pub(crate) codec: C,
    pub(crate) handshake_timeout: Duration,
    /// Node → connection, for every promoted peer.
    pub(crate) routing: RwLock<HashMap<Node, Connection>>,
    /// Names handed out to logins that are not yet promoted.
    pub(crate) reserved: Arc<Mutex<Vec<String>>>,
    pub(crate) validator: RwLock<Option<Arc<dyn LoginValidator>>>,
    pub(crate) accept_new: AtomicBool,
    pub(crate) moderation: Moderation,
    pub(crate) chat_mute: RwLock<Option<ChatMute>>,
    pub(crate) message_listeners: Listeners<dyn MessageListener>,
    pub(crate) connection_listeners: Listeners<dyn ConnectionListener>,
    pub(crate) error_listeners: Listeners<dyn ErrorListener>,
    pub(crate) shutdown: CancellationToken,
}

impl<C: Codec> ServerState<C> {
    pub(crate) fn routing(&self) -> RwLockReadGuard<'_, HashMap<Node, Connection>> {
        self.routing.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn routing_mut(&self) -> RwLockWriteGuard<'_, HashMap<Node, Connection>> {
        self.routing.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn validator(&self) -> Option<Arc<dyn LoginValidator>> {
        self.validator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn chat_mute(&self) -> Option<ChatMute> {
        self.chat_mute
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn deliver_local(&self, payload: &Payload, from: &Node) {
        for listener in self.message_listeners.snapshot() {
            listener.message_received(payload, from);
        }
    }

    pub(crate) fn notify_added(&self, node: &Node) {
        for listener in self.connection_listeners.snapshot() {
            listener.connection_added(node);
        }
    }

    pub(crate) fn notify_removed(&self, node: &Node) {
        for listener in self.connection_listeners.snapshot() {
            listener.connection_removed(node);
        }
    }

    /// Drops a peer: closes its connection, tells everyone else, and
    /// remembers its hardware address for a while.
    ///
    /// Connection listeners run after the routing entry is gone, so a
    /// listener already sees the reduced node set.
    pub(crate) fn remove_connection(&self, node: &Node) -> Result<(), SpokeError> {
        if *node == self.node {
            return Err(SpokeError::CannotRemoveSelf);
        }

        let removed = {
            let mut routing = self.routing_mut();
            let removed = routing.remove_entry(node);
            if let Some((gone, _)) = &removed {
                let notice = Envelope::broadcast(
                    self.node.clone(),
                    Payload::System(SystemMessage::NodeRemoved { node: gone.clone() }),
                );
                for conn in routing.values() {
                    conn.send(notice.clone());
                }
            }
            removed
        };

        let Some((gone, conn)) = removed else {
            tracing::debug!(%node, "no connection to remove");
            return Ok(());
        };
        conn.shutdown();
        self.moderation.record_departure(gone.name());

        tracing::info!(node = %gone, "connection removed");
        self.notify_removed(&gone);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a server messenger.
///
/// # Example
///
/// ```rust,no_run
/// use spoke::prelude::*;
///
/// # async fn run() -> Result<(), SpokeError> {
/// let server = ServerMessenger::builder()
///     .name("host")
///     .port(3300)
///     .login_validator(PasswordValidator::new("s3cret"))
///     .build()
///     .await?;
/// println!("listening on {}", server.local_addr());
/// # Ok(())
/// # }
/// ```
pub struct ServerMessengerBuilder<C: Codec = BincodeCodec> {
    config: ServerConfig,
    codec: C,
    validator: Option<Arc<dyn LoginValidator>>,
    mute_store: Arc<dyn MuteStore>,
}

impl ServerMessengerBuilder<BincodeCodec> {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            codec: BincodeCodec,
            validator: None,
            mute_store: Arc::new(NoMuteStore),
        }
    }
}

impl Default for ServerMessengerBuilder<BincodeCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> ServerMessengerBuilder<C> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the server node's display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Listens on every interface at `port`.
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_addr = format!("0.0.0.0:{port}");
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn accept_new_connections(mut self, accept: bool) -> Self {
        self.config.accept_new_connections = accept;
        self
    }

    /// Installs a login policy. Without one, logins are anonymous.
    pub fn login_validator(mut self, validator: impl LoginValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Where persisted mutes are read from.
    pub fn mute_store(mut self, store: impl MuteStore) -> Self {
        self.mute_store = Arc::new(store);
        self
    }

    /// Switches the wire codec. Clients must use the same one.
    pub fn codec<C2: Codec>(self, codec: C2) -> ServerMessengerBuilder<C2> {
        ServerMessengerBuilder {
            config: self.config,
            codec,
            validator: self.validator,
            mute_store: self.mute_store,
        }
    }

    /// Binds the listener, starts the accept loop and returns the handle.
    pub async fn build(self) -> Result<ServerMessenger<C>, SpokeError> {
        let transport = TcpTransport::bind(self.config.bind_addr.as_str()).await?;
        let local_addr = transport.local_addr()?;

        // Nobody can connect to "0.0.0.0", so advertise loopback instead.
        let advertised = match local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let node = Node::new(
            self.config.name.clone(),
            SocketAddr::new(advertised, local_addr.port()),
        );

        let state = Arc::new(ServerState {
            node,
            local_addr,
            codec: self.codec,
            handshake_timeout: self.config.handshake_timeout,
            routing: RwLock::new(HashMap::new()),
            reserved: Arc::new(Mutex::new(Vec::new())),
            validator: RwLock::new(self.validator),
            accept_new: AtomicBool::new(self.config.accept_new_connections),
            moderation: Moderation::new(self.mute_store),
            chat_mute: RwLock::new(None),
            message_listeners: Listeners::default(),
            connection_listeners: Listeners::default(),
            error_listeners: Listeners::default(),
            shutdown: CancellationToken::new(),
        });

        tracing::info!(node = %state.node, "server messenger running");
        tokio::spawn(accept_loop(transport, Arc::clone(&state)));

        Ok(ServerMessenger { state })
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

async fn accept_loop<C: Codec>(transport: TcpTransport, state: Arc<ServerState<C>>) {
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = transport.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote, id)) => {
                if !state.accept_new.load(Ordering::SeqCst) {
                    tracing::debug!(%id, %remote, "not accepting new connections, closing socket");
                    drop(stream);
                    continue;
                }
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handler::quarantine(stream, remote, id, state).await {
                        tracing::debug!(%id, %remote, error = %e, "login did not complete");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
    tracing::info!("accept loop stopped");
}

// ---------------------------------------------------------------------------
// ServerMessenger
// ---------------------------------------------------------------------------

/// The hub of the fabric.
///
/// Cloneable handle; all clones drive the same server.
pub struct ServerMessenger<C: Codec = BincodeCodec> {
    pub(crate) state: Arc<ServerState<C>>,
}

impl<C: Codec> Clone for ServerMessenger<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl ServerMessenger<BincodeCodec> {
    /// Creates a new builder.
    pub fn builder() -> ServerMessengerBuilder<BincodeCodec> {
        ServerMessengerBuilder::new()
    }
}

impl<C: Codec> ServerMessenger<C> {
    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    /// Replaces (or removes) the login policy for future logins.
    pub fn set_login_validator(&self, validator: Option<Arc<dyn LoginValidator>>) {
        *self
            .state
            .validator
            .write()
            .unwrap_or_else(|e| e.into_inner()) = validator;
    }

    pub fn set_accept_new_connections(&self, accept: bool) {
        self.state.accept_new.store(accept, Ordering::SeqCst);
        tracing::info!(accept, "accepting new connections");
    }

    pub fn is_accept_new_connections(&self) -> bool {
        self.state.accept_new.load(Ordering::SeqCst)
    }

    /// Starts filtering chat: invocations on `channel` from a muted sender
    /// are dropped and the sender gets `notice` instead, as a call on the
    /// same channel addressed to them only.
    pub fn enable_chat_muting<Ch: ChannelContract>(
        &self,
        channel: &str,
        notice: &Ch::Call,
    ) -> Result<(), SpokeError> {
        let call = self.state.codec.encode(notice)?;
        let payload = Payload::Invocation(InvocationMessage::Invoke(Invoke {
            endpoint: channel.to_string(),
            method: Ch::method(notice).to_string(),
            call_id: None,
            need_reply: false,
            call,
        }));
        *self
            .state
            .chat_mute
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(ChatMute {
            channel: channel.to_string(),
            notice: payload,
        });
        Ok(())
    }

    /// Mutes and mini-bans for this server.
    pub fn moderation(&self) -> &Moderation {
        &self.state.moderation
    }

    /// The hardware address a connected (or recently departed) player
    /// logged in with.
    pub fn player_hardware_address(&self, name: &str) -> Option<String> {
        self.state.moderation.hardware_address(name)
    }

    /// Disconnects a client.
    ///
    /// # Errors
    /// [`SpokeError::CannotRemoveSelf`] for the server's own node.
    pub fn remove_connection(&self, node: &Node) -> Result<(), SpokeError> {
        self.state.remove_connection(node)
    }
}

impl<C: Codec> Messenger for ServerMessenger<C> {
    type Codec = C;

    fn codec(&self) -> &C {
        &self.state.codec
    }

    fn send(&self, payload: Payload, to: &Node) {
        if *to == self.state.node {
            self.state.deliver_local(&payload, &self.state.node);
            return;
        }
        match self.state.routing().get(to) {
            Some(conn) => conn.send(Envelope::to(to.clone(), self.state.node.clone(), payload)),
            None => tracing::debug!(%to, "dropping payload for unknown node"),
        }
    }

    fn broadcast(&self, payload: Payload) {
        let envelope = Envelope::broadcast(self.state.node.clone(), payload);
        for conn in self.state.routing().values() {
            conn.send(envelope.clone());
        }
    }

    fn local_node(&self) -> Node {
        self.state.node.clone()
    }

    fn server_node(&self) -> Node {
        self.state.node.clone()
    }

    fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.state.routing().keys().cloned().collect();
        nodes.push(self.state.node.clone());
        nodes
    }

    fn is_server(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        !self.state.shutdown.is_cancelled()
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.state.message_listeners.add(listener);
    }

    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.state.message_listeners.remove(listener);
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.state.connection_listeners.add(listener);
    }

    fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.state.connection_listeners.remove(listener);
    }

    fn add_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        self.state.error_listeners.add(listener);
    }

    fn remove_error_listener(&self, listener: &Arc<dyn ErrorListener>) {
        self.state.error_listeners.remove(listener);
    }

    fn closed(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    async fn flush(&self) {
        let conns: Vec<Connection> = self.state.routing().values().cloned().collect();
        futures_util::future::join_all(conns.iter().map(Connection::flush)).await;
    }

    fn shutdown(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(node = %self.state.node, "server messenger shutting down");
        self.state.shutdown.cancel();

        let drained: Vec<(Node, Connection)> = self.state.routing_mut().drain().collect();
        for (node, conn) in drained {
            conn.shutdown();
            self.state.moderation.record_departure(node.name());
            self.state.notify_removed(&node);
        }
    }
}
