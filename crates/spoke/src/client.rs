//! `ClientMessenger`: one connection to the server, which does all fan-out.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use spoke_protocol::{BincodeCodec, Codec, Envelope, Node, Payload, SystemMessage};
use spoke_session::{ClientLogin, CredentialProvider};
use spoke_transport::{Connection, FramedConnection, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messenger::{ConnectionListener, ErrorListener, Listeners, MessageListener, Messenger};
use crate::SpokeError;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// The display name to ask for. The server may hand back a variant.
    pub name: String,
    /// Sent along with the login response when the server asks for one.
    pub hardware_address: Option<String>,
    /// Bound on every wait during login and identity exchange.
    pub handshake_timeout: Duration,
    /// How long to wait for the server's node snapshot after login.
    pub snapshot_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3300,
            name: "player".to_string(),
            hardware_address: None,
            handshake_timeout: Duration::from_secs(30),
            snapshot_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder for connecting a client messenger.
///
/// # Example
///
/// ```rust,no_run
/// use spoke::prelude::*;
///
/// # async fn run() -> Result<(), SpokeError> {
/// let client = ClientMessenger::builder("127.0.0.1", 3300, "alice")
///     .credentials(PasswordCredentials::new("s3cret"))
///     .connect()
///     .await?;
/// println!("joined as {}", client.local_node());
/// # Ok(())
/// # }
/// ```
pub struct ClientMessengerBuilder<C: Codec = BincodeCodec> {
    config: ClientConfig,
    codec: C,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl ClientMessengerBuilder<BincodeCodec> {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                host: host.into(),
                port,
                name: name.into(),
                ..ClientConfig::default()
            },
            codec: BincodeCodec,
            credentials: None,
        }
    }
}

impl<C: Codec> ClientMessengerBuilder<C> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Answers the server's login challenge.
    pub fn credentials(mut self, credentials: impl CredentialProvider) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Reports this machine's hardware address at login, with or without
    /// a password. The host can mute or mini-ban by it.
    pub fn hardware_address(mut self, address: impl Into<String>) -> Self {
        self.config.hardware_address = Some(address.into());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.config.snapshot_timeout = timeout;
        self
    }

    /// Switches the wire codec. Must match the server's.
    pub fn codec<C2: Codec>(self, codec: C2) -> ClientMessengerBuilder<C2> {
        ClientMessengerBuilder {
            config: self.config,
            codec,
            credentials: self.credentials,
        }
    }

    /// Connects, logs in and waits for the server's view of the fabric.
    ///
    /// Returns only once the node snapshot has arrived, so `nodes()` is
    /// complete from the start.
    ///
    /// # Errors
    /// [`SpokeError::CouldNotLogIn`] if the server refused the login,
    /// otherwise a transport or session error.
    pub async fn connect(self) -> Result<ClientMessenger<C>, SpokeError> {
        let config = self.config;
        let stream =
            spoke_transport::connect((config.host.as_str(), config.port)).await?;
        let local_addr = stream.local_addr()?;
        let mut framed = FramedConnection::new(stream);

        let login = ClientLogin {
            name: &config.name,
            credentials: self.credentials.as_deref(),
            hardware_address: config.hardware_address.as_deref(),
            timeout: config.handshake_timeout,
        };
        let name = login
            .run(&mut framed, &self.codec)
            .await
            .map_err(SpokeError::from_login)?;

        let (events, mut inbound) = mpsc::unbounded_channel();
        let conn = Connection::establish(
            framed,
            Node::new(name, local_addr),
            self.codec.clone(),
            Arc::new(Forward { events }),
            config.handshake_timeout,
        )
        .await?;

        let nodes = match tokio::time::timeout(config.snapshot_timeout, inbound.recv()).await {
            Ok(Some(Inbound::Message(Envelope {
                payload: Payload::System(SystemMessage::NodeSnapshot { nodes }),
                ..
            }))) => nodes,
            Ok(Some(Inbound::Message(other))) => {
                conn.shutdown();
                return Err(TransportError::Handshake(format!(
                    "expected a node snapshot, got a message from {}",
                    other.from
                ))
                .into());
            }
            Ok(Some(Inbound::Failed(error))) => return Err(error.into()),
            Ok(None) => {
                conn.shutdown();
                return Err(TransportError::ConnectionClosed(
                    "server left before the node snapshot".into(),
                )
                .into());
            }
            Err(_) => {
                conn.shutdown();
                return Err(TransportError::Timeout.into());
            }
        };

        let state = Arc::new(ClientState {
            local: conn.local_node().clone(),
            server: conn.remote_node().clone(),
            conn,
            codec: self.codec,
            nodes: RwLock::new(nodes),
            message_listeners: Listeners::default(),
            connection_listeners: Listeners::default(),
            error_listeners: Listeners::default(),
            closed: CancellationToken::new(),
        });

        tracing::info!(
            local = %state.local,
            server = %state.server,
            nodes = state.nodes().len(),
            "client messenger connected"
        );
        tokio::spawn(dispatch(Arc::downgrade(&state), inbound));

        Ok(ClientMessenger { state })
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

enum Inbound {
    Message(Envelope),
    Failed(TransportError),
}

/// Moves connection events onto the dispatch task, which can outlive the
/// connect call and owns listener delivery.
struct Forward {
    events: mpsc::UnboundedSender<Inbound>,
}

impl spoke_transport::ConnectionListener for Forward {
    fn message_received(&self, envelope: Envelope, _remote: &Node) {
        let _ = self.events.send(Inbound::Message(envelope));
    }

    fn fatal_error(&self, error: TransportError, remote: &Node, unsent: Vec<Envelope>) {
        tracing::warn!(server = %remote, error = %error, unsent = unsent.len(), "lost the server");
        let _ = self.events.send(Inbound::Failed(error));
    }
}

async fn dispatch<C: Codec>(state: Weak<ClientState<C>>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = inbound.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        match event {
            Inbound::Message(envelope) => state.handle(envelope),
            Inbound::Failed(error) => {
                state.fail(error);
                break;
            }
        }
    }
}

struct ClientState<C: Codec> {
    local: Node,
    server: Node,
    conn: Connection,
    codec: C,
    /// Every node on the fabric as last reported by the server.
    nodes: RwLock<Vec<Node>>,
    message_listeners: Listeners<dyn MessageListener>,
    connection_listeners: Listeners<dyn ConnectionListener>,
    error_listeners: Listeners<dyn ErrorListener>,
    closed: CancellationToken,
}

impl<C: Codec> ClientState<C> {
    fn nodes(&self) -> Vec<Node> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn handle(&self, envelope: Envelope) {
        match envelope.payload {
            Payload::System(SystemMessage::NodeAdded { node }) => {
                {
                    let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
                    if nodes.contains(&node) {
                        return;
                    }
                    nodes.push(node.clone());
                }
                tracing::debug!(%node, "node joined");
                for listener in self.connection_listeners.snapshot() {
                    listener.connection_added(&node);
                }
            }
            Payload::System(SystemMessage::NodeRemoved { node }) => {
                {
                    let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
                    let before = nodes.len();
                    nodes.retain(|n| *n != node);
                    if nodes.len() == before {
                        return;
                    }
                }
                tracing::debug!(%node, "node left");
                for listener in self.connection_listeners.snapshot() {
                    listener.connection_removed(&node);
                }
            }
            Payload::System(SystemMessage::NodeSnapshot { .. }) => {
                tracing::warn!("ignoring a second node snapshot");
            }
            payload => self.deliver(&payload, &envelope.from),
        }
    }

    fn deliver(&self, payload: &Payload, from: &Node) {
        for listener in self.message_listeners.snapshot() {
            listener.message_received(payload, from);
        }
    }

    fn fail(&self, error: TransportError) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let error = SpokeError::Transport(error);
        for listener in self.error_listeners.snapshot() {
            listener.messenger_failed(&error);
        }
    }
}

impl<C: Codec> Drop for ClientState<C> {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

// ---------------------------------------------------------------------------
// ClientMessenger
// ---------------------------------------------------------------------------

/// A process that joined someone else's fabric.
///
/// Cloneable handle; the connection closes when the last clone is dropped
/// or on `shutdown()`.
pub struct ClientMessenger<C: Codec = BincodeCodec> {
    state: Arc<ClientState<C>>,
}

impl<C: Codec> Clone for ClientMessenger<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl ClientMessenger<BincodeCodec> {
    /// Creates a new builder.
    pub fn builder(
        host: impl Into<String>,
        port: u16,
        name: impl Into<String>,
    ) -> ClientMessengerBuilder<BincodeCodec> {
        ClientMessengerBuilder::new(host, port, name)
    }
}

impl<C: Codec> Messenger for ClientMessenger<C> {
    type Codec = C;

    fn codec(&self) -> &C {
        &self.state.codec
    }

    fn send(&self, payload: Payload, to: &Node) {
        if *to == self.state.local {
            self.state.deliver(&payload, &self.state.local);
            return;
        }
        self.state
            .conn
            .send(Envelope::to(to.clone(), self.state.local.clone(), payload));
    }

    fn broadcast(&self, payload: Payload) {
        self.state
            .conn
            .send(Envelope::broadcast(self.state.local.clone(), payload));
    }

    fn local_node(&self) -> Node {
        self.state.local.clone()
    }

    fn server_node(&self) -> Node {
        self.state.server.clone()
    }

    fn nodes(&self) -> Vec<Node> {
        self.state.nodes()
    }

    fn is_server(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        !self.state.closed.is_cancelled()
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
        self.state.closed.clone()
    }

    async fn flush(&self) {
        self.state.conn.flush().await;
    }

    fn shutdown(&self) {
        if self.state.closed.is_cancelled() {
            return;
        }
        tracing::info!(node = %self.state.local, "client messenger shutting down");
        self.state.conn.shutdown();
        self.state.closed.cancel();
    }
}
