//! The shared engine behind channels and remotes.
//!
//! `UnifiedMessenger` sits on top of any [`Messenger`] and keeps three
//! tables:
//!
//! - **endpoints**: every channel and remote known on the fabric, each
//!   with its local actor ([`Endpoint`]);
//! - **implementors**: which node has implementors for which endpoints;
//! - **pending**: remote calls sent out and waiting for `Results`.
//!
//! Registry changes are broadcast as they happen. A joining client asks
//! the server for the whole registry once (`InitRequest` → `Init`) and
//! follows the broadcasts from then on.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use spoke_protocol::{
    CallId, EndpointDef, InvocationMessage, InvocationOutcome, Invoke, Node, Payload,
};
use tokio::sync::{oneshot, watch};

use super::endpoint::{Endpoint, Implementor};
use super::{InvokeConfig, InvokeError};
use crate::messenger::{ConnectionListener, MessageListener, Messenger};

/// A remote call waiting for its reply.
struct Pending {
    dest: Node,
    reply: oneshot::Sender<Result<InvocationOutcome, InvokeError>>,
}

struct Unified<M: Messenger> {
    messenger: M,
    config: InvokeConfig,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    implementors: RwLock<HashMap<Node, HashSet<String>>>,
    pending: Mutex<HashMap<CallId, Pending>>,
    /// Bumped on every registry change; wakes `wait_until`.
    changes: watch::Sender<u64>,
    /// Fired when the server's `Init` arrives.
    init: Mutex<Option<oneshot::Sender<()>>>,
    message_hook: Arc<dyn MessageListener>,
    connection_hook: Arc<dyn ConnectionListener>,
}

/// Listens on the messenger on behalf of a [`Unified`], without keeping
/// it alive.
struct Hook<M: Messenger> {
    unified: Weak<Unified<M>>,
}

impl<M: Messenger> MessageListener for Hook<M> {
    fn message_received(&self, payload: &Payload, from: &Node) {
        if let (Payload::Invocation(message), Some(unified)) = (payload, self.unified.upgrade()) {
            unified.handle(message, from);
        }
    }
}

impl<M: Messenger> ConnectionListener for Hook<M> {
    fn connection_added(&self, _node: &Node) {}

    fn connection_removed(&self, node: &Node) {
        if let Some(unified) = self.unified.upgrade() {
            unified.forget_node(node);
        }
    }
}

impl<M: Messenger> Unified<M> {
    fn endpoints(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    fn implementors(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Node, HashSet<String>>> {
        self.implementors.read().unwrap_or_else(|e| e.into_inner())
    }

    fn implementors_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Node, HashSet<String>>> {
        self.implementors.write().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CallId, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, name: &str) -> Option<Endpoint> {
        self.endpoints().get(name).cloned()
    }

    fn changed(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn broadcast(&self, message: InvocationMessage) {
        self.messenger.broadcast(Payload::Invocation(message));
    }

    // --- Incoming records ---

    fn handle(&self, message: &InvocationMessage, from: &Node) {
        match message {
            InvocationMessage::InitRequest => {
                if self.messenger.is_server() {
                    self.messenger
                        .send(Payload::Invocation(self.init_snapshot()), from);
                }
            }
            InvocationMessage::Init {
                endpoints,
                implementors,
            } => {
                for def in endpoints {
                    self.learn_endpoint(def);
                }
                {
                    let local = self.messenger.local_node();
                    let mut table = self.implementors_mut();
                    for (node, names) in implementors {
                        if *node != local {
                            table
                                .entry(node.clone())
                                .or_default()
                                .extend(names.iter().cloned());
                        }
                    }
                }
                self.changed();
                if let Some(init) = self.init.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = init.send(());
                }
            }
            InvocationMessage::EndpointCreated(def) => {
                self.learn_endpoint(def);
                self.changed();
            }
            InvocationMessage::EndpointDestroyed { name } => {
                self.endpoints_mut().remove(name);
                for names in self.implementors_mut().values_mut() {
                    names.remove(name);
                }
                self.changed();
            }
            InvocationMessage::HasImplementor { name } => {
                self.implementors_mut()
                    .entry(from.clone())
                    .or_default()
                    .insert(name.clone());
                self.changed();
            }
            InvocationMessage::NoLongerHasImplementor { name } => {
                if let Some(names) = self.implementors_mut().get_mut(from) {
                    names.remove(name);
                }
                self.changed();
            }
            InvocationMessage::Invoke(invoke) => self.run_incoming(invoke, from),
            InvocationMessage::Results { call_id, outcome } => {
                match self.pending().remove(call_id) {
                    Some(pending) => {
                        let _ = pending.reply.send(Ok(outcome.clone()));
                    }
                    None => tracing::debug!(%call_id, %from, "reply for a call nobody waits on"),
                }
            }
        }
    }

    fn learn_endpoint(&self, def: &EndpointDef) {
        let mut endpoints = self.endpoints_mut();
        match endpoints.get(&def.name) {
            Some(existing) if existing.def() != def => {
                tracing::warn!(
                    endpoint = %def.name,
                    local = %existing.def().contract,
                    remote = %def.contract,
                    "conflicting endpoint definition ignored"
                );
            }
            Some(_) => {}
            None => {
                endpoints.insert(def.name.clone(), Endpoint::spawn(def.clone()));
            }
        }
    }

    fn init_snapshot(&self) -> InvocationMessage {
        let endpoints = self.endpoints().values().map(|e| e.def().clone()).collect();
        let implementors = self
            .implementors()
            .iter()
            .map(|(node, names)| (node.clone(), names.iter().cloned().collect()))
            .collect();
        InvocationMessage::Init {
            endpoints,
            implementors,
        }
    }

    fn run_incoming(&self, invoke: &Invoke, from: &Node) {
        let reply_to = match (invoke.need_reply, invoke.call_id) {
            (true, Some(call_id)) => Some(call_id),
            _ => None,
        };

        let Some(endpoint) = self.endpoint(&invoke.endpoint) else {
            tracing::debug!(endpoint = %invoke.endpoint, %from, "call on unknown endpoint");
            if let Some(call_id) = reply_to {
                self.messenger.send(
                    Payload::Invocation(InvocationMessage::Results {
                        call_id,
                        outcome: InvocationOutcome::NotFound,
                    }),
                    from,
                );
            }
            return;
        };

        let Some(call_id) = reply_to else {
            endpoint.enqueue(invoke.method.as_str(), invoke.call.clone(), None);
            return;
        };

        let (tx, rx) = oneshot::channel();
        endpoint.enqueue(invoke.method.as_str(), invoke.call.clone(), Some(tx));
        let messenger = self.messenger.clone();
        let caller = from.clone();
        tokio::spawn(async move {
            let outcome = rx.await.unwrap_or(InvocationOutcome::NotFound);
            messenger.send(
                Payload::Invocation(InvocationMessage::Results { call_id, outcome }),
                &caller,
            );
        });
    }

    /// A node left: drop what it implemented and fail calls waiting on it.
    fn forget_node(&self, node: &Node) {
        self.implementors_mut().remove(node);
        self.changed();

        let lost: Vec<Pending> = {
            let mut pending = self.pending();
            let ids: Vec<CallId> = pending
                .iter()
                .filter(|(_, p)| p.dest == *node)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        if !lost.is_empty() {
            tracing::info!(%node, calls = lost.len(), "failing calls to departed node");
        }
        for call in lost {
            let _ = call
                .reply
                .send(Err(InvokeError::ConnectionLost(node.to_string())));
        }
    }

    /// The messenger is gone: fail everything still waiting.
    fn fail_all(&self) {
        let lost: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for call in lost {
            let _ = call.reply.send(Err(InvokeError::Shutdown));
        }
        self.init.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl<M: Messenger> Drop for Unified<M> {
    fn drop(&mut self) {
        self.messenger.remove_message_listener(&self.message_hook);
        self.messenger
            .remove_connection_listener(&self.connection_hook);
    }
}

// ---------------------------------------------------------------------------
// UnifiedMessenger
// ---------------------------------------------------------------------------

/// Endpoint registry and call routing on top of a messenger.
///
/// Cloneable handle. [`super::ChannelMessenger`] and
/// [`super::RemoteMessenger`] are typed views over one of these; several
/// views may share the same engine.
pub struct UnifiedMessenger<M: Messenger> {
    inner: Arc<Unified<M>>,
}

impl<M: Messenger> Clone for UnifiedMessenger<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Messenger> UnifiedMessenger<M> {
    /// Attaches to `messenger`. On a client this waits for the server's
    /// registry.
    ///
    /// # Errors
    /// `Timeout` if the server does not answer within
    /// [`InvokeConfig::init_timeout`], `Shutdown` if the messenger closes
    /// first.
    pub async fn new(messenger: M, config: InvokeConfig) -> Result<Self, InvokeError> {
        let (init_tx, init_rx) = oneshot::channel();
        let (changes, _) = watch::channel(0u64);

        let inner = Arc::new_cyclic(|weak: &Weak<Unified<M>>| {
            let hook = Arc::new(Hook {
                unified: weak.clone(),
            });
            let message_hook: Arc<dyn MessageListener> = hook.clone();
            let connection_hook: Arc<dyn ConnectionListener> = hook;
            Unified {
                messenger: messenger.clone(),
                config,
                endpoints: RwLock::new(HashMap::new()),
                implementors: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                changes,
                init: Mutex::new(Some(init_tx)),
                message_hook,
                connection_hook,
            }
        });

        messenger.add_message_listener(Arc::clone(&inner.message_hook));
        messenger.add_connection_listener(Arc::clone(&inner.connection_hook));

        let weak = Arc::downgrade(&inner);
        let closed = messenger.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(unified) = weak.upgrade() {
                unified.fail_all();
            }
        });

        if !messenger.is_server() {
            messenger.send(
                Payload::Invocation(InvocationMessage::InitRequest),
                &messenger.server_node(),
            );
            tokio::time::timeout(inner.config.init_timeout, init_rx)
                .await
                .map_err(|_| InvokeError::Timeout)?
                .map_err(|_| InvokeError::Shutdown)?;
            tracing::debug!(
                endpoints = inner.endpoints().len(),
                "invocation registry synchronized"
            );
        }

        Ok(Self { inner })
    }

    pub fn messenger(&self) -> &M {
        &self.inner.messenger
    }

    /// Registers an endpoint here and everywhere else.
    ///
    /// Creating an endpoint that already exists with the same definition
    /// is a no-op.
    ///
    /// # Errors
    /// [`InvokeError::EndpointMismatch`] if it exists with another contract
    /// or kind.
    pub fn create_endpoint(&self, def: EndpointDef) -> Result<(), InvokeError> {
        {
            let mut endpoints = self.inner.endpoints_mut();
            if let Some(existing) = endpoints.get(&def.name) {
                if *existing.def() == def {
                    return Ok(());
                }
                return Err(InvokeError::EndpointMismatch(def.name));
            }
            endpoints.insert(def.name.clone(), Endpoint::spawn(def.clone()));
        }
        tracing::debug!(endpoint = %def.name, contract = %def.contract, kind = ?def.kind, "endpoint created");
        self.inner
            .broadcast(InvocationMessage::EndpointCreated(def));
        self.inner.changed();
        Ok(())
    }

    /// Removes an endpoint here and everywhere else. Returns whether it
    /// existed.
    pub fn destroy_endpoint(&self, name: &str) -> bool {
        if self.inner.endpoints_mut().remove(name).is_none() {
            return false;
        }
        for names in self.inner.implementors_mut().values_mut() {
            names.remove(name);
        }
        tracing::debug!(endpoint = %name, "endpoint destroyed");
        self.inner.broadcast(InvocationMessage::EndpointDestroyed {
            name: name.to_string(),
        });
        self.inner.changed();
        true
    }

    pub fn endpoint_def(&self, name: &str) -> Option<EndpointDef> {
        self.inner.endpoint(name).map(|e| e.def().clone())
    }

    pub(crate) fn endpoint(&self, name: &str) -> Result<Endpoint, InvokeError> {
        self.inner
            .endpoint(name)
            .ok_or_else(|| InvokeError::UnknownEndpoint(name.to_string()))
    }

    /// Adds a local implementor; the first one is announced to the fabric.
    pub(crate) fn add_implementor(&self, name: &str, implementor: Implementor) -> Result<(), InvokeError> {
        let endpoint = self.endpoint(name)?;
        if endpoint.add(implementor) == 1 {
            self.has_implementor_locally(name);
        }
        Ok(())
    }

    fn has_implementor_locally(&self, name: &str) {
        self.inner
            .implementors_mut()
            .entry(self.inner.messenger.local_node())
            .or_default()
            .insert(name.to_string());
        self.inner.broadcast(InvocationMessage::HasImplementor {
            name: name.to_string(),
        });
        self.inner.changed();
    }

    /// Call after removing a local implementor; announces the last one
    /// going away.
    pub(crate) fn implementor_removed(&self, name: &str, remaining: usize) {
        if remaining > 0 {
            return;
        }
        if let Some(names) = self
            .inner
            .implementors_mut()
            .get_mut(&self.inner.messenger.local_node())
        {
            names.remove(name);
        }
        self.inner
            .broadcast(InvocationMessage::NoLongerHasImplementor {
                name: name.to_string(),
            });
        self.inner.changed();
    }

    /// The node that implements `name`, preferring this one.
    pub fn implementor_node(&self, name: &str) -> Option<Node> {
        let local = self.inner.messenger.local_node();
        let table = self.inner.implementors();
        if table.get(&local).is_some_and(|names| names.contains(name)) {
            return Some(local);
        }
        table
            .iter()
            .find(|(_, names)| names.contains(name))
            .map(|(node, _)| node.clone())
    }

    /// Number of implementors registered in this process.
    pub fn local_implementor_count(&self, name: &str) -> usize {
        self.inner.endpoint(name).map_or(0, |e| e.local_count())
    }

    /// Runs a channel call on local subscribers and broadcasts it.
    pub(crate) fn invoke_channel(&self, name: &str, method: &str, call: Vec<u8>) -> Result<(), InvokeError> {
        let endpoint = self.endpoint(name)?;
        endpoint.enqueue(method, call.clone(), None);
        self.inner
            .broadcast(InvocationMessage::Invoke(Invoke {
                endpoint: name.to_string(),
                method: method.to_string(),
                call_id: None,
                need_reply: false,
                call,
            }));
        Ok(())
    }

    /// Sends a remote call to its implementor and waits for the encoded
    /// reply.
    pub(crate) async fn invoke_remote(
        &self,
        name: &str,
        method: &str,
        call: Vec<u8>,
    ) -> Result<Vec<u8>, InvokeError> {
        let endpoint = self.endpoint(name)?;
        if endpoint.local_count() > 0 {
            let (tx, rx) = oneshot::channel();
            endpoint.enqueue(method, call, Some(tx));
            let outcome = self.bounded(rx).await?.map_err(|_| InvokeError::Shutdown)?;
            return outcome_into_reply(name, outcome);
        }

        let dest = self
            .implementor_node(name)
            .ok_or_else(|| InvokeError::RemoteNotFound(name.to_string()))?;
        let call_id = CallId::next();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(
            call_id,
            Pending {
                dest: dest.clone(),
                reply: tx,
            },
        );

        // Checked after registering, so a departure can't slip in between.
        let messenger = &self.inner.messenger;
        if !messenger.is_connected() || !messenger.nodes().contains(&dest) {
            self.inner.pending().remove(&call_id);
            return Err(if messenger.is_connected() {
                InvokeError::ConnectionLost(dest.to_string())
            } else {
                InvokeError::Shutdown
            });
        }

        tracing::trace!(%call_id, endpoint = %name, %method, %dest, "remote call");
        messenger.send(
            Payload::Invocation(InvocationMessage::Invoke(Invoke {
                endpoint: name.to_string(),
                method: method.to_string(),
                call_id: Some(call_id),
                need_reply: true,
                call,
            })),
            &dest,
        );

        let waited = self.bounded(rx).await;
        if waited.is_err() {
            self.inner.pending().remove(&call_id);
        }
        let outcome = waited?.map_err(|_| InvokeError::Shutdown)??;
        outcome_into_reply(name, outcome)
    }

    /// Sends a remote call without waiting for it to run.
    pub(crate) fn notify_remote(&self, name: &str, method: &str, call: Vec<u8>) -> Result<(), InvokeError> {
        let endpoint = self.endpoint(name)?;
        if endpoint.local_count() > 0 {
            endpoint.enqueue(method, call, None);
            return Ok(());
        }
        let dest = self
            .implementor_node(name)
            .ok_or_else(|| InvokeError::RemoteNotFound(name.to_string()))?;
        self.inner.messenger.send(
            Payload::Invocation(InvocationMessage::Invoke(Invoke {
                endpoint: name.to_string(),
                method: method.to_string(),
                call_id: None,
                need_reply: false,
                call,
            })),
            &dest,
        );
        Ok(())
    }

    /// Applies the configured call timeout, if any.
    async fn bounded<F: Future>(&self, future: F) -> Result<F::Output, InvokeError> {
        match self.inner.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| InvokeError::Timeout),
            None => Ok(future.await),
        }
    }

    /// Waits until `ready` holds, rechecking on every registry change.
    /// `None` waits without bound.
    pub(crate) async fn wait_until(
        &self,
        timeout: Option<Duration>,
        ready: impl Fn(&Self) -> bool,
    ) -> Result<(), InvokeError> {
        let mut changes = self.inner.changes.subscribe();
        let closed = self.inner.messenger.closed();
        let wait = async {
            loop {
                if ready(self) {
                    return Ok(());
                }
                tokio::select! {
                    _ = closed.cancelled() => return Err(InvokeError::Shutdown),
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return Err(InvokeError::Shutdown);
                        }
                    }
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| InvokeError::Timeout)?,
            None => wait.await,
        }
    }
}

fn outcome_into_reply(name: &str, outcome: InvocationOutcome) -> Result<Vec<u8>, InvokeError> {
    match outcome {
        InvocationOutcome::Returned(reply) => Ok(reply),
        InvocationOutcome::Failed(failure) => Err(InvokeError::Remote(failure)),
        InvocationOutcome::NotFound => Err(InvokeError::RemoteNotFound(name.to_string())),
    }
}
