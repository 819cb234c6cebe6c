//! Endpoint actor: dispatches one endpoint's local calls.
//!
//! Every endpoint known to a messenger has a handle in the registry and a
//! Tokio task behind it. Calls, whether from a local proxy or from the
//! network, are queued to the task in arrival order. Channel calls run one
//! after another on the actor, so every subscriber sees them in the order
//! they arrived. Remote calls are started in that order but each runs in
//! its own task, so one that waits (on a timer, or on another remote call
//! that leads back here) never stalls the callers queued behind it.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use spoke_protocol::{EndpointDef, EndpointKind, InvocationOutcome};
use tokio::sync::{mpsc, oneshot};

/// Hands a channel call to one subscriber.
pub(crate) type SubscriberFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Runs a remote call on the local implementor.
pub(crate) type RemoteFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, InvocationOutcome> + Send + Sync>;

/// A local object behind an endpoint.
#[derive(Clone)]
pub(crate) enum Implementor {
    Subscriber {
        /// Data pointer of the registered `Arc`, used to unregister it.
        key: usize,
        sink: SubscriberFn,
    },
    Remote { handler: RemoteFn },
}

impl Implementor {
    fn key(&self) -> Option<usize> {
        match self {
            Implementor::Subscriber { key, .. } => Some(*key),
            Implementor::Remote { .. } => None,
        }
    }
}

/// A call queued to the actor.
struct Job {
    method: String,
    call: Vec<u8>,
    reply: Option<oneshot::Sender<InvocationOutcome>>,
}

/// Handle to a running endpoint actor. Cheap to clone.
///
/// The actor stops once every handle is gone.
#[derive(Clone)]
pub(crate) struct Endpoint {
    def: EndpointDef,
    implementors: Arc<Mutex<Vec<Implementor>>>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Endpoint {
    /// Starts the actor for `def`. Needs a Tokio runtime.
    pub(crate) fn spawn(def: EndpointDef) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let implementors = Arc::new(Mutex::new(Vec::new()));
        let actor = EndpointActor {
            name: def.name.clone(),
            kind: def.kind,
            implementors: Arc::clone(&implementors),
            receiver,
        };
        tokio::spawn(actor.run());
        Self {
            def,
            implementors,
            jobs,
        }
    }

    pub(crate) fn def(&self) -> &EndpointDef {
        &self.def
    }

    fn implementors(&self) -> MutexGuard<'_, Vec<Implementor>> {
        self.implementors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a call. `reply` gets the outcome once it has run.
    pub(crate) fn enqueue(
        &self,
        method: impl Into<String>,
        call: Vec<u8>,
        reply: Option<oneshot::Sender<InvocationOutcome>>,
    ) {
        let job = Job {
            method: method.into(),
            call,
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            if let Some(reply) = job.reply {
                let _ = reply.send(InvocationOutcome::NotFound);
            }
        }
    }

    /// Adds an implementor and returns how many there are now.
    pub(crate) fn add(&self, implementor: Implementor) -> usize {
        let mut implementors = self.implementors();
        implementors.push(implementor);
        implementors.len()
    }

    /// Removes the subscriber registered from the `Arc` at `key`. Returns
    /// the remaining count, or `None` if it was not registered.
    pub(crate) fn remove_by_key(&self, key: usize) -> Option<usize> {
        let mut implementors = self.implementors();
        let pos = implementors.iter().position(|i| i.key() == Some(key))?;
        implementors.remove(pos);
        Some(implementors.len())
    }

    /// Removes every remote implementor. Returns how many were removed.
    pub(crate) fn clear_remotes(&self) -> usize {
        let mut implementors = self.implementors();
        let before = implementors.len();
        implementors.retain(|i| !matches!(i, Implementor::Remote { .. }));
        before - implementors.len()
    }

    pub(crate) fn local_count(&self) -> usize {
        self.implementors().len()
    }
}

struct EndpointActor {
    name: String,
    kind: EndpointKind,
    implementors: Arc<Mutex<Vec<Implementor>>>,
    receiver: mpsc::UnboundedReceiver<Job>,
}

impl EndpointActor {
    async fn run(mut self) {
        tracing::debug!(endpoint = %self.name, kind = ?self.kind, "endpoint actor started");

        while let Some(job) = self.receiver.recv().await {
            // Snapshot so implementors may (un)register from inside a call.
            let implementors = self
                .implementors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();

            match self.kind {
                EndpointKind::Channel => {
                    for implementor in &implementors {
                        if let Implementor::Subscriber { sink, .. } = implementor {
                            sink(&job.call);
                        }
                    }
                    if let Some(reply) = job.reply {
                        let _ = reply.send(InvocationOutcome::Returned(Vec::new()));
                    }
                }
                EndpointKind::Remote => {
                    let handler = implementors.iter().find_map(|i| match i {
                        Implementor::Remote { handler, .. } => Some(Arc::clone(handler)),
                        Implementor::Subscriber { .. } => None,
                    });
                    match handler {
                        // Remote calls run concurrently: a slow or re-entrant
                        // call must not hold up the queue behind it.
                        Some(handler) => {
                            tokio::spawn(async move {
                                let outcome = handler(job.call).await;
                                if let Some(reply) = job.reply {
                                    let _ = reply.send(outcome);
                                }
                            });
                        }
                        None => {
                            tracing::debug!(endpoint = %self.name, method = %job.method, "no local implementor");
                            if let Some(reply) = job.reply {
                                let _ = reply.send(InvocationOutcome::NotFound);
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(endpoint = %self.name, "endpoint actor stopped");
    }
}
