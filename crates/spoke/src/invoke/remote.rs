//! Remotes: named objects with exactly one implementor on the fabric.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use spoke_protocol::{Codec, EndpointDef, EndpointKind, InvocationOutcome, RemoteFailure};

use super::contract::{RemoteContract, RemoteImplementor};
use super::endpoint::{Implementor, RemoteFn};
use super::{InvokeError, UnifiedMessenger};
use crate::messenger::Messenger;

/// Typed remote operations over a [`UnifiedMessenger`].
pub struct RemoteMessenger<M: Messenger> {
    unified: UnifiedMessenger<M>,
}

impl<M: Messenger> Clone for RemoteMessenger<M> {
    fn clone(&self) -> Self {
        Self {
            unified: self.unified.clone(),
        }
    }
}

impl<M: Messenger> RemoteMessenger<M> {
    pub fn new(unified: UnifiedMessenger<M>) -> Self {
        Self { unified }
    }

    pub fn unified(&self) -> &UnifiedMessenger<M> {
        &self.unified
    }

    /// Makes `implementor` the object behind `name`, creating the remote
    /// if needed.
    ///
    /// # Errors
    /// `AlreadyRegistered` if this process already implements `name`;
    /// `EndpointMismatch` if `name` exists with another contract or as a
    /// channel.
    pub fn register_remote<C, I>(&self, implementor: Arc<I>, name: &str) -> Result<(), InvokeError>
    where
        C: RemoteContract,
        I: RemoteImplementor<C>,
    {
        self.unified.create_endpoint(EndpointDef {
            name: name.to_string(),
            contract: C::NAME.to_string(),
            kind: EndpointKind::Remote,
        })?;
        if self.unified.local_implementor_count(name) > 0 {
            return Err(InvokeError::AlreadyRegistered(name.to_string()));
        }

        let codec = self.unified.messenger().codec().clone();
        let handler: RemoteFn = Arc::new(move |call: Vec<u8>| -> BoxFuture<'static, InvocationOutcome> {
            let implementor = Arc::clone(&implementor);
            let codec = codec.clone();
            Box::pin(async move {
                let call: C::Call = match codec.decode(&call) {
                    Ok(call) => call,
                    Err(e) => return InvocationOutcome::Failed(RemoteFailure::new(e.to_string())),
                };
                match implementor.invoke(call).await {
                    Ok(reply) => match codec.encode(&reply) {
                        Ok(bytes) => InvocationOutcome::Returned(bytes),
                        Err(e) => InvocationOutcome::Failed(RemoteFailure::new(e.to_string())),
                    },
                    Err(failure) => InvocationOutcome::Failed(failure),
                }
            })
        });

        tracing::debug!(remote = %name, contract = C::NAME, "remote registered");
        self.unified
            .add_implementor(name, Implementor::Remote { handler })
    }

    /// Drops this process's implementor for `name`. Calls still in flight
    /// fail with `RemoteNotFound`.
    pub fn unregister_remote(&self, name: &str) -> bool {
        let Ok(endpoint) = self.unified.endpoint(name) else {
            return false;
        };
        if endpoint.clear_remotes() == 0 {
            return false;
        }
        self.unified
            .implementor_removed(name, endpoint.local_count());
        true
    }

    /// Whether some process on the fabric implements `name`.
    pub fn has_implementor(&self, name: &str) -> bool {
        self.unified.implementor_node(name).is_some()
    }

    /// A proxy for the remote `name`.
    ///
    /// # Errors
    /// `UnknownEndpoint` or `ContractMismatch`, checked right away.
    pub fn remote<C: RemoteContract>(&self, name: &str) -> Result<RemoteProxy<C, M>, InvokeError> {
        let def = self
            .unified
            .endpoint_def(name)
            .ok_or_else(|| InvokeError::UnknownEndpoint(name.to_string()))?;
        if def.kind != EndpointKind::Remote || def.contract != C::NAME {
            return Err(InvokeError::ContractMismatch {
                name: name.to_string(),
                expected: C::NAME.to_string(),
                found: def.contract,
            });
        }
        Ok(RemoteProxy {
            unified: self.unified.clone(),
            name: name.to_string(),
            _contract: PhantomData,
        })
    }

    /// Waits until some process implements `name`.
    pub async fn wait_for_remote(&self, name: &str, timeout: Option<Duration>) -> Result<(), InvokeError> {
        self.unified
            .wait_until(timeout, |unified| unified.implementor_node(name).is_some())
            .await
    }
}

/// Proxy for one remote.
pub struct RemoteProxy<C: RemoteContract, M: Messenger> {
    unified: UnifiedMessenger<M>,
    name: String,
    _contract: PhantomData<fn() -> C>,
}

impl<C: RemoteContract, M: Messenger> Clone for RemoteProxy<C, M> {
    fn clone(&self) -> Self {
        Self {
            unified: self.unified.clone(),
            name: self.name.clone(),
            _contract: PhantomData,
        }
    }
}

impl<C: RemoteContract, M: Messenger> RemoteProxy<C, M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `call` on the implementor and returns its reply.
    ///
    /// # Errors
    /// - `Remote` if the implementor ran and failed
    /// - `RemoteNotFound` if nobody implements the remote
    /// - `ConnectionLost`, `Shutdown` or `Timeout` if the reply never came
    pub async fn call(&self, call: C::Call) -> Result<C::Reply, InvokeError> {
        let codec = self.unified.messenger().codec();
        let encoded = codec.encode(&call)?;
        let reply = self
            .unified
            .invoke_remote(&self.name, C::method(&call), encoded)
            .await?;
        Ok(codec.decode(&reply)?)
    }

    /// Sends `call` without waiting for it to run. The reply, if any, is
    /// discarded.
    pub fn notify(&self, call: C::Call) -> Result<(), InvokeError> {
        let encoded = self.unified.messenger().codec().encode(&call)?;
        self.unified
            .notify_remote(&self.name, C::method(&call), encoded)
    }
}
