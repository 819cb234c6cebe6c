//! Channels: named multicast endpoints.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use spoke_protocol::{Codec, EndpointDef, EndpointKind};

use super::contract::{ChannelContract, ChannelSubscriber};
use super::endpoint::{Implementor, SubscriberFn};
use super::{InvokeError, UnifiedMessenger};
use crate::messenger::Messenger;

/// Typed channel operations over a [`UnifiedMessenger`].
///
/// # Example
///
/// ```rust,ignore
/// let channels = ChannelMessenger::new(unified);
/// channels.create_channel::<Chat>("chat.lobby")?;
/// channels.register_subscriber::<Chat, _>(Arc::new(Printer), "chat.lobby")?;
///
/// let chat = channels.broadcaster::<Chat>("chat.lobby")?;
/// chat.call(ChatCall::Said { from: "alice".into(), text: "hi".into() })?;
/// ```
pub struct ChannelMessenger<M: Messenger> {
    unified: UnifiedMessenger<M>,
}

impl<M: Messenger> Clone for ChannelMessenger<M> {
    fn clone(&self) -> Self {
        Self {
            unified: self.unified.clone(),
        }
    }
}

impl<M: Messenger> ChannelMessenger<M> {
    pub fn new(unified: UnifiedMessenger<M>) -> Self {
        Self { unified }
    }

    pub fn unified(&self) -> &UnifiedMessenger<M> {
        &self.unified
    }

    /// Creates the channel `name` speaking contract `C`, on every process.
    pub fn create_channel<C: ChannelContract>(&self, name: &str) -> Result<(), InvokeError> {
        self.unified.create_endpoint(EndpointDef {
            name: name.to_string(),
            contract: C::NAME.to_string(),
            kind: EndpointKind::Channel,
        })
    }

    pub fn destroy_channel(&self, name: &str) -> bool {
        self.unified.destroy_endpoint(name)
    }

    /// Whether the channel is known here, created locally or elsewhere.
    pub fn has_channel(&self, name: &str) -> bool {
        self.unified
            .endpoint_def(name)
            .is_some_and(|def| def.kind == EndpointKind::Channel)
    }

    pub fn local_subscriber_count(&self, name: &str) -> usize {
        self.unified.local_implementor_count(name)
    }

    /// Subscribes `subscriber` to every call on `name`.
    ///
    /// # Errors
    /// `UnknownEndpoint` if the channel was never created, or
    /// `ContractMismatch` if it speaks another contract.
    pub fn register_subscriber<C, S>(&self, subscriber: Arc<S>, name: &str) -> Result<(), InvokeError>
    where
        C: ChannelContract,
        S: ChannelSubscriber<C>,
    {
        self.check::<C>(name)?;
        let key = Arc::as_ptr(&subscriber) as *const () as usize;
        let codec = self.unified.messenger().codec().clone();
        let channel = name.to_string();
        let sink: SubscriberFn = Arc::new(move |call: &[u8]| match codec.decode::<C::Call>(call) {
            Ok(call) => subscriber.on_call(call),
            Err(e) => tracing::warn!(%channel, error = %e, "undecodable channel call dropped"),
        });
        self.unified
            .add_implementor(name, Implementor::Subscriber { key, sink })
    }

    /// Removes a subscriber added with [`Self::register_subscriber`].
    /// Returns whether it was subscribed.
    pub fn unregister_subscriber<S: ?Sized>(&self, subscriber: &Arc<S>, name: &str) -> bool {
        let key = Arc::as_ptr(subscriber) as *const () as usize;
        let Ok(endpoint) = self.unified.endpoint(name) else {
            return false;
        };
        match endpoint.remove_by_key(key) {
            Some(remaining) => {
                self.unified.implementor_removed(name, remaining);
                true
            }
            None => false,
        }
    }

    /// A proxy that sends calls to every subscriber of `name`.
    ///
    /// Fails fast if the channel is unknown here; see
    /// [`Self::wait_for_channel`] for channels still being created
    /// elsewhere.
    pub fn broadcaster<C: ChannelContract>(&self, name: &str) -> Result<Broadcaster<C, M>, InvokeError> {
        self.check::<C>(name)?;
        Ok(Broadcaster {
            unified: self.unified.clone(),
            name: name.to_string(),
            _contract: PhantomData,
        })
    }

    /// Waits until the channel `name` is known here.
    pub async fn wait_for_channel(&self, name: &str, timeout: Option<Duration>) -> Result<(), InvokeError> {
        self.unified
            .wait_until(timeout, |unified| {
                unified
                    .endpoint_def(name)
                    .is_some_and(|def| def.kind == EndpointKind::Channel)
            })
            .await
    }

    fn check<C: ChannelContract>(&self, name: &str) -> Result<(), InvokeError> {
        let def = self
            .unified
            .endpoint_def(name)
            .ok_or_else(|| InvokeError::UnknownEndpoint(name.to_string()))?;
        if def.kind != EndpointKind::Channel || def.contract != C::NAME {
            return Err(InvokeError::ContractMismatch {
                name: name.to_string(),
                expected: C::NAME.to_string(),
                found: def.contract,
            });
        }
        Ok(())
    }
}

/// Proxy for one channel. Every call reaches every subscriber on the
/// fabric, local ones first.
pub struct Broadcaster<C: ChannelContract, M: Messenger> {
    unified: UnifiedMessenger<M>,
    name: String,
    _contract: PhantomData<fn() -> C>,
}

impl<C: ChannelContract, M: Messenger> Clone for Broadcaster<C, M> {
    fn clone(&self) -> Self {
        Self {
            unified: self.unified.clone(),
            name: self.name.clone(),
            _contract: PhantomData,
        }
    }
}

impl<C: ChannelContract, M: Messenger> Broadcaster<C, M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `call` to every subscriber. Never blocks.
    ///
    /// # Errors
    /// `UnknownEndpoint` if the channel was destroyed, or an encode error.
    pub fn call(&self, call: C::Call) -> Result<(), InvokeError> {
        let encoded = self.unified.messenger().codec().encode(&call)?;
        self.unified
            .invoke_channel(&self.name, C::method(&call), encoded)
    }
}
