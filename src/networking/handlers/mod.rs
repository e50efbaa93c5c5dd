//! Packet handlers and the subscriber registry
//!
//! Feature managers subscribe to a packet type, a capability message name,
//! or to everything (`DispatchKey::Default`). Subscriber lists are
//! copy-on-write: dispatch iterates a snapshot, so a registration made while
//! a packet is being delivered only takes effect for the next one.

use crate::networking::capabilities::llsd::Llsd;
use crate::networking::circuit::Circuit;
use crate::networking::packets::{AnyPacket, Packet, PacketType};
use crate::networking::serialization::PacketFlags;
use crate::networking::NetworkResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// A decoded UDP packet plus the header bits handlers may care about
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub sequence: u32,
    pub flags: PacketFlags,
    pub packet: AnyPacket,
}

/// A message pushed through the capability event queue
#[derive(Debug, Clone, PartialEq)]
pub struct CapsMessage {
    pub name: String,
    pub body: Llsd,
}

/// Anything the dispatcher delivers
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    Packet(IncomingPacket),
    Message(CapsMessage),
}

impl IncomingEvent {
    pub fn name(&self) -> &str {
        match self {
            IncomingEvent::Packet(incoming) => incoming.packet.name(),
            IncomingEvent::Message(message) => &message.name,
        }
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        match self {
            IncomingEvent::Packet(incoming) => DispatchKey::Packet(incoming.packet.packet_type()),
            IncomingEvent::Message(message) => DispatchKey::Message(message.name.clone()),
        }
    }

    pub fn packet(&self) -> Option<&AnyPacket> {
        match self {
            IncomingEvent::Packet(incoming) => Some(&incoming.packet),
            IncomingEvent::Message(_) => None,
        }
    }

    /// The concrete packet, if this event carries a `P`
    pub fn downcast_ref<P: Packet>(&self) -> Option<&P> {
        self.packet()?.downcast_ref::<P>()
    }

    pub fn message(&self) -> Option<&CapsMessage> {
        match self {
            IncomingEvent::Message(message) => Some(message),
            IncomingEvent::Packet(_) => None,
        }
    }
}

/// Inbound queue item: an event and the circuit it arrived on
#[derive(Debug, Clone)]
pub struct Inbound {
    pub circuit: Arc<Circuit>,
    pub event: IncomingEvent,
}

/// What a subscriber listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    /// Every packet and message
    Default,
    Packet(PacketType),
    /// Capability message by name, e.g. `EnableSimulator`
    Message(String),
}

impl From<PacketType> for DispatchKey {
    fn from(packet_type: PacketType) -> Self {
        DispatchKey::Packet(packet_type)
    }
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchKey::Default => f.write_str("<default>"),
            DispatchKey::Packet(packet_type) => write!(f, "{}", packet_type),
            DispatchKey::Message(name) => write!(f, "message {}", name),
        }
    }
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Async packet handler trait
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Handle one event. Errors are logged by the dispatcher and never reach
    /// the sender.
    async fn handle(&self, event: &IncomingEvent, circuit: &Arc<Circuit>) -> NetworkResult<()>;

    /// Handler name for logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapts an async closure to [`PacketHandler`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> PacketHandler for FnHandler<F>
where
    F: Fn(IncomingEvent, Arc<Circuit>) -> Fut + Send + Sync,
    Fut: Future<Output = NetworkResult<()>> + Send,
{
    async fn handle(&self, event: &IncomingEvent, circuit: &Arc<Circuit>) -> NetworkResult<()> {
        (self.f)(event.clone(), Arc::clone(circuit)).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
struct Subscriber {
    id: HandlerId,
    handler: Arc<dyn PacketHandler>,
}

/// Packet handler registry
pub struct PacketHandlerRegistry {
    subscribers: RwLock<HashMap<DispatchKey, Arc<Vec<Subscriber>>>>,
    next_id: AtomicU64,
}

impl Default for PacketHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHandlerRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler; it runs after those already registered for `key`
    pub fn register(&self, key: DispatchKey, handler: Arc<dyn PacketHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Registering handler '{}' for {}", handler.name(), key);

        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let list = subscribers.entry(key).or_default();
        let mut updated = Vec::with_capacity(list.len() + 1);
        updated.extend(list.iter().cloned());
        updated.push(Subscriber { id, handler });
        *list = Arc::new(updated);
        id
    }

    /// Remove a handler. Returns false if it was not registered for `key`.
    pub fn unregister(&self, key: &DispatchKey, id: HandlerId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(key) else {
            return false;
        };
        if !list.iter().any(|s| s.id == id) {
            return false;
        }
        let remaining: Vec<Subscriber> = list.iter().filter(|s| s.id != id).cloned().collect();
        if remaining.is_empty() {
            subscribers.remove(key);
        } else {
            *list = Arc::new(remaining);
        }
        true
    }

    pub fn handler_count(&self, key: &DispatchKey) -> usize {
        self.snapshot(key).len()
    }

    fn snapshot(&self, key: &DispatchKey) -> Arc<Vec<Subscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver one event: default subscribers first, then the ones for its
    /// type, each in registration order. A failing or panicking handler is
    /// logged and delivery continues. Returns false when nothing was
    /// registered for the event's own type.
    pub async fn dispatch(&self, inbound: Inbound) -> bool {
        let key = inbound.event.dispatch_key();
        let defaults = self.snapshot(&DispatchKey::Default);
        let specific = self.snapshot(&key);
        let handled = !specific.is_empty();

        if !handled && !is_circuit_control(&key) {
            debug!("Unhandled {} from {}", key, inbound.circuit.address());
        }

        let event = Arc::new(inbound.event);
        for subscriber in defaults.iter().chain(specific.iter()) {
            let handler = Arc::clone(&subscriber.handler);
            let event = Arc::clone(&event);
            let circuit = Arc::clone(&inbound.circuit);
            let name = handler.name().to_string();

            let result = tokio::spawn(async move { handler.handle(&event, &circuit).await }).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Handler '{}' failed on {}: {}", name, key, e),
                Err(e) if e.is_panic() => error!("Handler '{}' panicked on {}", name, key),
                Err(e) => info!("Handler '{}' cancelled on {}: {}", name, key, e),
            }
        }
        handled
    }
}

/// Types the circuit consumes itself; no subscriber is expected for them
fn is_circuit_control(key: &DispatchKey) -> bool {
    matches!(
        key,
        DispatchKey::Packet(PacketType::PacketAck | PacketType::StartPingCheck | PacketType::CompletePingCheck)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl PacketHandler for Nop {
        async fn handle(&self, _event: &IncomingEvent, _circuit: &Arc<Circuit>) -> NetworkResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = PacketHandlerRegistry::new();
        let key = DispatchKey::from(PacketType::UUIDNameReply);

        let first = registry.register(key.clone(), Arc::new(Nop));
        let second = registry.register(key.clone(), Arc::new(Nop));
        assert_ne!(first, second);
        assert_eq!(registry.handler_count(&key), 2);

        assert!(registry.unregister(&key, first));
        assert!(!registry.unregister(&key, first));
        assert_eq!(registry.handler_count(&key), 1);

        assert!(registry.unregister(&key, second));
        assert_eq!(registry.handler_count(&key), 0);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_registration() {
        let registry = PacketHandlerRegistry::new();
        registry.register(DispatchKey::Default, Arc::new(Nop));

        let snapshot = registry.snapshot(&DispatchKey::Default);
        registry.register(DispatchKey::Default, Arc::new(Nop));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.handler_count(&DispatchKey::Default), 2);
    }

    #[test]
    fn test_message_keys_are_by_name() {
        let registry = PacketHandlerRegistry::new();
        registry.register(DispatchKey::Message("EnableSimulator".into()), Arc::new(Nop));
        assert_eq!(registry.handler_count(&DispatchKey::Message("EnableSimulator".into())), 1);
        assert_eq!(registry.handler_count(&DispatchKey::Message("TeleportFinish".into())), 0);
    }
}
