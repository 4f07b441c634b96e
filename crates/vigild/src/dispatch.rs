//! Protocol-id dispatch — routes received messages to the poll/vote layer.
//!
//! The transport does not interpret payloads; collaborators register a
//! handler per protocol id and receive de-duplicated, in-order messages.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};

use vigil_core::message::PeerMessage;

pub type Handler<M> = Arc<dyn Fn(M) + Send + Sync>;

/// Maps protocol ids to handlers and dispatches incoming messages.
pub struct HandlerRegistry<M> {
    handlers: RwLock<HashMap<u32, Handler<M>>>,
}

impl<M> HandlerRegistry<M> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler. A protocol id can only be claimed once.
    pub fn register(&self, protocol: u32, handler: Handler<M>) -> anyhow::Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&protocol) {
            anyhow::bail!("protocol {protocol} already registered");
        }
        handlers.insert(protocol, handler);
        Ok(())
    }

    pub fn unregister(&self, protocol: u32) {
        self.handlers.write().unwrap().remove(&protocol);
    }

    /// Dispatch a message. Returns false if no handler claims the
    /// protocol id.
    pub fn dispatch(&self, protocol: u32, msg: M) -> bool {
        let handler = self.handlers.read().unwrap().get(&protocol).cloned();
        match handler {
            Some(handler) => {
                handler(msg);
                true
            }
            None => false,
        }
    }
}

impl<M> Default for HandlerRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains the channel pool's receive queue into the stream registry.
pub async fn run_stream_dispatcher(
    mut rx: mpsc::UnboundedReceiver<PeerMessage>,
    registry: Arc<HandlerRegistry<PeerMessage>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("stream dispatcher shutting down");
                return;
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { return };
                let protocol = msg.protocol();
                if !registry.dispatch(protocol, msg) {
                    tracing::warn!(protocol, "received message with unregistered protocol");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatches_to_registered_handler() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        registry
            .register(7, Arc::new(move |v| {
                assert_eq!(v, 42);
                hits2.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert!(registry.dispatch(7, 42));
        assert!(!registry.dispatch(8, 42));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        registry.register(1, Arc::new(|_| {})).unwrap();
        assert!(registry.register(1, Arc::new(|_| {})).is_err());
        registry.unregister(1);
        assert!(registry.register(1, Arc::new(|_| {})).is_ok());
    }
}
