//! Peer — a named mailbox living on one host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use distribus_core::BusError;

/// Event emitted when a message is delivered to a peer.
pub const MESSAGE: &str = "message";

/// Callback invoked as `listener(sender, message)`.
pub type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Routing function supplied by the owning host: `route(from, to, message)`.
pub type Route = Arc<dyn Fn(String, String, Value) -> BoxFuture<'static, Result<(), BusError>> + Send + Sync>;

pub struct Peer {
    id: String,
    route: Route,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}

impl Peer {
    pub fn new(id: impl Into<String>, route: Route) -> Self {
        Self {
            id: id.into(),
            route,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send a message to another peer, wherever it lives.
    ///
    /// Resolves with `Ok(())` once the host confirms delivery; see
    /// [`Host::send`](crate::Host::send) for the failure cases.
    pub async fn send(&self, to: impl Into<String>, message: Value) -> Result<(), BusError> {
        (self.route)(self.id.clone(), to.into(), message).await
    }

    /// Register a listener. Listeners of one event run in registration order.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke every listener of `event` with `(sender, message)`.
    ///
    /// Runs on a snapshot of the listener list, so a listener may register
    /// further listeners without deadlocking; those run from the next emit.
    pub fn emit(&self, event: &str, sender: &str, message: &Value) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener(sender, message);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }
}
