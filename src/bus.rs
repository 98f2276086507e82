//! Process-wide event bus.
//!
//! Two kinds of events live here. Lifecycle and application events
//! (`exit`, `listen.router.init`, the user-extendable `mws.*` family) are
//! named and carry a JSON payload. Request-phase events
//! (`request.middleware`, `request.streamer`, `request.state`,
//! `request.handle`, `request.fallback`) carry the mutable [`RequestState`]
//! and are stored as typed hook lists, one per phase.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::error::SendError;
use crate::state::{Flow, RequestState};

/// Well-known event names.
pub mod events {
    /// Graceful shutdown: listeners close, SSE streams end.
    pub const EXIT: &str = "exit";
    /// Emitted once after every listener is bound and the route tree is frozen.
    pub const LISTEN_ROUTER_INIT: &str = "listen.router.init";
    /// Prefix for application-defined events.
    pub const MWS_PREFIX: &str = "mws.";
}

/// The request-phase hooks, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    /// Before matching; may short-circuit by sending a response.
    Middleware,
    /// After the raw request is parsed, before the state is matched.
    Streamer,
    /// After the state is constructed; collaborators attach session info here.
    State,
    /// After a route matched, before its handlers run.
    Handle,
    /// No route matched; may send a response before the default 404.
    Fallback,
}

type EventFuture = Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>>;

/// Handler for a named event. Receives the emitted JSON payload.
pub type EventHandler = Arc<dyn Fn(serde_json::Value) -> EventFuture + Send + Sync>;

/// Future returned by a request-phase hook, borrowing the state it works on.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, SendError>> + Send + 'a>>;

/// Handler for a request-phase hook.
pub type RequestHook = Arc<dyn for<'a> Fn(&'a mut RequestState) -> HookFuture<'a> + Send + Sync>;

/// Token returned by [`EventBus::on`]; pass it to [`EventBus::off`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    id: u64,
}

/// Named, typed, awaitable event registry shared by the whole process.
pub struct EventBus {
    next_id: AtomicU64,
    named: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    request_hooks: RwLock<HashMap<RequestPhase, Vec<RequestHook>>>,
    exit_tx: broadcast::Sender<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (exit_tx, _) = broadcast::channel(8);
        Self {
            next_id: AtomicU64::new(1),
            named: RwLock::new(HashMap::new()),
            request_hooks: RwLock::new(HashMap::new()),
            exit_tx,
        }
    }

    /// Registers a handler for a named event and returns its subscription.
    pub fn on(&self, name: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut named = self.named.write().expect("event registry poisoned");
        named
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            name: name.to_string(),
            id,
        }
    }

    /// Removes a previously registered handler.
    pub fn off(&self, subscription: &Subscription) {
        let mut named = self.named.write().expect("event registry poisoned");
        if let Some(handlers) = named.get_mut(&subscription.name) {
            handlers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Registers a typed hook for one of the request phases.
    pub fn on_request(&self, phase: RequestPhase, hook: RequestHook) {
        let mut hooks = self.request_hooks.write().expect("hook registry poisoned");
        hooks.entry(phase).or_default().push(hook);
    }

    /// Snapshot of the hooks for a phase, in registration order.
    pub fn request_hooks(&self, phase: RequestPhase) -> Vec<RequestHook> {
        let hooks = self.request_hooks.read().expect("hook registry poisoned");
        hooks.get(&phase).cloned().unwrap_or_default()
    }

    /// Fire-and-forget emission. Handlers still run serially with each other.
    pub fn emit(self: &Arc<Self>, name: &str, payload: serde_json::Value) {
        let bus = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(err) = bus.emit_async(&name, payload).await {
                tracing::error!(event = %name, error = %err, "event handlers failed");
            }
        });
    }

    /// Awaits each handler serially. Handler errors do not abort the rest;
    /// they are aggregated into a single composite failure which is logged
    /// and returned so callers may rethrow it explicitly.
    pub async fn emit_async(&self, name: &str, payload: serde_json::Value) -> Result<(), SendError> {
        if name == events::EXIT {
            // Wake channel subscribers (listeners, SSE streams) before the
            // named handlers run, so accept loops stop taking new work.
            let _ = self.exit_tx.send(());
        }

        let handlers: Vec<EventHandler> = {
            let named = self.named.read().expect("event registry poisoned");
            named
                .get(name)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(err) = handler(payload.clone()).await {
                failures.push(err.to_json());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let composite = SendError::internal(format!(
                "{} handler(s) for '{}' failed",
                failures.len(),
                name
            ))
            .with_details(serde_json::Value::Array(failures));
            tracing::error!(event = %name, error = %composite, "emit_async aggregated failures");
            Err(composite)
        }
    }

    /// A receiver that resolves when the `exit` event fires.
    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Resolves once the `exit` event has fired.
    pub async fn wait_exit(&self) {
        let mut rx = self.subscribe_exit();
        let _ = rx.recv().await;
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let named = self.named.read().expect("event registry poisoned");
        f.debug_struct("EventBus")
            .field("events", &named.keys().collect::<Vec<_>>())
            .finish()
    }
}
