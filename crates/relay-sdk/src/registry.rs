//! C2 — kind-key to handler mapping, built once at startup and read-only
//! thereafter.
//!
//! Rather than dozens of near-duplicate `BuildKindXHandler(store)` factories
//! (the pattern the source this spec describes falls into), handlers are
//! synthesized through a small number of `register_*` constructors that take
//! a validator/mutator pair.

use std::collections::HashMap;
use std::sync::Arc;

use nostr_sdk::prelude::{Event, Kind};
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::store_trait::EventStore;
use crate::wire::ServerMessage;

/// Effect capabilities handed to a kind handler: the event it was invoked
/// with, and a sink for whatever it wants to emit. Modeling these as an
/// explicit context object (rather than ambient globals) makes handlers
/// trivially testable — supply a channel and read back what was sent.
pub struct HandlerCtx<'a> {
    event: &'a Event,
    out: mpsc::UnboundedSender<ServerMessage>,
}

impl<'a> HandlerCtx<'a> {
    pub fn new(event: &'a Event, out: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { event, out }
    }

    pub fn event(&self) -> &Event {
        self.event
    }

    pub fn emit(&self, message: ServerMessage) {
        let _ = self.out.send(message);
    }
}

/// A kind handler: given the event and a store, validates, persists, and
/// reports the outcome through `ctx`. Returns `Ok(true)` if the event was
/// accepted (the dispatch core should then fan it out via `notify`).
pub trait KindHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &HandlerCtx<'_>,
        store: &dyn EventStore,
    ) -> Result<bool, DispatchError>;
}

impl<F> KindHandler for F
where
    F: Fn(&HandlerCtx<'_>, &dyn EventStore) -> Result<bool, DispatchError> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerCtx<'_>, store: &dyn EventStore) -> Result<bool, DispatchError> {
        self(ctx, store)
    }
}

/// Dispatch key: `"kind/<n>"`, `"universal"`, `"filter"`, `"count"`.
pub fn kind_key(kind: Kind) -> String {
    format!("kind/{}", kind.as_u16())
}

pub const UNIVERSAL_KEY: &str = "universal";

/// Process-wide mapping from dispatch key to handler. Registration happens
/// once at startup; lookup is the only operation used during dispatch.
#[derive(Clone, Default)]
pub struct KindRegistry {
    handlers: Arc<HashMap<String, Arc<dyn KindHandler>>>,
}

/// Mutable builder used only during startup; converted into the read-only
/// `KindRegistry` via `build()`.
#[derive(Default)]
pub struct KindRegistryBuilder {
    handlers: HashMap<String, Arc<dyn KindHandler>>,
}

impl KindRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an arbitrary key. Fails loudly on a
    /// duplicate key rather than silently overwriting it (§4.1).
    pub fn register(mut self, key: impl Into<String>, handler: impl KindHandler + 'static) -> Result<Self, DispatchError> {
        let key = key.into();
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::DuplicateHandler(key));
        }
        self.handlers.insert(key, Arc::new(handler));
        Ok(self)
    }

    pub fn register_kind(self, kind: Kind, handler: impl KindHandler + 'static) -> Result<Self, DispatchError> {
        self.register(kind_key(kind), handler)
    }

    pub fn register_universal(self, handler: impl KindHandler + 'static) -> Result<Self, DispatchError> {
        self.register(UNIVERSAL_KEY, handler)
    }

    pub fn build(self) -> KindRegistry {
        KindRegistry { handlers: Arc::new(self.handlers) }
    }
}

impl KindRegistry {
    pub fn builder() -> KindRegistryBuilder {
        KindRegistryBuilder::new()
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn KindHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn get_for_kind(&self, kind: Kind, unlimited_mode: bool) -> Option<Arc<dyn KindHandler>> {
        if unlimited_mode {
            self.get(UNIVERSAL_KEY)
        } else {
            self.get(&kind_key(kind))
        }
    }
}
