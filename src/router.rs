//! Packet router: dispatches application packets by numeric identifier
//! (spec.md §4.C).

use crate::packet::{Packet, PacketIdentifier};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered handler closure. `Ctx` is whatever per-call context the
/// caller wants threaded through (typically a handle back to the
/// connection that received the packet).
pub type Handler<Ctx> = Arc<dyn Fn(Ctx, Packet) -> HandlerFuture + Send + Sync>;

/// Maps packet identifiers to handlers. A slot registered with `None`
/// acts as an explicit ignore — `route` returns `None` without logging
/// an "unknown identifier" diagnostic, since the identifier is known to
/// the router, just deliberately unhandled.
pub struct Router<Ctx> {
    handlers: RwLock<HashMap<PacketIdentifier, Option<Handler<Ctx>>>>,
}

impl<Ctx> Default for Router<Ctx> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<Ctx> Router<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `identifier`. May be called at any time,
    /// concurrently with in-flight `route` calls.
    pub fn register(&self, identifier: PacketIdentifier, handler: Option<Handler<Ctx>>) {
        self.handlers.write().unwrap().insert(identifier, handler);
    }

    /// Look up the handler for `packet`'s identifier and invoke it,
    /// returning its future for the caller to await. Returns `None` if
    /// the slot is registered with an explicit ignore, or if the
    /// identifier is entirely unregistered (logged, not fatal).
    pub fn route(&self, ctx: Ctx, packet: Packet) -> Option<HandlerFuture> {
        let id = packet.identifier();
        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&id).cloned()
        };
        match handler {
            Some(Some(f)) => Some(f(ctx, packet)),
            Some(None) => None,
            None => {
                debug!(identifier = %id, "no handler registered for packet identifier");
                None
            }
        }
    }
}
