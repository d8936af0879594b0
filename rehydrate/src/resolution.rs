//! Resolution of the handlers that apply to an event.
//!
//! For a concrete event type the registry walks the event's lineage (the
//! concrete type, then each declared supertype), collects the handlers
//! declared against each of those types, appends catch-all handlers, drops
//! repeated handler ids and orders the result by priority. Registration order
//! breaks priority ties.
//!
//! The result depends only on the concrete type, so it is computed once per
//! type and memoized. Registering a handler invalidates every cached result.

use crate::event::{lineage, Event, EventEnvelope, EventType};
use crate::handler::{EventHandler, HandlerId};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The ordered, deduplicated handlers for one concrete event type.
pub struct HandlerCollection {
    event_type: EventType,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerCollection {
    /// The concrete type this collection was resolved for.
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Handlers in invocation order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EventHandler>> {
        self.handlers.iter()
    }

    /// Handler ids in invocation order.
    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers.iter().map(|handler| handler.id()).collect()
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler applies.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCollection")
            .field("event_type", &self.event_type)
            .field("handlers", &self.ids())
            .finish()
    }
}

/// Registered handlers plus a per-type resolution cache.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    resolved: RwLock<HashMap<TypeId, Arc<HandlerCollection>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler.
    pub fn register(&self, handler: impl EventHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    /// Adds a shared handler.
    pub fn register_arc(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        debug!(
            handler = %handler.id(),
            event_type = ?handler.event_type(),
            priority = handler.priority(),
            "registering event handler"
        );
        handlers.push(handler);
        self.resolved.write().clear();
    }

    /// Adds a handler, builder style.
    #[must_use]
    pub fn with(self, handler: impl EventHandler + 'static) -> Self {
        self.register(handler);
        self
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// The handlers for `envelope`'s payload.
    pub fn resolve(&self, envelope: &EventEnvelope) -> Arc<HandlerCollection> {
        self.resolve_type(envelope.event())
    }

    /// The handlers for `event`'s concrete type.
    pub fn resolve_type(&self, event: &dyn Event) -> Arc<HandlerCollection> {
        let event_type = event.event_type();
        if let Some(collection) = self.resolved.read().get(&event_type.id()) {
            return Arc::clone(collection);
        }

        let handlers = self.handlers.read();
        let collection = Arc::new(Self::build(event_type, &lineage(event), &handlers));
        debug!(
            event_type = event_type.short_name(),
            handlers = collection.len(),
            "resolved handler collection"
        );
        // Insert while still holding `handlers` so a concurrent registration
        // cannot be overwritten by this now stale result.
        Arc::clone(
            self.resolved
                .write()
                .entry(event_type.id())
                .or_insert(collection),
        )
    }

    fn build(
        event_type: EventType,
        lineage: &[EventType],
        handlers: &[Arc<dyn EventHandler>],
    ) -> HandlerCollection {
        let specific = lineage.iter().flat_map(|declared| {
            handlers
                .iter()
                .enumerate()
                .filter(move |(_, h)| h.event_type().as_ref() == Some(declared))
        });
        let catch_all = handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.event_type().is_none());

        let mut seen = HashSet::new();
        let mut selected: Vec<(usize, &Arc<dyn EventHandler>)> = specific
            .chain(catch_all)
            .filter(|(_, h)| seen.insert(h.id()))
            .collect();
        selected.sort_by_key(|(order, h)| (h.priority(), *order));

        HandlerCollection {
            event_type,
            handlers: selected.into_iter().map(|(_, h)| Arc::clone(h)).collect(),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .field("resolved_types", &self.resolved.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;

    trait Shipping {}

    #[derive(Debug, PartialEq)]
    struct Dispatched;
    impl Shipping for Dispatched {}
    impl Event for Dispatched {
        fn supertypes(&self) -> Vec<EventType> {
            vec![EventType::of::<dyn Shipping>()]
        }
    }

    #[derive(Debug, PartialEq)]
    struct Cancelled;
    impl Event for Cancelled {}

    fn on<T: ?Sized + 'static>(id: &str, priority: i32) -> FnHandler {
        FnHandler::on::<T, _, _>(id, |_, _| async { Ok(()) }).with_priority(priority)
    }

    fn any(id: &str, priority: i32) -> FnHandler {
        FnHandler::catch_all(id, |_, _| async { Ok(()) }).with_priority(priority)
    }

    fn ids(collection: &HandlerCollection) -> Vec<String> {
        collection.iter().map(|h| h.id().to_string()).collect()
    }

    #[test]
    fn handlers_are_ordered_by_priority() {
        let registry = HandlerRegistry::new()
            .with(on::<Dispatched>("twenty", 20))
            .with(on::<Dispatched>("five", 5))
            .with(on::<Dispatched>("ten", 10));

        assert_eq!(ids(&registry.resolve_type(&Dispatched)), ["five", "ten", "twenty"]);
    }

    #[test]
    fn ties_keep_registration_order() {
        let registry = HandlerRegistry::new()
            .with(any("audit", 0))
            .with(on::<dyn Shipping>("base", 0))
            .with(on::<Dispatched>("exact", 0));

        assert_eq!(
            ids(&registry.resolve_type(&Dispatched)),
            ["audit", "base", "exact"]
        );
    }

    #[test]
    fn handler_registered_for_type_and_base_runs_once() {
        let registry = HandlerRegistry::new()
            .with(on::<dyn Shipping>("notify", 1))
            .with(on::<Dispatched>("notify", 7))
            .with(any("notify", 9));

        let collection = registry.resolve_type(&Dispatched);
        assert_eq!(ids(&collection), ["notify"]);
        // The concrete-type registration is encountered first.
        assert_eq!(collection.iter().next().map(|h| h.priority()), Some(7));
    }

    #[test]
    fn unrelated_types_only_see_catch_alls() {
        let registry = HandlerRegistry::new()
            .with(on::<dyn Shipping>("base", 0))
            .with(any("audit", 0));

        assert_eq!(ids(&registry.resolve_type(&Cancelled)), ["audit"]);
    }

    #[test]
    fn resolution_is_memoized_per_type() {
        let registry = HandlerRegistry::new().with(any("audit", 0));
        let first = registry.resolve_type(&Dispatched);
        let second = registry.resolve_type(&Dispatched);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn registration_invalidates_cache() {
        let registry = HandlerRegistry::new().with(any("audit", 0));
        assert_eq!(registry.resolve_type(&Dispatched).len(), 1);

        registry.register(on::<Dispatched>("late", 0));
        assert_eq!(ids(&registry.resolve_type(&Dispatched)), ["audit", "late"]);
    }
}
