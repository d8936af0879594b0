//! Event payloads and the envelopes that carry them.
//!
//! Payloads travel type-erased as `Arc<dyn Event>` so a single log, engine and
//! bus can carry every event type of an application. Dispatch recovers the
//! concrete type through [`EventType`], which is keyed by `TypeId`.
//!
//! Rust has no inheritance, so an event's "base types" are declared explicitly
//! with [`Event::supertypes`]. A supertype can be any `'static` type, including
//! marker structs and trait objects such as `dyn AccountEvent`.

use crate::metadata::EventMetadata;
use crate::types::{StreamId, StreamRevision, Timestamp};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a runtime type, used as the dispatch key for transitions and
/// handlers.
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    /// The identity of `T`. `T` may be unsized, e.g. `dyn MyMarkerTrait`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// The fully qualified type name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The type name without its module path.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        let start = base.rfind("::").map_or(0, |idx| idx + 2);
        &self.name[start..]
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.name).finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Object-safe plumbing implemented for every `PartialEq + Send + Sync` type.
///
/// This is what lets `dyn Event` be downcast, compared structurally and
/// identified at runtime.
pub trait DynEvent: Any + Send + Sync {
    /// Upcast to `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Upcast a shared payload to `Any` for owned downcasting.
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// The concrete type of the payload.
    fn event_type(&self) -> EventType;

    /// Structural equality against another payload of any type.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T> DynEvent for T
where
    T: Any + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn event_type(&self) -> EventType {
        EventType::of::<T>()
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }
}

/// A domain event payload.
///
/// ```rust,ignore
/// trait AccountEvent {}
///
/// #[derive(Debug, PartialEq)]
/// struct Deposited { amount: u64 }
///
/// impl AccountEvent for Deposited {}
///
/// impl Event for Deposited {
///     fn supertypes(&self) -> Vec<EventType> {
///         vec![EventType::of::<dyn AccountEvent>()]
///     }
/// }
/// ```
pub trait Event: DynEvent + fmt::Debug {
    /// Base types this event belongs to, most specific first.
    ///
    /// Handlers registered against any of these types receive the event.
    /// The event's own concrete type must not be listed.
    fn supertypes(&self) -> Vec<EventType> {
        Vec::new()
    }
}

/// The concrete type followed by its declared supertypes, without duplicates.
pub fn lineage(event: &dyn Event) -> Vec<EventType> {
    let concrete = event.event_type();
    let mut types = vec![concrete];
    for supertype in event.supertypes() {
        if !types.contains(&supertype) {
            types.push(supertype);
        }
    }
    types
}

/// An immutable record of one committed event.
#[derive(Clone)]
pub struct EventEnvelope {
    stream_id: StreamId,
    stream_position: StreamRevision,
    timestamp: Timestamp,
    event: Arc<dyn Event>,
    metadata: Option<EventMetadata>,
}

impl EventEnvelope {
    /// Creates an envelope. Logs call this when an event is committed.
    pub fn new(
        stream_id: StreamId,
        stream_position: StreamRevision,
        timestamp: Timestamp,
        event: Arc<dyn Event>,
        metadata: Option<EventMetadata>,
    ) -> Self {
        Self {
            stream_id,
            stream_position,
            timestamp,
            event,
            metadata,
        }
    }

    /// The stream this event belongs to.
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The 0-based position of this event within its stream.
    pub const fn stream_position(&self) -> StreamRevision {
        self.stream_position
    }

    /// When the event was committed.
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The type-erased payload.
    pub fn event(&self) -> &dyn Event {
        self.event.as_ref()
    }

    /// A shared handle to the payload.
    pub fn event_arc(&self) -> Arc<dyn Event> {
        Arc::clone(&self.event)
    }

    /// Optional metadata recorded with the event.
    pub const fn metadata(&self) -> Option<&EventMetadata> {
        self.metadata.as_ref()
    }

    /// The concrete payload type.
    pub fn event_type(&self) -> EventType {
        self.event.as_ref().event_type()
    }

    /// Downcasts the payload.
    pub fn event_as<E: Event>(&self) -> Option<&E> {
        self.event.as_ref().as_any().downcast_ref::<E>()
    }

    /// Whether the payload is exactly `E`.
    pub fn is<E: Event>(&self) -> bool {
        self.event_type() == EventType::of::<E>()
    }
}

impl PartialEq for EventEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id
            && self.stream_position == other.stream_position
            && self.timestamp == other.timestamp
            && self.metadata == other.metadata
            && self.event.as_ref().dyn_eq(other.event.as_ref().as_any())
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("stream_id", &self.stream_id)
            .field("stream_position", &self.stream_position)
            .field("timestamp", &self.timestamp)
            .field("event", &self.event)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// An event produced by business logic that has not been committed yet.
#[derive(Clone)]
pub struct NewEvent {
    /// The payload to commit
    pub event: Arc<dyn Event>,
    /// Metadata to store with the payload
    pub metadata: Option<EventMetadata>,
}

impl NewEvent {
    /// Wraps a payload with no metadata.
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            event: Arc::new(event),
            metadata: None,
        }
    }

    /// Wraps an already shared payload.
    pub fn from_arc(event: Arc<dyn Event>) -> Self {
        Self {
            event,
            metadata: None,
        }
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Mutable metadata, created empty on first access.
    pub fn metadata_mut(&mut self) -> &mut EventMetadata {
        self.metadata.get_or_insert_with(EventMetadata::default)
    }

    /// The concrete payload type.
    pub fn event_type(&self) -> EventType {
        self.event.as_ref().event_type()
    }

    /// Downcasts the payload.
    pub fn event_as<E: Event>(&self) -> Option<&E> {
        self.event.as_ref().as_any().downcast_ref::<E>()
    }

    /// Seals the event into an envelope at the given position.
    pub fn into_envelope(
        self,
        stream_id: StreamId,
        stream_position: StreamRevision,
        timestamp: Timestamp,
    ) -> EventEnvelope {
        EventEnvelope::new(
            stream_id,
            stream_position,
            timestamp,
            self.event,
            self.metadata,
        )
    }
}

impl<E: Event> From<E> for NewEvent {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}

impl fmt::Debug for NewEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewEvent")
            .field("event", &self.event)
            .field("metadata", &self.metadata)
            .finish()
    }
}
