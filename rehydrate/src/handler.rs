//! Event handlers run by the dispatch bus.

use crate::errors::BoxError;
use crate::event::{lineage, EventEnvelope, EventType};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stable identity of a handler, used for deduplication.
///
/// Registering two handlers with the same id (for example once against an
/// event's concrete type and once against one of its supertypes) makes the
/// second registration redundant for events matching both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(Arc<str>);

impl HandlerId {
    /// Creates an id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HandlerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Reacts to committed events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used for deduplication and in errors.
    fn id(&self) -> HandlerId;

    /// The type this handler is declared against, `None` for a catch-all.
    ///
    /// May be a concrete event type or any supertype an event declares.
    fn event_type(&self) -> Option<EventType>;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether the handler applies to `envelope`.
    ///
    /// The dispatch bus does not call this: [`HandlerRegistry`](crate::resolution::HandlerRegistry)
    /// already applies the same lineage rule when it resolves handlers.
    fn can_handle(&self, envelope: &EventEnvelope) -> bool {
        self.event_type()
            .map_or(true, |declared| lineage(envelope.event()).contains(&declared))
    }

    /// Processes one event.
    async fn handle(&self, envelope: &EventEnvelope, cancel: &CancellationToken) -> Result<(), BoxError>;
}

type HandlerFn =
    Arc<dyn Fn(EventEnvelope, CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// An [`EventHandler`] backed by an async closure.
///
/// ```rust,ignore
/// let audit = FnHandler::on::<dyn AccountEvent, _, _>("audit", |envelope, _| async move {
///     println!("{}", envelope.event_type());
///     Ok(())
/// })
/// .with_priority(100);
/// ```
#[derive(Clone)]
pub struct FnHandler {
    id: HandlerId,
    event_type: Option<EventType>,
    priority: i32,
    f: HandlerFn,
}

impl FnHandler {
    /// A handler for `T`, which may be a concrete event or a supertype.
    pub fn on<T, F, Fut>(id: impl Into<HandlerId>, f: F) -> Self
    where
        T: ?Sized + 'static,
        F: Fn(EventEnvelope, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(id, Some(EventType::of::<T>()), f)
    }

    /// A handler for every event.
    pub fn catch_all<F, Fut>(id: impl Into<HandlerId>, f: F) -> Self
    where
        F: Fn(EventEnvelope, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(id, None, f)
    }

    fn new<F, Fut>(id: impl Into<HandlerId>, event_type: Option<EventType>, f: F) -> Self
    where
        F: Fn(EventEnvelope, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            event_type,
            priority: 0,
            f: Arc::new(move |envelope, cancel| f(envelope, cancel).boxed()),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn id(&self) -> HandlerId {
        self.id.clone()
    }

    fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle(&self, envelope: &EventEnvelope, cancel: &CancellationToken) -> Result<(), BoxError> {
        (self.f)(envelope.clone(), cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::types::{StreamId, StreamRevision, Timestamp};

    trait Billing {}

    #[derive(Debug, PartialEq)]
    struct Invoiced;
    impl Billing for Invoiced {}
    impl Event for Invoiced {
        fn supertypes(&self) -> Vec<EventType> {
            vec![EventType::of::<dyn Billing>()]
        }
    }

    #[derive(Debug, PartialEq)]
    struct Shipped;
    impl Event for Shipped {}

    fn envelope(event: impl Event) -> EventEnvelope {
        EventEnvelope::new(
            StreamId::try_new("order-1").unwrap(),
            StreamRevision::initial(),
            Timestamp::now(),
            Arc::new(event),
            None,
        )
    }

    fn noop(id: &str) -> FnHandler {
        FnHandler::catch_all(id, |_, _| async { Ok(()) })
    }

    #[test]
    fn can_handle_follows_declared_lineage() {
        let exact = FnHandler::on::<Invoiced, _, _>("exact", |_, _| async { Ok(()) });
        let base = FnHandler::on::<dyn Billing, _, _>("base", |_, _| async { Ok(()) });
        let any = noop("any");

        assert!(exact.can_handle(&envelope(Invoiced)));
        assert!(base.can_handle(&envelope(Invoiced)));
        assert!(any.can_handle(&envelope(Invoiced)));

        assert!(!exact.can_handle(&envelope(Shipped)));
        assert!(!base.can_handle(&envelope(Shipped)));
        assert!(any.can_handle(&envelope(Shipped)));
    }

    #[tokio::test]
    async fn closure_receives_the_envelope() {
        let handler = FnHandler::on::<Invoiced, _, _>("check", |envelope, _| async move {
            if envelope.is::<Invoiced>() {
                Ok(())
            } else {
                Err("wrong payload".into())
            }
        })
        .with_priority(-3);

        assert_eq!(handler.priority(), -3);
        assert_eq!(handler.id(), HandlerId::from("check"));
        handler
            .handle(&envelope(Invoiced), &CancellationToken::new())
            .await
            .unwrap();
    }
}
