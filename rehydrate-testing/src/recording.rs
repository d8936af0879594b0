//! Test utility for recording handler invocations.
//!
//! `RecordingHandler` implements [`EventHandler`] and pushes one [`Recorded`]
//! entry per invocation into shared storage, so a test can assert what the
//! dispatch bus delivered, to whom, and in which order.
//!
//! ```ignore
//! let log = Arc::new(Mutex::new(Vec::new()));
//! registry.register(RecordingHandler::catch_all("audit", Arc::clone(&log)));
//!
//! bus.submit(envelope).await?;
//! bus.complete();
//! bus.completion().await?;
//!
//! assert_eq!(log.lock().len(), 1);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rehydrate::{
    BoxError, CancellationToken, EventEnvelope, EventHandler, EventType, HandlerId, StreamId,
    StreamRevision,
};
use std::sync::Arc;
use std::time::Duration;

/// One invocation seen by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// The handler that ran
    pub handler: HandlerId,
    /// Stream of the delivered envelope
    pub stream_id: StreamId,
    /// Position of the delivered envelope
    pub position: StreamRevision,
    /// Concrete payload type name
    pub event_type: &'static str,
}

/// A handler that records every envelope it is given.
///
/// Several handlers may share one storage so a test can observe the
/// interleaving between them.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    id: HandlerId,
    event_type: Option<EventType>,
    priority: i32,
    delay: Option<Duration>,
    fail_at: Option<StreamRevision>,
    storage: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingHandler {
    /// A recorder for `T`, a concrete event type or a supertype.
    pub fn on<T: ?Sized + 'static>(
        id: impl Into<HandlerId>,
        storage: Arc<Mutex<Vec<Recorded>>>,
    ) -> Self {
        Self::new(id, Some(EventType::of::<T>()), storage)
    }

    /// A recorder for every event.
    pub fn catch_all(id: impl Into<HandlerId>, storage: Arc<Mutex<Vec<Recorded>>>) -> Self {
        Self::new(id, None, storage)
    }

    fn new(
        id: impl Into<HandlerId>,
        event_type: Option<EventType>,
        storage: Arc<Mutex<Vec<Recorded>>>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type,
            priority: 0,
            delay: None,
            fail_at: None,
            storage,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sleeps this long before recording, honouring cancellation.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Records, then fails, the envelope at `position`.
    #[must_use]
    pub const fn failing_at(mut self, position: StreamRevision) -> Self {
        self.fail_at = Some(position);
        self
    }

    /// A copy of everything recorded so far by every handler sharing storage.
    pub fn recorded(&self) -> Vec<Recorded> {
        self.storage.lock().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn id(&self) -> HandlerId {
        self.id.clone()
    }

    fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                () = cancel.cancelled() => return Err("cancelled while delayed".into()),
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.storage.lock().push(Recorded {
            handler: self.id.clone(),
            stream_id: envelope.stream_id().clone(),
            position: envelope.stream_position(),
            event_type: envelope.event_type().short_name(),
        });

        if self.fail_at == Some(envelope.stream_position()) {
            return Err(format!(
                "{} refused position {}",
                self.id,
                envelope.stream_position()
            )
            .into());
        }
        Ok(())
    }
}
