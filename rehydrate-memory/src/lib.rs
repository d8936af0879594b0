//! In-memory event log for `rehydrate`.
//!
//! This crate provides an in-memory implementation of the `EventLog` trait
//! from the rehydrate crate, useful for testing and development scenarios
//! where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use rehydrate::{
    EnvelopeStream, EventEnvelope, EventLog, EventLogError, EventLogResult, ExpectedRevision,
    NewEvent, ReadRange, StreamId, StreamRevision, Timestamp, Transaction,
};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};

type Streams = HashMap<StreamId, Vec<EventEnvelope>>;

/// Thread-safe in-memory event log for testing.
///
/// Clones share storage. Every write takes the single write lock, so writes
/// to all streams are serialized and a transaction is observed entirely or
/// not at all.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    streams: Arc<RwLock<Streams>>,
    publisher: Option<mpsc::UnboundedSender<EventEnvelope>>,
}

impl InMemoryEventLog {
    /// Create a new empty in-memory event log
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends every committed envelope to `publisher`, in commit order.
    ///
    /// Envelopes are sent while the write lock is held, so each stream's
    /// envelopes arrive in position order. Pair with
    /// [`DispatchBus::forward`](rehydrate::DispatchBus::forward).
    #[must_use]
    pub fn with_publisher(mut self, publisher: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Number of streams holding events.
    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// A snapshot of one stream, empty if it does not exist.
    pub fn events(&self, stream_id: &StreamId) -> Vec<EventEnvelope> {
        self.streams
            .read()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes every stream.
    pub fn clear(&self) {
        self.streams.write().clear();
    }

    fn revision_of(streams: &Streams, stream_id: &StreamId) -> Option<StreamRevision> {
        streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map(EventEnvelope::stream_position)
    }

    fn check(
        streams: &Streams,
        stream_id: &StreamId,
        expected: ExpectedRevision,
    ) -> EventLogResult<()> {
        let actual = Self::revision_of(streams, stream_id);
        if expected.is_satisfied_by(actual) {
            return Ok(());
        }
        if actual.is_none() {
            return Err(EventLogError::StreamNotFound(stream_id.clone()));
        }
        Err(EventLogError::RevisionConflict {
            stream: stream_id.clone(),
            expected: expected.to_string(),
            actual,
        })
    }

    /// Appends `events`, which the caller has checked are non-empty.
    fn write(
        &self,
        streams: &mut Streams,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
        timestamp: Timestamp,
    ) -> StreamRevision {
        let stored = streams.entry(stream_id.clone()).or_default();
        let mut position = stored
            .last()
            .map_or_else(StreamRevision::initial, |last| last.stream_position().next());
        let mut revision = position;

        for event in events {
            let envelope = event.into_envelope(stream_id.clone(), position, timestamp);
            trace!(stream_id = %stream_id, stream_position = %position, "storing event");
            if let Some(publisher) = &self.publisher {
                if publisher.send(envelope.clone()).is_err() {
                    trace!("publisher closed, envelope not forwarded");
                }
            }
            stored.push(envelope);
            revision = position;
            position = position.next();
        }
        revision
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn exists(&self, stream_id: &StreamId) -> EventLogResult<bool> {
        Ok(Self::revision_of(&self.streams.read(), stream_id).is_some())
    }

    async fn current_revision(
        &self,
        stream_id: &StreamId,
    ) -> EventLogResult<Option<StreamRevision>> {
        Ok(Self::revision_of(&self.streams.read(), stream_id))
    }

    #[instrument(skip(self, events), fields(stream_id = %stream_id, events = events.len()))]
    async fn create(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        if events.is_empty() {
            return Err(EventLogError::EmptyAppend(stream_id.clone()));
        }

        let mut streams = self.streams.write();
        if let Some(actual) = Self::revision_of(&streams, stream_id) {
            return Err(EventLogError::RevisionConflict {
                stream: stream_id.clone(),
                expected: ExpectedRevision::NoStream.to_string(),
                actual: Some(actual),
            });
        }

        let revision = self.write(&mut streams, stream_id, events, Timestamp::now());
        debug!(revision = %revision, "stream created");
        Ok(revision)
    }

    #[instrument(skip(self, events), fields(stream_id = %stream_id, expected = %expected, events = events.len()))]
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        if events.is_empty() {
            return Err(EventLogError::EmptyAppend(stream_id.clone()));
        }

        let mut streams = self.streams.write();
        Self::check(&streams, stream_id, expected)?;

        let revision = self.write(&mut streams, stream_id, events, Timestamp::now());
        debug!(revision = %revision, "events appended");
        Ok(revision)
    }

    fn read_forward(&self, stream_id: &StreamId, range: ReadRange) -> EnvelopeStream<'_> {
        let streams = self.streams.read();
        let Some(stored) = streams.get(stream_id) else {
            return stream::iter([Err(EventLogError::StreamNotFound(stream_id.clone()))]).boxed();
        };

        let selected: Vec<EventLogResult<EventEnvelope>> = stored
            .iter()
            .filter(|envelope| range.contains(envelope.stream_position()))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(selected).boxed()
    }

    #[instrument(skip_all, fields(streams = transaction.len()))]
    async fn transaction(
        &self,
        transaction: Transaction,
    ) -> EventLogResult<BTreeMap<StreamId, StreamRevision>> {
        let entries = transaction.into_streams();
        if let Some((stream_id, _)) = entries.iter().find(|(_, entry)| entry.events.is_empty()) {
            return Err(EventLogError::EmptyAppend(stream_id.clone()));
        }

        let mut streams = self.streams.write();

        // First, verify every expectation
        for (stream_id, entry) in &entries {
            Self::check(&streams, stream_id, entry.expected)?;
        }

        // All expectations hold, proceed with writes
        let timestamp = Timestamp::now();
        let revisions: BTreeMap<_, _> = entries
            .into_iter()
            .map(|(stream_id, entry)| {
                let revision = self.write(&mut streams, &stream_id, entry.events, timestamp);
                (stream_id, revision)
            })
            .collect();

        debug!(streams = revisions.len(), "transaction committed");
        Ok(revisions)
    }
}

impl std::fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("streams", &self.stream_count())
            .field("publishing", &self.publisher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use rehydrate::Event;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq)]
    struct Note(&'static str);

    impl Event for Note {}

    fn stream(id: &str) -> StreamId {
        StreamId::try_new(id).unwrap()
    }

    fn notes(texts: &[&'static str]) -> Vec<NewEvent> {
        texts.iter().map(|text| NewEvent::new(Note(text))).collect()
    }

    fn rev(value: u64) -> StreamRevision {
        StreamRevision::new(value)
    }

    async fn read_all(log: &InMemoryEventLog, id: &StreamId) -> EventLogResult<Vec<EventEnvelope>> {
        log.read_forward(id, ReadRange::all()).try_collect().await
    }

    #[tokio::test]
    async fn test_new_log_is_empty() {
        let log = InMemoryEventLog::new();
        assert_eq!(log.stream_count(), 0);
        assert!(!log.exists(&stream("s")).await.unwrap());
        assert_eq!(log.current_revision(&stream("s")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let log = InMemoryEventLog::new();
        let clone = log.clone();

        log.create(&stream("s"), notes(&["a"])).await.unwrap();
        assert!(clone.exists(&stream("s")).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_assigns_positions_from_zero() {
        let log = InMemoryEventLog::new();
        let revision = log.create(&stream("s"), notes(&["a", "b", "c"])).await.unwrap();

        assert_eq!(revision, rev(2));
        let positions: Vec<u64> = read_all(&log, &stream("s"))
            .await
            .unwrap()
            .iter()
            .map(|e| e.stream_position().value())
            .collect();
        assert_eq!(positions, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let log = InMemoryEventLog::new();
        log.create(&stream("s"), notes(&["a"])).await.unwrap();

        let result = log.create(&stream("s"), notes(&["b"])).await;
        assert!(matches!(
            result,
            Err(EventLogError::RevisionConflict { actual: Some(actual), .. }) if actual == rev(0)
        ));
        assert_eq!(log.events(&stream("s")).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_control() {
        let log = InMemoryEventLog::new();
        let id = stream("s");
        log.create(&id, notes(&["a", "b"])).await.unwrap();

        // Stale expectation
        let result = log
            .append(&id, ExpectedRevision::Exact(rev(0)), notes(&["c"]))
            .await;
        assert!(matches!(result, Err(EventLogError::RevisionConflict { .. })));

        let revision = log
            .append(&id, ExpectedRevision::Exact(rev(1)), notes(&["c"]))
            .await
            .unwrap();
        assert_eq!(revision, rev(2));
        assert_eq!(log.current_revision(&id).await.unwrap(), Some(rev(2)));
    }

    #[tokio::test]
    async fn test_append_to_missing_stream() {
        let log = InMemoryEventLog::new();

        let exact = log
            .append(&stream("s"), ExpectedRevision::Exact(rev(0)), notes(&["a"]))
            .await;
        assert!(matches!(exact, Err(EventLogError::StreamNotFound(_))));

        let any = log
            .append(&stream("s"), ExpectedRevision::Any, notes(&["a"]))
            .await
            .unwrap();
        assert_eq!(any, rev(0));
    }

    #[tokio::test]
    async fn test_empty_batches_are_rejected() {
        let log = InMemoryEventLog::new();
        assert!(matches!(
            log.create(&stream("s"), Vec::new()).await,
            Err(EventLogError::EmptyAppend(_))
        ));
        assert!(matches!(
            log.append(&stream("s"), ExpectedRevision::Any, Vec::new()).await,
            Err(EventLogError::EmptyAppend(_))
        ));
        assert_eq!(log.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_read_range_filtering() {
        let log = InMemoryEventLog::new();
        let id = stream("s");
        log.create(&id, notes(&["a", "b", "c", "d"])).await.unwrap();

        let selected: Vec<EventEnvelope> = log
            .read_forward(&id, ReadRange::all().from_revision(rev(1)).to_revision(rev(2)))
            .try_collect()
            .await
            .unwrap();
        let texts: Vec<&str> = selected
            .iter()
            .filter_map(|e| e.event_as::<Note>().map(|note| note.0))
            .collect();
        assert_eq!(texts, ["b", "c"]);
    }

    #[tokio::test]
    async fn test_read_missing_stream_fails() {
        let log = InMemoryEventLog::new();
        assert!(matches!(
            read_all(&log, &stream("missing")).await,
            Err(EventLogError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let log = InMemoryEventLog::new();
        log.create(&stream("a"), notes(&["a0"])).await.unwrap();

        let stale = Transaction::new()
            .with_stream(stream("a"), ExpectedRevision::Exact(rev(0)), notes(&["a1"]))
            .with_stream(stream("b"), ExpectedRevision::Exact(rev(3)), notes(&["b0"]));
        assert!(log.transaction(stale).await.is_err());
        assert_eq!(log.current_revision(&stream("a")).await.unwrap(), Some(rev(0)));
        assert!(!log.exists(&stream("b")).await.unwrap());

        let valid = Transaction::new()
            .with_stream(stream("a"), ExpectedRevision::Exact(rev(0)), notes(&["a1"]))
            .with_stream(stream("b"), ExpectedRevision::NoStream, notes(&["b0", "b1"]));
        let revisions = log.transaction(valid).await.unwrap();
        assert_eq!(revisions.get(&stream("a")), Some(&rev(1)));
        assert_eq!(revisions.get(&stream("b")), Some(&rev(1)));
    }

    #[tokio::test]
    async fn test_publisher_receives_commits_in_order() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let log = InMemoryEventLog::new().with_publisher(sender);

        log.create(&stream("s"), notes(&["a", "b"])).await.unwrap();
        log.append(&stream("s"), ExpectedRevision::Exact(rev(1)), notes(&["c"]))
            .await
            .unwrap();

        let mut positions = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            positions.push(envelope.stream_position().value());
        }
        assert_eq!(positions, [0, 1, 2]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_closed_publisher_does_not_fail_writes() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let log = InMemoryEventLog::new().with_publisher(sender);

        assert!(log.create(&stream("s"), notes(&["a"])).await.is_ok());
        assert_eq!(log.events(&stream("s")).len(), 1);
        assert!(logs_contain("publisher closed"));
    }
}
