//! Event log abstraction.
//!
//! The `EventLog` trait is the port through which the runtime reads and
//! writes streams. It is the single source of truth: only the log mutates
//! durable state, and it must reject any writer presenting a stale expected
//! revision.

use crate::errors::EventLogResult;
use crate::event::{EventEnvelope, NewEvent};
use crate::types::{StreamId, StreamRevision};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

/// Expected revision for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// The stream must not exist
    NoStream,
    /// The stream must exist and its last event must sit at exactly this revision
    Exact(StreamRevision),
    /// Any state is acceptable (no concurrency control)
    Any,
}

impl ExpectedRevision {
    /// Whether a stream currently at `actual` satisfies this expectation.
    pub fn is_satisfied_by(self, actual: Option<StreamRevision>) -> bool {
        match self {
            Self::NoStream => actual.is_none(),
            Self::Exact(expected) => actual == Some(expected),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ExpectedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(revision) => write!(f, "exactly {revision}"),
            Self::Any => f.write_str("any revision"),
        }
    }
}

impl From<StreamRevision> for ExpectedRevision {
    fn from(revision: StreamRevision) -> Self {
        Self::Exact(revision)
    }
}

impl From<Option<StreamRevision>> for ExpectedRevision {
    fn from(revision: Option<StreamRevision>) -> Self {
        revision.map_or(Self::NoStream, Self::Exact)
    }
}

/// Inclusive revision bounds for a forward read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRange {
    /// First revision to return. `None` = from the beginning
    pub from: Option<StreamRevision>,
    /// Last revision to return. `None` = to the end
    pub to: Option<StreamRevision>,
}

impl ReadRange {
    /// The whole stream.
    pub const fn all() -> Self {
        Self {
            from: None,
            to: None,
        }
    }

    /// Sets the first revision to return.
    #[must_use]
    pub const fn from_revision(mut self, revision: StreamRevision) -> Self {
        self.from = Some(revision);
        self
    }

    /// Sets the last revision to return.
    #[must_use]
    pub const fn to_revision(mut self, revision: StreamRevision) -> Self {
        self.to = Some(revision);
        self
    }

    /// Whether `revision` falls inside the range.
    pub fn contains(&self, revision: StreamRevision) -> bool {
        self.from.map_or(true, |from| revision >= from) && self.to.map_or(true, |to| revision <= to)
    }
}

/// Events to write to one stream as part of a transaction.
#[derive(Debug, Clone)]
pub struct StreamAppend {
    /// Expectation checked before anything in the transaction is written
    pub expected: ExpectedRevision,
    /// The events, in commit order
    pub events: Vec<NewEvent>,
}

impl StreamAppend {
    /// Creates a new entry.
    pub const fn new(expected: ExpectedRevision, events: Vec<NewEvent>) -> Self {
        Self { expected, events }
    }
}

/// An atomic multi-stream write: every stream is written, or none is.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    streams: BTreeMap<StreamId, StreamAppend>,
}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds events for a stream. Events for a stream already present are
    /// appended to its list and the later expectation wins.
    #[must_use]
    pub fn with_stream(
        mut self,
        stream_id: StreamId,
        expected: ExpectedRevision,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> Self {
        let entry = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamAppend::new(expected, Vec::new()));
        entry.expected = expected;
        entry.events.extend(events);
        self
    }

    /// Number of streams touched.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the transaction touches no stream.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Iterates over the entries in stream id order.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &StreamAppend)> {
        self.streams.iter()
    }

    /// Mutable access to every pending event, for enrichment.
    pub fn events_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut NewEvent)> {
        self.streams
            .iter_mut()
            .flat_map(|(stream_id, entry)| entry.events.iter_mut().map(move |e| (stream_id, e)))
    }

    /// Consumes the transaction.
    pub fn into_streams(self) -> BTreeMap<StreamId, StreamAppend> {
        self.streams
    }
}

/// A forward read over one stream.
pub type EnvelopeStream<'a> = BoxStream<'a, EventLogResult<EventEnvelope>>;

/// The append-only log the runtime persists to.
///
/// Revisions are 0-based positions: after `create` with one event the stream
/// is at revision 0.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Whether the stream holds at least one event.
    async fn exists(&self, stream_id: &StreamId) -> EventLogResult<bool>;

    /// The revision of the last event, or `None` if the stream does not exist.
    async fn current_revision(&self, stream_id: &StreamId)
        -> EventLogResult<Option<StreamRevision>>;

    /// Starts a new stream.
    ///
    /// # Errors
    /// `RevisionConflict` if the stream already exists.
    async fn create(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision>;

    /// Appends to a stream after checking the expectation.
    ///
    /// # Errors
    /// `StreamNotFound` if `expected` is `Exact` and the stream does not exist,
    /// `RevisionConflict` if the stream is at another revision.
    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision>;

    /// Reads a stream in revision order.
    ///
    /// # Errors
    /// The stream yields `StreamNotFound` when the stream does not exist.
    fn read_forward(&self, stream_id: &StreamId, range: ReadRange) -> EnvelopeStream<'_>;

    /// Writes several streams atomically, returning each stream's new revision.
    async fn transaction(
        &self,
        transaction: Transaction,
    ) -> EventLogResult<BTreeMap<StreamId, StreamRevision>>;
}

#[async_trait]
impl<T> EventLog for std::sync::Arc<T>
where
    T: EventLog + ?Sized,
{
    async fn exists(&self, stream_id: &StreamId) -> EventLogResult<bool> {
        (**self).exists(stream_id).await
    }

    async fn current_revision(
        &self,
        stream_id: &StreamId,
    ) -> EventLogResult<Option<StreamRevision>> {
        (**self).current_revision(stream_id).await
    }

    async fn create(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        (**self).create(stream_id, events).await
    }

    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        (**self).append(stream_id, expected, events).await
    }

    fn read_forward(&self, stream_id: &StreamId, range: ReadRange) -> EnvelopeStream<'_> {
        (**self).read_forward(stream_id, range)
    }

    async fn transaction(
        &self,
        transaction: Transaction,
    ) -> EventLogResult<BTreeMap<StreamId, StreamRevision>> {
        (**self).transaction(transaction).await
    }
}
