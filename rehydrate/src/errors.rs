//! Error types for `rehydrate`.
//!
//! Every subsystem has its own error enum so callers can react precisely:
//!
//! - **EventLogError**: storage-level failures reported by an [`EventLog`](crate::log::EventLog)
//! - **RehydrationError**: folding a stream into an aggregate failed
//! - **RegistrationError**: a transition table or command descriptor is malformed
//! - **ValidationError**: a command validator rejected a command
//! - **CommandError**: the command pipeline failed; nothing was committed
//! - **HandlerError**: one event handler invocation failed on the dispatch bus
//! - **DispatchError**: the dispatch bus refused work or faulted
//!
//! A revision conflict and a missing stream are always distinct variants so
//! that callers can implement read-modify-write retry loops.

use crate::event::EventType;
use crate::types::{StreamId, StreamRevision};
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by user code (transitions, business methods, handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by event log implementations.
#[derive(Debug, Clone, Error)]
pub enum EventLogError {
    /// The stream does not exist.
    #[error("Stream '{0}' not found")]
    StreamNotFound(StreamId),

    /// The stream's revision did not match the expectation of the writer.
    #[error(
        "Revision conflict on stream '{stream}': expected {expected}, but current is {}",
        describe_actual(.actual)
    )]
    RevisionConflict {
        /// The stream with the conflict
        stream: StreamId,
        /// What the writer expected, rendered for display
        expected: String,
        /// The actual revision, or `None` when the stream does not exist
        actual: Option<StreamRevision>,
    },

    /// A create or append call carried no events.
    #[error("Refusing to write an empty batch to stream '{0}'")]
    EmptyAppend(StreamId),

    /// The log could not be reached.
    #[error("Event log unavailable: {0}")]
    Unavailable(String),

    /// The operation took too long.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventLogError {
    /// Whether retrying the same operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors raised while folding a stream into an aggregate.
#[derive(Debug, Error)]
pub enum RehydrationError {
    /// `create_from` was given a stream without events.
    #[error("Cannot create {aggregate_type} from empty stream '{stream_id}'")]
    EmptyStream {
        /// The stream that was read
        stream_id: StreamId,
        /// The aggregate being rebuilt
        aggregate_type: &'static str,
    },

    /// No transition of the relevant set accepts the encountered event type.
    #[error("{aggregate_type} has no transition for event {event_type} in stream '{stream_id}'")]
    NoTransition {
        /// The stream being folded
        stream_id: StreamId,
        /// The aggregate being rebuilt
        aggregate_type: &'static str,
        /// The unhandled event type
        event_type: EventType,
    },

    /// A transition returned an error or panicked.
    #[error("Transition '{transition}' of {aggregate_type} failed on stream '{stream_id}': {source}")]
    TransitionFailed {
        /// The stream being folded
        stream_id: StreamId,
        /// The aggregate being rebuilt
        aggregate_type: &'static str,
        /// The failing transition
        transition: String,
        /// What went wrong
        #[source]
        source: BoxError,
    },

    /// The log failed while the stream was being read.
    #[error("Event log error while rehydrating: {0}")]
    Log(#[from] EventLogError),

    /// The fold was cancelled between two events.
    #[error("Rehydration of stream '{0}' was cancelled")]
    Cancelled(StreamId),
}

/// Errors raised while building transition tables or command descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Two type-specific transitions of one set claim the same event type.
    #[error("{phase} transitions '{first}' and '{second}' both claim event type {event_type}")]
    DuplicateTransition {
        /// Create or update
        phase: &'static str,
        /// The contested event type
        event_type: String,
        /// The transition registered first
        first: String,
        /// The transition registered second
        second: String,
    },

    /// A transition or command declared a service the provider cannot supply.
    #[error("'{requested_by}' requires service {service}, which is not registered")]
    MissingService {
        /// The declaring transition or command
        requested_by: String,
        /// The missing service type
        service: &'static str,
    },

    /// A command descriptor was built without a business method.
    #[error("Command {command_type} has no business method")]
    MissingBusinessMethod {
        /// The command type
        command_type: &'static str,
    },
}

/// A command was rejected by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The offending field, if the validator names one
    pub field: Option<String>,
    /// Human readable reason
    pub message: String,
}

impl ValidationError {
    /// A validation failure without a field.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// A validation failure attributed to a field.
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

/// Errors returned by the command pipeline.
///
/// A command that fails never leaves events behind: validation and load
/// failures happen before any write, and commits are atomic.
///
/// - **Validation**: fix the input
/// - **RevisionConflict**: reload and retry (see [`crate::retry`])
/// - **StreamNotFound**: the stream must be created first
/// - **Rehydration**: the stored history cannot be folded, indicates a bug
/// - **BusinessRule**: the business method refused the command
#[derive(Debug, Error)]
pub enum CommandError {
    /// A validator rejected the command.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The stream to update does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream advanced past the expected revision.
    #[error(
        "Revision conflict on stream '{stream}': expected {expected}, but current is {}",
        describe_actual(.actual)
    )]
    RevisionConflict {
        /// The contested stream
        stream: StreamId,
        /// What the pipeline expected
        expected: String,
        /// What the log reported
        actual: Option<StreamRevision>,
    },

    /// Loading the aggregate failed.
    #[error("Failed to load aggregate: {0}")]
    Rehydration(#[from] RehydrationError),

    /// The business method refused the command.
    #[error("Business rule violation: {0}")]
    BusinessRule(#[source] BoxError),

    /// An enricher failed before the events were committed.
    #[error("Enricher '{enricher}' failed: {source}")]
    Enrichment {
        /// The failing enricher
        enricher: String,
        /// What went wrong
        #[source]
        source: BoxError,
    },

    /// The log failed for a reason other than conflict or missing stream.
    #[error("Event log error: {0}")]
    Log(EventLogError),

    /// The command was cancelled before commit.
    #[error("Command was cancelled before commit")]
    Cancelled,

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Wraps a business-rule refusal.
    pub fn business_rule(error: impl Into<BoxError>) -> Self {
        Self::BusinessRule(error.into())
    }

    /// Whether the command may succeed when re-run against fresh state.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. })
    }
}

impl From<EventLogError> for CommandError {
    fn from(err: EventLogError) -> Self {
        match err {
            EventLogError::RevisionConflict {
                stream,
                expected,
                actual,
            } => Self::RevisionConflict {
                stream,
                expected,
                actual,
            },
            EventLogError::StreamNotFound(stream) => Self::StreamNotFound(stream),
            other => Self::Log(other),
        }
    }
}

/// A single event handler invocation failed on the dispatch bus.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("Handler '{handler}' failed on {event_type} at {stream_id}@{position}: {reason}")]
    Failed {
        /// The failing handler
        handler: String,
        /// The stream of the event
        stream_id: StreamId,
        /// The position of the event
        position: StreamRevision,
        /// The payload type
        event_type: EventType,
        /// Rendered error
        reason: String,
    },

    /// The handler panicked.
    #[error("Handler '{handler}' panicked on {event_type} at {stream_id}@{position}: {reason}")]
    Panicked {
        /// The failing handler
        handler: String,
        /// The stream of the event
        stream_id: StreamId,
        /// The position of the event
        position: StreamRevision,
        /// The payload type
        event_type: EventType,
        /// Panic message, when it was a string
        reason: String,
    },

    /// The handler did not finish within the configured timeout.
    #[error("Handler '{handler}' timed out after {timeout:?} on {event_type} at {stream_id}@{position}")]
    TimedOut {
        /// The failing handler
        handler: String,
        /// The stream of the event
        stream_id: StreamId,
        /// The position of the event
        position: StreamRevision,
        /// The payload type
        event_type: EventType,
        /// The configured limit
        timeout: Duration,
    },

    /// The bus was cancelled while the handler ran.
    #[error("Handler '{handler}' was cancelled on {event_type} at {stream_id}@{position}")]
    Cancelled {
        /// The failing handler
        handler: String,
        /// The stream of the event
        stream_id: StreamId,
        /// The position of the event
        position: StreamRevision,
        /// The payload type
        event_type: EventType,
    },
}

impl HandlerError {
    /// The handler that failed.
    pub fn handler(&self) -> &str {
        match self {
            Self::Failed { handler, .. }
            | Self::Panicked { handler, .. }
            | Self::TimedOut { handler, .. }
            | Self::Cancelled { handler, .. } => handler,
        }
    }

    /// The stream whose event was being handled.
    pub const fn stream_id(&self) -> &StreamId {
        match self {
            Self::Failed { stream_id, .. }
            | Self::Panicked { stream_id, .. }
            | Self::TimedOut { stream_id, .. }
            | Self::Cancelled { stream_id, .. } => stream_id,
        }
    }
}

/// The dispatch bus refused a submission or stopped.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// `complete()` was already called.
    #[error("Dispatch bus no longer accepts submissions")]
    Closed,

    /// A handler failed under the propagate policy.
    #[error("Dispatch bus faulted: {0}")]
    Faulted(HandlerError),
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

fn describe_actual(actual: &Option<StreamRevision>) -> String {
    actual.map_or_else(|| "no stream".to_string(), |revision| revision.to_string())
}

/// Type alias for event log results.
pub type EventLogResult<T> = Result<T, EventLogError>;

/// Type alias for rehydration results.
pub type RehydrationResult<T> = Result<T, RehydrationError>;

/// Type alias for command results.
pub type CommandResult<T> = Result<T, CommandError>;
