//! `rehydrate` - an event-sourcing runtime.
//!
//! The crate provides four cooperating pieces:
//!
//! - the **rehydration engine** ([`aggregate`]) folds a stream of envelopes
//!   into a typed aggregate through exact-type when-transitions
//! - the **command pipeline** ([`command`]) loads an aggregate at a known
//!   revision, runs business logic and appends the resulting events only if
//!   the stream has not advanced
//! - **handler resolution** ([`resolution`]) computes the ordered,
//!   deduplicated handlers for a concrete event type
//! - the **dispatch bus** ([`bus`]) delivers committed events to those
//!   handlers, in order per stream and in parallel across streams
//!
//! Storage is abstracted behind [`EventLog`]; `rehydrate-memory` provides an
//! in-memory implementation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod bus;
pub mod command;
pub mod concurrency;
pub mod errors;
pub mod event;
pub mod handler;
pub mod log;
pub mod metadata;
pub mod resolution;
pub mod retry;
pub mod services;
pub mod types;

pub use aggregate::{
    Aggregate, AggregateFactory, Capability, Mode, Phase, Rehydrated, TransitionContext,
    TransitionDescriptor, Transitions, TransitionsBuilder,
};
pub use bus::{
    BufferCapacity, BusState, DispatchBus, DispatchConfig, DrainBatch, HandlerErrorPolicy,
    HandlerTimeoutMs, MaxParallelism,
};
pub use command::{
    AsyncEnricher, AsyncValidator, Command, CommandContext, CommandDescriptor,
    CommandDescriptorBuilder, CommandHandler, CommandOutcome, CommandPipeline, Decision,
    StreamSource, TargetKind,
};
pub use concurrency::{CachingConcurrencyTracker, ConcurrencyTracker, NoConcurrencyTracker};
pub use errors::{
    BoxError, CommandError, CommandResult, DispatchError, EventLogError, EventLogResult,
    HandlerError, RegistrationError, RehydrationError, RehydrationResult, ValidationError,
};
pub use event::{lineage, DynEvent, Event, EventEnvelope, EventType, NewEvent};
pub use handler::{EventHandler, FnHandler, HandlerId};
pub use log::{EnvelopeStream, EventLog, ExpectedRevision, ReadRange, StreamAppend, Transaction};
pub use metadata::{ActorId, CausationId, CorrelationId, EventMetadata};
pub use resolution::{HandlerCollection, HandlerRegistry};
pub use retry::{retry_on_conflict, RetryConfig, RetryPolicy};
pub use services::{ServiceKey, ServiceProvider, ServiceProviderExt, Services};
pub use types::{StreamId, StreamIdError, StreamRevision, Timestamp};

/// Re-exported so handler and transition signatures can name it.
pub use tokio_util::sync::CancellationToken;
