//! The optimistic-concurrency command pipeline.
//!
//! A command targets one stream, either to create it or to update it. The
//! pipeline validates the command, loads the target aggregate at a known
//! revision, runs the business method and commits the resulting events with
//! that revision as the expectation. If another writer got there first the
//! log rejects the commit and the caller sees [`CommandError::RevisionConflict`].
//!
//! ```rust,ignore
//! struct Deposit { account: String, amount: u64 }
//!
//! impl Command for Deposit {
//!     type Aggregate = Account;
//!     type Output = ();
//!
//!     fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
//!         CommandDescriptor::updating(StreamSource::derived(|c: &Deposit| {
//!             StreamId::try_new(format!("account-{}", c.account))
//!         }))
//!         .validate(|c| {
//!             if c.amount == 0 {
//!                 return Err(ValidationError::for_field("amount", "must be positive"));
//!             }
//!             Ok(())
//!         })
//!         .execute(|c, account, _ctx| {
//!             let account = account.ok_or("account missing")?;
//!             if account.frozen {
//!                 return Err("account is frozen".into());
//!             }
//!             Ok(Decision::event(Deposited { amount: c.amount }))
//!         })
//!         .build()
//!     }
//! }
//!
//! let pipeline = CommandPipeline::<Deposit, _>::new(log, Arc::new(Services::new()))?;
//! pipeline.handle(Deposit { account: "42".into(), amount: 10 }).await?;
//! ```

use crate::aggregate::{Aggregate, AggregateFactory};
use crate::concurrency::{ConcurrencyTracker, NoConcurrencyTracker};
use crate::errors::{
    panic_message, BoxError, CommandError, CommandResult, RegistrationError, RehydrationError,
    ValidationError,
};
use crate::event::{Event, NewEvent};
use crate::log::{EventLog, ExpectedRevision, ReadRange, Transaction};
use crate::metadata::CorrelationId;
use crate::services::{ServiceKey, ServiceProvider, ServiceProviderExt};
use crate::types::{StreamId, StreamIdError, StreamRevision};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

/// A command handled by a [`CommandPipeline`].
pub trait Command: Send + Sync + Sized + 'static {
    /// The aggregate living in the target stream.
    type Aggregate: Aggregate;

    /// Value returned alongside committed events, `()` if none.
    type Output: Send + 'static;

    /// How the pipeline should process this command.
    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError>;
}

/// Whether a command starts a new stream or extends an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// The stream must not exist yet
    Create,
    /// The stream must exist and is loaded before the business method runs
    Update,
}

type DeriveStream<C> = Arc<dyn Fn(&C) -> Result<StreamId, StreamIdError> + Send + Sync>;

/// Where a command's target stream id comes from.
pub enum StreamSource<C> {
    /// Always the same stream
    Fixed(StreamId),
    /// Computed from the command
    Derived(DeriveStream<C>),
}

impl<C> StreamSource<C> {
    /// A constant stream id.
    pub const fn fixed(stream_id: StreamId) -> Self {
        Self::Fixed(stream_id)
    }

    /// A stream id computed from the command.
    pub fn derived(f: impl Fn(&C) -> Result<StreamId, StreamIdError> + Send + Sync + 'static) -> Self {
        Self::Derived(Arc::new(f))
    }

    fn resolve(&self, command: &C) -> Result<StreamId, ValidationError> {
        match self {
            Self::Fixed(stream_id) => Ok(stream_id.clone()),
            Self::Derived(f) => {
                f(command).map_err(|err| ValidationError::for_field("stream_id", err.to_string()))
            }
        }
    }
}

impl<C> Clone for StreamSource<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(stream_id) => Self::Fixed(stream_id.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<C> fmt::Debug for StreamSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(stream_id) => f.debug_tuple("Fixed").field(stream_id).finish(),
            Self::Derived(_) => f.write_str("Derived"),
        }
    }
}

/// Checks a command that needs I/O or services to decide.
#[async_trait]
pub trait AsyncValidator<C>: Send + Sync {
    /// Rejects the command with a reason, or lets it through.
    async fn validate(&self, command: &C, services: &dyn ServiceProvider) -> Result<(), ValidationError>;
}

/// Rewrites pending events before they are committed.
#[async_trait]
pub trait AsyncEnricher<C>: Send + Sync {
    /// Name reported when enrichment fails.
    fn name(&self) -> &str;

    /// Mutates one pending event of `stream_id`.
    async fn enrich(
        &self,
        command: &C,
        ctx: &CommandContext,
        stream_id: &StreamId,
        event: &mut NewEvent,
    ) -> Result<(), BoxError>;
}

type SyncValidator<C> = Arc<dyn Fn(&C) -> Result<(), ValidationError> + Send + Sync>;
type SyncEnricher<C> =
    Arc<dyn Fn(&C, &CommandContext, &StreamId, &mut NewEvent) -> Result<(), BoxError> + Send + Sync>;
type BusinessFn<C, A, R> = Arc<
    dyn Fn(Arc<C>, Option<A>, CommandContext) -> BoxFuture<'static, Result<Decision<R>, BoxError>>
        + Send
        + Sync,
>;

/// What the business method decided.
pub enum Decision<R = ()> {
    /// Nothing to write
    NoEvents,
    /// One event for the target stream
    Event(NewEvent),
    /// Several events for the target stream, in order
    Events(Vec<NewEvent>),
    /// Events for the target stream plus a value for the caller
    WithResult {
        /// Events for the target stream, possibly empty
        events: Vec<NewEvent>,
        /// Returned in [`CommandOutcome::Result`]
        result: R,
    },
    /// An atomic write across several streams
    Transaction(Transaction),
}

impl<R> Decision<R> {
    /// A single event for the target stream.
    pub fn event(event: impl Event) -> Self {
        Self::Event(NewEvent::new(event))
    }

    /// Several events for the target stream.
    pub fn events(events: impl IntoIterator<Item = NewEvent>) -> Self {
        Self::Events(events.into_iter().collect())
    }

    /// Events plus a value for the caller.
    pub fn with_result(events: impl IntoIterator<Item = NewEvent>, result: R) -> Self {
        Self::WithResult {
            events: events.into_iter().collect(),
            result,
        }
    }
}

impl<R> fmt::Debug for Decision<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEvents => f.write_str("NoEvents"),
            Self::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Self::Events(events) => f.debug_tuple("Events").field(events).finish(),
            Self::WithResult { events, .. } => f
                .debug_struct("WithResult")
                .field("events", events)
                .finish_non_exhaustive(),
            Self::Transaction(tx) => f.debug_tuple("Transaction").field(tx).finish(),
        }
    }
}

/// What a successfully handled command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome<R> {
    /// Nothing was written
    Unchanged {
        /// Revision the command observed, `None` for a create target
        revision: Option<StreamRevision>,
    },
    /// Events were appended to the target stream
    Committed {
        /// New revision of the target stream
        revision: StreamRevision,
    },
    /// Several streams were written atomically
    Transaction {
        /// New revision of every written stream
        revisions: BTreeMap<StreamId, StreamRevision>,
    },
    /// The business method returned a value
    Result {
        /// The value
        value: R,
        /// Revision of the target stream after the command
        revision: Option<StreamRevision>,
        /// Whether the command's events were written
        committed: bool,
    },
}

impl<R> CommandOutcome<R> {
    /// Revision of the target stream after the command, where known.
    pub fn revision(&self) -> Option<StreamRevision> {
        match self {
            Self::Unchanged { revision } | Self::Result { revision, .. } => *revision,
            Self::Committed { revision } => Some(*revision),
            Self::Transaction { .. } => None,
        }
    }

    /// Whether events were written.
    pub const fn is_committed(&self) -> bool {
        match self {
            Self::Committed { .. } | Self::Transaction { .. } => true,
            Self::Result { committed, .. } => *committed,
            Self::Unchanged { .. } => false,
        }
    }

    /// The returned value, if any.
    pub fn into_value(self) -> Option<R> {
        match self {
            Self::Result { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Data available to business methods and enrichers.
#[derive(Clone)]
pub struct CommandContext {
    stream_id: StreamId,
    expected_revision: Option<StreamRevision>,
    correlation_id: CorrelationId,
    services: Arc<dyn ServiceProvider>,
    cancellation: CancellationToken,
}

impl CommandContext {
    /// The target stream.
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// The revision the aggregate was loaded at, `None` for create targets.
    pub const fn expected_revision(&self) -> Option<StreamRevision> {
        self.expected_revision
    }

    /// Identifier shared by everything this command produces.
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// A registered service.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.get::<T>()
    }

    /// Cancelled when the caller abandons the command.
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("stream_id", &self.stream_id)
            .field("expected_revision", &self.expected_revision)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Everything the pipeline needs to know about one command type.
pub struct CommandDescriptor<C: Command> {
    kind: TargetKind,
    stream: StreamSource<C>,
    validators: Vec<SyncValidator<C>>,
    async_validators: Vec<Arc<dyn AsyncValidator<C>>>,
    enrichers: Vec<(String, SyncEnricher<C>)>,
    async_enrichers: Vec<Arc<dyn AsyncEnricher<C>>>,
    required_services: Vec<ServiceKey>,
    business: BusinessFn<C, C::Aggregate, C::Output>,
}

impl<C: Command> CommandDescriptor<C> {
    /// A command that starts `stream`.
    pub fn creating(stream: StreamSource<C>) -> CommandDescriptorBuilder<C> {
        CommandDescriptorBuilder::new(TargetKind::Create, stream)
    }

    /// A command that extends `stream`.
    pub fn updating(stream: StreamSource<C>) -> CommandDescriptorBuilder<C> {
        CommandDescriptorBuilder::new(TargetKind::Update, stream)
    }

    /// Create or update.
    pub const fn kind(&self) -> TargetKind {
        self.kind
    }
}

impl<C: Command> fmt::Debug for CommandDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("command_type", &std::any::type_name::<C>())
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("validators", &(self.validators.len() + self.async_validators.len()))
            .field("enrichers", &(self.enrichers.len() + self.async_enrichers.len()))
            .field("required_services", &self.required_services)
            .finish_non_exhaustive()
    }
}

/// Builds a [`CommandDescriptor`].
pub struct CommandDescriptorBuilder<C: Command> {
    kind: TargetKind,
    stream: StreamSource<C>,
    validators: Vec<SyncValidator<C>>,
    async_validators: Vec<Arc<dyn AsyncValidator<C>>>,
    enrichers: Vec<(String, SyncEnricher<C>)>,
    async_enrichers: Vec<Arc<dyn AsyncEnricher<C>>>,
    required_services: Vec<ServiceKey>,
    business: Option<BusinessFn<C, C::Aggregate, C::Output>>,
}

impl<C: Command> CommandDescriptorBuilder<C> {
    fn new(kind: TargetKind, stream: StreamSource<C>) -> Self {
        Self {
            kind,
            stream,
            validators: Vec::new(),
            async_validators: Vec::new(),
            enrichers: Vec::new(),
            async_enrichers: Vec::new(),
            required_services: Vec::new(),
            business: None,
        }
    }

    /// Adds a synchronous validator. Validators run in registration order.
    #[must_use]
    pub fn validate(
        mut self,
        f: impl Fn(&C) -> Result<(), ValidationError> + Send + Sync + 'static,
    ) -> Self {
        self.validators.push(Arc::new(f));
        self
    }

    /// Adds an asynchronous validator. These run after every synchronous one.
    #[must_use]
    pub fn validate_async(mut self, validator: impl AsyncValidator<C> + 'static) -> Self {
        self.async_validators.push(Arc::new(validator));
        self
    }

    /// Adds a synchronous enricher.
    #[must_use]
    pub fn enrich(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&C, &CommandContext, &StreamId, &mut NewEvent) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.enrichers.push((name.into(), Arc::new(f)));
        self
    }

    /// Adds an asynchronous enricher. These run after every synchronous one.
    #[must_use]
    pub fn enrich_async(mut self, enricher: impl AsyncEnricher<C> + 'static) -> Self {
        self.async_enrichers.push(Arc::new(enricher));
        self
    }

    /// Declares a service the business method will look up.
    ///
    /// The pipeline refuses to start if it is not registered.
    #[must_use]
    pub fn requires<S: Any + Send + Sync>(mut self) -> Self {
        self.required_services.push(ServiceKey::of::<S>());
        self
    }

    /// Sets a synchronous business method.
    #[must_use]
    pub fn execute(
        mut self,
        f: impl Fn(&C, Option<C::Aggregate>, &CommandContext) -> Result<Decision<C::Output>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let f = Arc::new(f);
        self.business = Some(Arc::new(move |command, aggregate, ctx| {
            let decision = f(&command, aggregate, &ctx);
            futures::future::ready(decision).boxed()
        }));
        self
    }

    /// Sets an asynchronous business method.
    #[must_use]
    pub fn execute_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<C>, Option<C::Aggregate>, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Decision<C::Output>, BoxError>> + Send + 'static,
    {
        self.business = Some(Arc::new(move |command, aggregate, ctx| {
            f(command, aggregate, ctx).boxed()
        }));
        self
    }

    /// Finishes the descriptor.
    ///
    /// # Errors
    /// `MissingBusinessMethod` if neither `execute` nor `execute_async` was called.
    pub fn build(self) -> Result<CommandDescriptor<C>, RegistrationError> {
        let business = self
            .business
            .ok_or(RegistrationError::MissingBusinessMethod {
                command_type: std::any::type_name::<C>(),
            })?;
        Ok(CommandDescriptor {
            kind: self.kind,
            stream: self.stream,
            validators: self.validators,
            async_validators: self.async_validators,
            enrichers: self.enrichers,
            async_enrichers: self.async_enrichers,
            required_services: self.required_services,
            business,
        })
    }
}

/// Handles commands of type `C`.
#[async_trait]
pub trait CommandHandler<C: Send + 'static>: Send + Sync {
    /// Value returned by the business method.
    type Output: Send;

    /// Runs the command to completion.
    async fn handle(&self, command: C) -> CommandResult<CommandOutcome<Self::Output>>;
}

enum Pending {
    Nothing,
    Stream(Vec<NewEvent>),
    Transaction(Transaction),
}

/// Runs commands of type `C` against log `L`.
pub struct CommandPipeline<C: Command, L> {
    log: L,
    services: Arc<dyn ServiceProvider>,
    tracker: Arc<dyn ConcurrencyTracker>,
    descriptor: CommandDescriptor<C>,
    factory: Arc<AggregateFactory<C::Aggregate>>,
}

impl<C: Command, L> fmt::Debug for CommandPipeline<C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("descriptor", &self.descriptor)
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

async fn race<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = CommandResult<T>>,
) -> CommandResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CommandError::Cancelled),
        result = operation => result,
    }
}

fn ensure_active(cancel: &CancellationToken) -> CommandResult<()> {
    if cancel.is_cancelled() {
        return Err(CommandError::Cancelled);
    }
    Ok(())
}

fn load_error(err: RehydrationError) -> CommandError {
    match err {
        RehydrationError::Log(err) => err.into(),
        RehydrationError::Cancelled(_) => CommandError::Cancelled,
        other => CommandError::Rehydration(other),
    }
}

fn expected_of(expected: ExpectedRevision) -> Option<StreamRevision> {
    match expected {
        ExpectedRevision::Exact(revision) => Some(revision),
        ExpectedRevision::NoStream | ExpectedRevision::Any => None,
    }
}

impl<C: Command, L: EventLog> CommandPipeline<C, L> {
    /// Builds `C`'s descriptor and binds its aggregate's transitions.
    ///
    /// # Errors
    /// `RegistrationError` if the descriptor or transition table is malformed
    /// or a declared service is missing.
    pub fn new(log: L, services: Arc<dyn ServiceProvider>) -> Result<Self, RegistrationError> {
        let descriptor = C::descriptor()?;
        let factory = Arc::new(AggregateFactory::new(services.as_ref())?);
        Self::from_parts(log, services, descriptor, factory)
    }

    /// Uses an explicit descriptor and an already bound factory.
    ///
    /// # Errors
    /// `MissingService` if the descriptor requires a service `services` lacks.
    pub fn from_parts(
        log: L,
        services: Arc<dyn ServiceProvider>,
        descriptor: CommandDescriptor<C>,
        factory: Arc<AggregateFactory<C::Aggregate>>,
    ) -> Result<Self, RegistrationError> {
        if let Some(missing) = descriptor
            .required_services
            .iter()
            .find(|key| services.resolve(**key).is_none())
        {
            return Err(RegistrationError::MissingService {
                requested_by: std::any::type_name::<C>().to_string(),
                service: missing.name(),
            });
        }

        Ok(Self {
            log,
            services,
            tracker: Arc::new(NoConcurrencyTracker),
            descriptor,
            factory,
        })
    }

    /// Replaces the concurrency tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn ConcurrencyTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// The log commands are committed to.
    pub const fn log(&self) -> &L {
        &self.log
    }

    /// Runs `command`, abandoning it if `cancel` fires before commit.
    #[instrument(
        name = "command.handle",
        skip_all,
        fields(
            command_type = std::any::type_name::<C>(),
            aggregate_type = self.factory.aggregate_type(),
            stream_id = tracing::field::Empty,
        )
    )]
    pub async fn handle_with_cancellation(
        &self,
        command: C,
        cancel: &CancellationToken,
    ) -> CommandResult<CommandOutcome<C::Output>> {
        let started = Instant::now();
        let command = Arc::new(command);

        match self.run(command, cancel).await {
            Ok(outcome) => {
                info!(
                    committed = outcome.is_committed(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "command handled"
                );
                Ok(outcome)
            }
            Err(err) => {
                match &err {
                    CommandError::Validation(_) | CommandError::Cancelled => {
                        debug!(error = %err, "command rejected");
                    }
                    CommandError::RevisionConflict { .. }
                    | CommandError::StreamNotFound(_)
                    | CommandError::BusinessRule(_) => {
                        warn!(error = %err, "command failed");
                    }
                    _ => error!(error = %err, "command failed"),
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        command: Arc<C>,
        cancel: &CancellationToken,
    ) -> CommandResult<CommandOutcome<C::Output>> {
        let descriptor = &self.descriptor;

        ensure_active(cancel)?;
        for validator in &descriptor.validators {
            validator(&*command)?;
        }
        for validator in &descriptor.async_validators {
            race(cancel, async {
                validator
                    .validate(&*command, self.services.as_ref())
                    .await
                    .map_err(CommandError::from)
            })
            .await?;
        }

        ensure_active(cancel)?;
        let stream_id = descriptor.stream.resolve(&*command)?;
        Span::current().record("stream_id", tracing::field::display(&stream_id));

        let (expected, aggregate) = match descriptor.kind {
            TargetKind::Create => (None, None),
            TargetKind::Update => {
                ensure_active(cancel)?;
                let expected = self.expected_revision(&stream_id, &command, cancel).await?;
                ensure_active(cancel)?;
                let aggregate = self.load(&stream_id, expected, cancel).await?;
                (Some(expected), Some(aggregate))
            }
        };

        ensure_active(cancel)?;
        let ctx = CommandContext {
            stream_id: stream_id.clone(),
            expected_revision: expected,
            correlation_id: CorrelationId::generate(),
            services: Arc::clone(&self.services),
            cancellation: cancel.clone(),
        };
        let decision = race(cancel, async {
            AssertUnwindSafe((descriptor.business)(Arc::clone(&command), aggregate, ctx.clone()))
                .catch_unwind()
                .await
                .map_err(|panic| {
                    CommandError::Internal(format!(
                        "business method panicked: {}",
                        panic_message(panic)
                    ))
                })
                .and_then(|decision| decision.map_err(CommandError::BusinessRule))
        })
        .await?;

        let (mut pending, value) = match decision {
            Decision::NoEvents => (Pending::Nothing, None),
            Decision::Event(event) => (Pending::Stream(vec![event]), None),
            Decision::Events(events) => (Self::stream_or_nothing(events), None),
            Decision::WithResult { events, result } => (Self::stream_or_nothing(events), Some(result)),
            Decision::Transaction(tx) if tx.is_empty() => (Pending::Nothing, None),
            Decision::Transaction(tx) => (Pending::Transaction(tx), None),
        };

        ensure_active(cancel)?;
        self.enrich(&*command, &ctx, &mut pending).await?;

        ensure_active(cancel)?;
        let outcome = match pending {
            Pending::Nothing => {
                debug!("business method produced no events");
                match value {
                    Some(value) => CommandOutcome::Result {
                        value,
                        revision: expected,
                        committed: false,
                    },
                    None => CommandOutcome::Unchanged { revision: expected },
                }
            }
            Pending::Stream(events) => {
                let count = events.len();
                let revision = match expected {
                    None => self.log.create(&stream_id, events).await?,
                    Some(expected) => {
                        self.log
                            .append(&stream_id, ExpectedRevision::Exact(expected), events)
                            .await?
                    }
                };
                self.tracker
                    .on_updated(&stream_id, &*command, expected, revision);
                debug!(events = count, revision = %revision, "events committed");
                match value {
                    Some(value) => CommandOutcome::Result {
                        value,
                        revision: Some(revision),
                        committed: true,
                    },
                    None => CommandOutcome::Committed { revision },
                }
            }
            Pending::Transaction(tx) => {
                let previous: BTreeMap<StreamId, Option<StreamRevision>> = tx
                    .iter()
                    .map(|(stream, entry)| (stream.clone(), expected_of(entry.expected)))
                    .collect();
                let revisions = self.log.transaction(tx).await?;
                for (stream, revision) in &revisions {
                    let before = previous.get(stream).copied().flatten();
                    self.tracker.on_updated(stream, &*command, before, *revision);
                }
                debug!(streams = revisions.len(), "transaction committed");
                CommandOutcome::Transaction { revisions }
            }
        };

        Ok(outcome)
    }

    fn stream_or_nothing(events: Vec<NewEvent>) -> Pending {
        if events.is_empty() {
            Pending::Nothing
        } else {
            Pending::Stream(events)
        }
    }

    async fn expected_revision(
        &self,
        stream_id: &StreamId,
        command: &C,
        cancel: &CancellationToken,
    ) -> CommandResult<StreamRevision> {
        if let Some(revision) = self.tracker.expected_revision(stream_id, command) {
            debug!(revision = %revision, "expected revision supplied by tracker");
            return Ok(revision);
        }

        race(cancel, async {
            self.log
                .current_revision(stream_id)
                .await
                .map_err(CommandError::from)
                .and_then(|revision| {
                    revision.ok_or_else(|| CommandError::StreamNotFound(stream_id.clone()))
                })
        })
        .await
    }

    async fn load(
        &self,
        stream_id: &StreamId,
        expected: StreamRevision,
        cancel: &CancellationToken,
    ) -> CommandResult<C::Aggregate> {
        let events = self
            .log
            .read_forward(stream_id, ReadRange::all().to_revision(expected));
        let loaded = race(cancel, async {
            self.factory
                .create_from_with_cancellation(stream_id, events, cancel)
                .await
                .map_err(load_error)
        })
        .await?;

        if loaded.revision != expected {
            return Err(CommandError::RevisionConflict {
                stream: stream_id.clone(),
                expected: ExpectedRevision::Exact(expected).to_string(),
                actual: Some(loaded.revision),
            });
        }
        Ok(loaded.aggregate)
    }

    async fn enrich(
        &self,
        command: &C,
        ctx: &CommandContext,
        pending: &mut Pending,
    ) -> CommandResult<()> {
        let descriptor = &self.descriptor;
        if descriptor.enrichers.is_empty() && descriptor.async_enrichers.is_empty() {
            return Ok(());
        }

        let mut targets: Vec<(&StreamId, &mut NewEvent)> = match pending {
            Pending::Nothing => return Ok(()),
            Pending::Stream(events) => events.iter_mut().map(|e| (&ctx.stream_id, e)).collect(),
            Pending::Transaction(tx) => tx.events_mut().collect(),
        };

        for (name, enricher) in &descriptor.enrichers {
            for (stream_id, event) in &mut targets {
                enricher(command, ctx, *stream_id, &mut **event).map_err(|source| {
                    CommandError::Enrichment {
                        enricher: name.clone(),
                        source,
                    }
                })?;
            }
        }
        for enricher in &descriptor.async_enrichers {
            for (stream_id, event) in &mut targets {
                enricher
                    .enrich(command, ctx, *stream_id, &mut **event)
                    .await
                    .map_err(|source| CommandError::Enrichment {
                        enricher: enricher.name().to_string(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Command, L: EventLog> CommandHandler<C> for CommandPipeline<C, L> {
    type Output = C::Output;

    async fn handle(&self, command: C) -> CommandResult<CommandOutcome<C::Output>> {
        self.handle_with_cancellation(command, &CancellationToken::new())
            .await
    }
}
