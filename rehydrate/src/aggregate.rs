//! Aggregate rehydration.
//!
//! An aggregate is rebuilt by folding its stream through registered
//! *when-transitions*. Transitions are matched by the exact runtime type of
//! the event payload, never by supertype: an aggregate must register one
//! transition per concrete event type it cares about.
//!
//! Transitions live in two sets:
//!
//! - the **create set** handles the first event of a stream and produces the
//!   initial state
//! - the **update set** handles every later event and folds it into the state
//!
//! Each set may also hold catch-all transitions. They run after the
//! type-specific transition, in declaration order, for every event of their
//! phase.
//!
//! ```rust,ignore
//! let transitions = Transitions::<Account>::builder()
//!     .create::<Opened>("opened", |e| Account::new(&e.owner))
//!     .update::<Deposited>("deposited", |mut account, e| {
//!         account.balance += e.amount;
//!         account
//!     })
//!     .catch_all(Phase::Update, "count", |mut account, _| {
//!         account.events_seen += 1;
//!         Ok(account)
//!     })
//!     .build()?;
//!
//! let factory = transitions.bind(&Services::new())?;
//! let rehydrated = factory.create_from(&stream_id, log.read_forward(&stream_id, ReadRange::all())).await?;
//! ```

use crate::errors::{
    panic_message, BoxError, EventLogResult, RegistrationError, RehydrationError, RehydrationResult,
};
use crate::event::{Event, EventEnvelope, EventType};
use crate::metadata::EventMetadata;
use crate::services::{ServiceKey, ServiceProvider};
use crate::types::{StreamId, StreamRevision};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// A domain type that can be rebuilt from its stream.
pub trait Aggregate: Send + Sized + 'static {
    /// Name used in errors and traces.
    fn aggregate_type() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// The aggregate's when-transitions.
    fn transitions() -> Result<Transitions<Self>, RegistrationError>;
}

/// Aggregate state as of a specific stream revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rehydrated<A> {
    /// The folded state
    pub aggregate: A,
    /// The revision of the last folded event
    pub revision: StreamRevision,
}

impl<A> Rehydrated<A> {
    /// Pairs state with its watermark.
    pub const fn new(aggregate: A, revision: StreamRevision) -> Self {
        Self {
            aggregate,
            revision,
        }
    }

    /// Discards the watermark.
    pub fn into_aggregate(self) -> A {
        self.aggregate
    }
}

/// Whether a transition applies to the first event of a stream or to later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The first event of a stream
    Create,
    /// Every event after the first
    Update,
}

impl Phase {
    const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Whether a transition completes inline or returns a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Runs to completion on the calling task
    Sync,
    /// Returns a future that is awaited
    Async,
}

/// One declared parameter of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The event payload
    Event,
    /// The prior aggregate state
    Aggregate,
    /// An injected service
    Service(ServiceKey),
    /// A cancellation signal
    Cancellation,
}

/// Describes a registered transition without exposing its function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionDescriptor {
    /// Transition name
    pub id: String,
    /// Create or update set
    pub phase: Phase,
    /// Accepted payload type, `None` for catch-alls
    pub event_type: Option<EventType>,
    /// Sync or async
    pub mode: Mode,
    /// Declared parameters, in order
    pub capabilities: Vec<Capability>,
}

/// Data available to asynchronous transitions.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// The stream being folded
    pub stream_id: StreamId,
    /// Position of the event being applied
    pub position: StreamRevision,
    /// Metadata of the event being applied
    pub metadata: Option<EventMetadata>,
    /// Cancelled when the fold is abandoned
    pub cancellation: CancellationToken,
}

type InitFn<A> = Arc<dyn Fn(&EventEnvelope) -> Result<A, BoxError> + Send + Sync>;
type InitAsyncFn<A> =
    Arc<dyn Fn(EventEnvelope, TransitionContext) -> BoxFuture<'static, Result<A, BoxError>> + Send + Sync>;
type FoldFn<A> = Arc<dyn Fn(A, &EventEnvelope) -> Result<A, BoxError> + Send + Sync>;
type FoldAsyncFn<A> = Arc<
    dyn Fn(A, EventEnvelope, TransitionContext) -> BoxFuture<'static, Result<A, BoxError>>
        + Send
        + Sync,
>;

enum Step<A> {
    Init(InitFn<A>),
    InitAsync(InitAsyncFn<A>),
    Fold(FoldFn<A>),
    FoldAsync(FoldAsyncFn<A>),
}

impl<A> Clone for Step<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Init(f) => Self::Init(Arc::clone(f)),
            Self::InitAsync(f) => Self::InitAsync(Arc::clone(f)),
            Self::Fold(f) => Self::Fold(Arc::clone(f)),
            Self::FoldAsync(f) => Self::FoldAsync(Arc::clone(f)),
        }
    }
}

type Binder<A> = Arc<dyn Fn(&dyn ServiceProvider) -> Result<Step<A>, RegistrationError> + Send + Sync>;

struct TransitionDef<A> {
    descriptor: TransitionDescriptor,
    bind: Binder<A>,
}

impl<A> Clone for TransitionDef<A> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            bind: Arc::clone(&self.bind),
        }
    }
}

fn payload<E: Event>(envelope: &EventEnvelope) -> Result<&E, BoxError> {
    envelope.event_as::<E>().ok_or_else(|| {
        format!(
            "payload {} routed to transition for {}",
            envelope.event_type(),
            std::any::type_name::<E>()
        )
        .into()
    })
}

fn shared_payload<E: Event>(envelope: &EventEnvelope) -> Result<Arc<E>, BoxError> {
    let any: Arc<dyn Any + Send + Sync> = envelope.event_arc().into_any_arc();
    any.downcast::<E>().map_err(|_| {
        format!(
            "payload {} routed to transition for {}",
            envelope.event_type(),
            std::any::type_name::<E>()
        )
        .into()
    })
}

fn resolve_service<S: Any + Send + Sync>(
    services: &dyn ServiceProvider,
    requested_by: &str,
) -> Result<Arc<S>, RegistrationError> {
    let key = ServiceKey::of::<S>();
    services
        .resolve(key)
        .and_then(|service| service.downcast::<S>().ok())
        .ok_or_else(|| RegistrationError::MissingService {
            requested_by: requested_by.to_string(),
            service: key.name(),
        })
}

/// The unbound transition table of an aggregate.
pub struct Transitions<A> {
    aggregate_type: &'static str,
    defs: Vec<TransitionDef<A>>,
}

impl<A> Clone for Transitions<A> {
    fn clone(&self) -> Self {
        Self {
            aggregate_type: self.aggregate_type,
            defs: self.defs.clone(),
        }
    }
}

impl<A> fmt::Debug for Transitions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transitions")
            .field("aggregate_type", &self.aggregate_type)
            .field(
                "transitions",
                &self.defs.iter().map(|d| &d.descriptor).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<A: Send + 'static> Transitions<A> {
    /// Starts a table for `A`.
    pub fn builder() -> TransitionsBuilder<A> {
        TransitionsBuilder {
            aggregate_type: std::any::type_name::<A>(),
            defs: Vec::new(),
        }
    }

    /// The aggregate name used in errors and traces.
    pub const fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// Every registered transition, in declaration order.
    pub fn descriptors(&self) -> Vec<TransitionDescriptor> {
        self.defs.iter().map(|d| d.descriptor.clone()).collect()
    }

    /// Resolves every declared service and produces a ready factory.
    ///
    /// # Errors
    /// `MissingService` if a transition declared a service `services` cannot supply.
    pub fn bind(&self, services: &dyn ServiceProvider) -> Result<AggregateFactory<A>, RegistrationError> {
        let mut create = TransitionSet::default();
        let mut update = TransitionSet::default();

        for def in &self.defs {
            let step = (def.bind)(services)?;
            let bound = BoundTransition {
                id: Arc::from(def.descriptor.id.as_str()),
                step,
            };
            let set = match def.descriptor.phase {
                Phase::Create => &mut create,
                Phase::Update => &mut update,
            };
            match def.descriptor.event_type {
                Some(event_type) => {
                    set.specific.insert(event_type.id(), bound);
                }
                None => set.catch_all.push(bound),
            }
        }

        Ok(AggregateFactory {
            aggregate_type: self.aggregate_type,
            create,
            update,
        })
    }
}

/// Registers when-transitions.
pub struct TransitionsBuilder<A> {
    aggregate_type: &'static str,
    defs: Vec<TransitionDef<A>>,
}

impl<A: Send + 'static> TransitionsBuilder<A> {
    /// Overrides the aggregate name used in errors and traces.
    #[must_use]
    pub const fn named(mut self, aggregate_type: &'static str) -> Self {
        self.aggregate_type = aggregate_type;
        self
    }

    fn push(
        mut self,
        id: impl Into<String>,
        phase: Phase,
        event_type: Option<EventType>,
        mode: Mode,
        capabilities: Vec<Capability>,
        bind: Binder<A>,
    ) -> Self {
        self.defs.push(TransitionDef {
            descriptor: TransitionDescriptor {
                id: id.into(),
                phase,
                event_type,
                mode,
                capabilities,
            },
            bind,
        });
        self
    }

    /// Creates the aggregate from the first event when it is an `E`.
    #[must_use]
    pub fn create<E: Event>(
        self,
        id: impl Into<String>,
        f: impl Fn(&E) -> A + Send + Sync + 'static,
    ) -> Self {
        self.try_create::<E>(id, move |event| Ok(f(event)))
    }

    /// Fallible form of [`create`](Self::create).
    #[must_use]
    pub fn try_create<E: Event>(
        self,
        id: impl Into<String>,
        f: impl Fn(&E) -> Result<A, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| {
            let f = Arc::clone(&f);
            Ok(Step::Init(Arc::new(move |envelope: &EventEnvelope| f(payload::<E>(envelope)?))))
        });
        self.push(
            id,
            Phase::Create,
            Some(EventType::of::<E>()),
            Mode::Sync,
            vec![Capability::Event],
            bind,
        )
    }

    /// Creates the aggregate with an injected service `S`.
    #[must_use]
    pub fn create_with<E: Event, S: Any + Send + Sync>(
        self,
        id: impl Into<String>,
        f: impl Fn(&E, &S) -> Result<A, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let id = id.into();
        let requested_by = id.clone();
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |services: &dyn ServiceProvider| {
            let service = resolve_service::<S>(services, &requested_by)?;
            let f = Arc::clone(&f);
            Ok(Step::Init(Arc::new(move |envelope: &EventEnvelope| {
                f(payload::<E>(envelope)?, service.as_ref())
            })))
        });
        self.push(
            id,
            Phase::Create,
            Some(EventType::of::<E>()),
            Mode::Sync,
            vec![Capability::Event, Capability::Service(ServiceKey::of::<S>())],
            bind,
        )
    }

    /// Creates the aggregate asynchronously.
    #[must_use]
    pub fn create_async<E, F, Fut>(self, id: impl Into<String>, f: F) -> Self
    where
        E: Event,
        F: Fn(Arc<E>, TransitionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, BoxError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| {
            let f = Arc::clone(&f);
            Ok(Step::InitAsync(Arc::new(move |envelope, ctx| {
                match shared_payload::<E>(&envelope) {
                    Ok(event) => f(event, ctx).boxed(),
                    Err(error) => futures::future::ready(Err(error)).boxed(),
                }
            })))
        });
        self.push(
            id,
            Phase::Create,
            Some(EventType::of::<E>()),
            Mode::Async,
            vec![Capability::Event, Capability::Cancellation],
            bind,
        )
    }

    /// Folds a later event of type `E` into the state.
    #[must_use]
    pub fn update<E: Event>(
        self,
        id: impl Into<String>,
        f: impl Fn(A, &E) -> A + Send + Sync + 'static,
    ) -> Self {
        self.try_update::<E>(id, move |aggregate, event| Ok(f(aggregate, event)))
    }

    /// Fallible form of [`update`](Self::update).
    #[must_use]
    pub fn try_update<E: Event>(
        self,
        id: impl Into<String>,
        f: impl Fn(A, &E) -> Result<A, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| {
            let f = Arc::clone(&f);
            Ok(Step::Fold(Arc::new(move |aggregate, envelope: &EventEnvelope| {
                f(aggregate, payload::<E>(envelope)?)
            })))
        });
        self.push(
            id,
            Phase::Update,
            Some(EventType::of::<E>()),
            Mode::Sync,
            vec![Capability::Aggregate, Capability::Event],
            bind,
        )
    }

    /// Folds a later event with an injected service `S`.
    #[must_use]
    pub fn update_with<E: Event, S: Any + Send + Sync>(
        self,
        id: impl Into<String>,
        f: impl Fn(A, &E, &S) -> Result<A, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let id = id.into();
        let requested_by = id.clone();
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |services: &dyn ServiceProvider| {
            let service = resolve_service::<S>(services, &requested_by)?;
            let f = Arc::clone(&f);
            Ok(Step::Fold(Arc::new(move |aggregate, envelope: &EventEnvelope| {
                f(aggregate, payload::<E>(envelope)?, service.as_ref())
            })))
        });
        self.push(
            id,
            Phase::Update,
            Some(EventType::of::<E>()),
            Mode::Sync,
            vec![
                Capability::Aggregate,
                Capability::Event,
                Capability::Service(ServiceKey::of::<S>()),
            ],
            bind,
        )
    }

    /// Folds a later event asynchronously.
    #[must_use]
    pub fn update_async<E, F, Fut>(self, id: impl Into<String>, f: F) -> Self
    where
        E: Event,
        F: Fn(A, Arc<E>, TransitionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, BoxError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| {
            let f = Arc::clone(&f);
            Ok(Step::FoldAsync(Arc::new(move |aggregate, envelope, ctx| {
                match shared_payload::<E>(&envelope) {
                    Ok(event) => f(aggregate, event, ctx).boxed(),
                    Err(error) => futures::future::ready(Err(error)).boxed(),
                }
            })))
        });
        self.push(
            id,
            Phase::Update,
            Some(EventType::of::<E>()),
            Mode::Async,
            vec![
                Capability::Aggregate,
                Capability::Event,
                Capability::Cancellation,
            ],
            bind,
        )
    }

    /// Runs for every event of `phase`, after the type-specific transition.
    #[must_use]
    pub fn catch_all(
        self,
        phase: Phase,
        id: impl Into<String>,
        f: impl Fn(A, &EventEnvelope) -> Result<A, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let f: FoldFn<A> = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| Ok(Step::Fold(Arc::clone(&f))));
        self.push(
            id,
            phase,
            None,
            Mode::Sync,
            vec![Capability::Aggregate, Capability::Event],
            bind,
        )
    }

    /// Asynchronous form of [`catch_all`](Self::catch_all).
    #[must_use]
    pub fn catch_all_async<F, Fut>(self, phase: Phase, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(A, EventEnvelope, TransitionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, BoxError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let bind: Binder<A> = Arc::new(move |_: &dyn ServiceProvider| {
            let f = Arc::clone(&f);
            Ok(Step::FoldAsync(Arc::new(move |aggregate, envelope, ctx| {
                f(aggregate, envelope, ctx).boxed()
            })))
        });
        self.push(
            id,
            phase,
            None,
            Mode::Async,
            vec![
                Capability::Aggregate,
                Capability::Event,
                Capability::Cancellation,
            ],
            bind,
        )
    }

    /// Finishes the table.
    ///
    /// # Errors
    /// `DuplicateTransition` if two type-specific transitions of one phase
    /// claim the same event type.
    pub fn build(self) -> Result<Transitions<A>, RegistrationError> {
        let mut claimed: HashMap<(Phase, TypeId), &str> = HashMap::new();
        for def in &self.defs {
            let Some(event_type) = def.descriptor.event_type else {
                continue;
            };
            let key = (def.descriptor.phase, event_type.id());
            if let Some(first) = claimed.insert(key, def.descriptor.id.as_str()) {
                return Err(RegistrationError::DuplicateTransition {
                    phase: def.descriptor.phase.label(),
                    event_type: event_type.name().to_string(),
                    first: first.to_string(),
                    second: def.descriptor.id.clone(),
                });
            }
        }

        Ok(Transitions {
            aggregate_type: self.aggregate_type,
            defs: self.defs,
        })
    }
}

struct BoundTransition<A> {
    id: Arc<str>,
    step: Step<A>,
}

struct TransitionSet<A> {
    specific: HashMap<TypeId, BoundTransition<A>>,
    catch_all: Vec<BoundTransition<A>>,
}

impl<A> Default for TransitionSet<A> {
    fn default() -> Self {
        Self {
            specific: HashMap::new(),
            catch_all: Vec::new(),
        }
    }
}

fn context(envelope: &EventEnvelope, cancel: &CancellationToken) -> TransitionContext {
    TransitionContext {
        stream_id: envelope.stream_id().clone(),
        position: envelope.stream_position(),
        metadata: envelope.metadata().cloned(),
        cancellation: cancel.clone(),
    }
}

impl<A: Send + 'static> BoundTransition<A> {
    async fn apply(
        &self,
        prior: Option<A>,
        envelope: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Result<A, BoxError> {
        match (&self.step, prior) {
            (Step::Init(f), _) => std::panic::catch_unwind(AssertUnwindSafe(|| f(envelope)))
                .map_err(|panic| panic_message(panic).into())
                .and_then(|result| result),
            (Step::InitAsync(f), _) => {
                AssertUnwindSafe(f(envelope.clone(), context(envelope, cancel)))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(panic).into())
                    .and_then(|result| result)
            }
            (Step::Fold(f), Some(aggregate)) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| f(aggregate, envelope)))
                    .map_err(|panic| panic_message(panic).into())
                    .and_then(|result| result)
            }
            (Step::FoldAsync(f), Some(aggregate)) => {
                AssertUnwindSafe(f(aggregate, envelope.clone(), context(envelope, cancel)))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(panic).into())
                    .and_then(|result| result)
            }
            (Step::Fold(_) | Step::FoldAsync(_), None) => {
                Err(format!("transition '{}' requires prior state", self.id).into())
            }
        }
    }
}

/// Folds event streams into `A` using a bound transition table.
pub struct AggregateFactory<A> {
    aggregate_type: &'static str,
    create: TransitionSet<A>,
    update: TransitionSet<A>,
}

impl<A> fmt::Debug for AggregateFactory<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateFactory")
            .field("aggregate_type", &self.aggregate_type)
            .field("create_transitions", &self.create.specific.len())
            .field("update_transitions", &self.update.specific.len())
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> AggregateFactory<A> {
    /// Builds and binds `A`'s transitions.
    ///
    /// # Errors
    /// Propagates `RegistrationError` from building or binding the table.
    pub fn new(services: &dyn ServiceProvider) -> Result<Self, RegistrationError> {
        A::transitions()?.named_as(A::aggregate_type()).bind(services)
    }
}

impl<A: Send + 'static> Transitions<A> {
    fn named_as(mut self, aggregate_type: &'static str) -> Self {
        self.aggregate_type = aggregate_type;
        self
    }
}

impl<A: Send + 'static> AggregateFactory<A> {
    /// The aggregate name used in errors and traces.
    pub const fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// Whether a create transition accepts `event_type`.
    pub fn can_create_from(&self, event_type: EventType) -> bool {
        self.create.specific.contains_key(&event_type.id())
    }

    /// Whether an update transition accepts `event_type`.
    pub fn can_update_from(&self, event_type: EventType) -> bool {
        self.update.specific.contains_key(&event_type.id())
    }

    /// Rebuilds an aggregate from the start of its stream.
    ///
    /// The first envelope goes through the create set and every later one
    /// through the update set.
    pub async fn create_from<S>(&self, stream_id: &StreamId, events: S) -> RehydrationResult<Rehydrated<A>>
    where
        S: Stream<Item = EventLogResult<EventEnvelope>> + Send,
    {
        self.create_from_with_cancellation(stream_id, events, &CancellationToken::new())
            .await
    }

    /// [`create_from`](Self::create_from) honouring a cancellation signal.
    #[instrument(
        name = "rehydrate.create_from",
        skip_all,
        fields(stream_id = %stream_id, aggregate_type = self.aggregate_type)
    )]
    pub async fn create_from_with_cancellation<S>(
        &self,
        stream_id: &StreamId,
        events: S,
        cancel: &CancellationToken,
    ) -> RehydrationResult<Rehydrated<A>>
    where
        S: Stream<Item = EventLogResult<EventEnvelope>> + Send,
    {
        let started = Instant::now();
        let mut events = std::pin::pin!(events);

        let first = match events.next().await {
            Some(envelope) => envelope?,
            None => {
                return Err(RehydrationError::EmptyStream {
                    stream_id: stream_id.clone(),
                    aggregate_type: self.aggregate_type,
                })
            }
        };

        let aggregate = self.apply(Phase::Create, stream_id, None, &first, cancel).await?;
        let created = Rehydrated::new(aggregate, first.stream_position());
        let rehydrated = self.fold_updates(stream_id, events, created, cancel).await?;

        debug!(
            revision = %rehydrated.revision,
            elapsed_ms = started.elapsed().as_millis(),
            "aggregate created from stream"
        );
        Ok(rehydrated)
    }

    /// Folds further events into previously rehydrated state.
    ///
    /// The watermark advances by exactly one per envelope consumed.
    pub async fn update_from<S>(
        &self,
        stream_id: &StreamId,
        events: S,
        prior: Rehydrated<A>,
    ) -> RehydrationResult<Rehydrated<A>>
    where
        S: Stream<Item = EventLogResult<EventEnvelope>> + Send,
    {
        self.update_from_with_cancellation(stream_id, events, prior, &CancellationToken::new())
            .await
    }

    /// [`update_from`](Self::update_from) honouring a cancellation signal.
    #[instrument(
        name = "rehydrate.update_from",
        skip_all,
        fields(stream_id = %stream_id, aggregate_type = self.aggregate_type, from = %prior.revision)
    )]
    pub async fn update_from_with_cancellation<S>(
        &self,
        stream_id: &StreamId,
        events: S,
        prior: Rehydrated<A>,
        cancel: &CancellationToken,
    ) -> RehydrationResult<Rehydrated<A>>
    where
        S: Stream<Item = EventLogResult<EventEnvelope>> + Send,
    {
        let started = Instant::now();
        let events = std::pin::pin!(events);
        let rehydrated = self.fold_updates(stream_id, events, prior, cancel).await?;
        debug!(
            revision = %rehydrated.revision,
            elapsed_ms = started.elapsed().as_millis(),
            "aggregate updated from stream"
        );
        Ok(rehydrated)
    }

    async fn fold_updates<S>(
        &self,
        stream_id: &StreamId,
        mut events: S,
        prior: Rehydrated<A>,
        cancel: &CancellationToken,
    ) -> RehydrationResult<Rehydrated<A>>
    where
        S: Stream<Item = EventLogResult<EventEnvelope>> + Send + Unpin,
    {
        let Rehydrated {
            mut aggregate,
            mut revision,
        } = prior;

        loop {
            if cancel.is_cancelled() {
                return Err(RehydrationError::Cancelled(stream_id.clone()));
            }
            let Some(envelope) = events.next().await else {
                break;
            };
            let envelope = envelope?;
            aggregate = self
                .apply(Phase::Update, stream_id, Some(aggregate), &envelope, cancel)
                .await?;
            revision = revision.next();
        }

        Ok(Rehydrated::new(aggregate, revision))
    }

    async fn apply(
        &self,
        phase: Phase,
        stream_id: &StreamId,
        prior: Option<A>,
        envelope: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> RehydrationResult<A> {
        let set = match phase {
            Phase::Create => &self.create,
            Phase::Update => &self.update,
        };
        let event_type = envelope.event_type();
        let transition =
            set.specific
                .get(&event_type.id())
                .ok_or_else(|| RehydrationError::NoTransition {
                    stream_id: stream_id.clone(),
                    aggregate_type: self.aggregate_type,
                    event_type,
                })?;

        trace!(
            transition = %transition.id,
            stream_position = %envelope.stream_position(),
            event_type = event_type.short_name(),
            "applying transition"
        );
        let mut aggregate = self
            .invoke(transition, stream_id, prior, envelope, cancel)
            .await?;

        for catch_all in &set.catch_all {
            aggregate = self
                .invoke(catch_all, stream_id, Some(aggregate), envelope, cancel)
                .await?;
        }

        Ok(aggregate)
    }

    async fn invoke(
        &self,
        transition: &BoundTransition<A>,
        stream_id: &StreamId,
        prior: Option<A>,
        envelope: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> RehydrationResult<A> {
        transition
            .apply(prior, envelope, cancel)
            .await
            .map_err(|source| RehydrationError::TransitionFailed {
                stream_id: stream_id.clone(),
                aggregate_type: self.aggregate_type,
                transition: transition.id.to_string(),
                source,
            })
    }
}
