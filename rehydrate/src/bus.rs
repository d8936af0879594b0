//! Ordered, bounded-parallel delivery of committed events to handlers.
//!
//! Every stream is a partition with its own FIFO queue. At most one worker
//! drains a partition at a time, so events of one stream reach handlers in
//! submission order and never concurrently. Distinct streams are drained in
//! parallel, up to `max_parallelism` workers. A worker handles at most
//! `drain_batch` envelopes before handing its slot to another stream.
//!
//! The bus holds at most `buffer_capacity` envelopes (queued or in flight);
//! `submit` waits for room instead of dropping.
//!
//! ```rust,ignore
//! let bus = DispatchBus::new(Arc::new(registry), DispatchConfig::default());
//! for envelope in envelopes {
//!     bus.submit(envelope).await?;
//! }
//! bus.complete();
//! bus.completion().await?;
//! ```

pub mod config;

pub use config::{
    BufferCapacity, DispatchConfig, DrainBatch, HandlerErrorPolicy, HandlerTimeoutMs, MaxParallelism,
};

use crate::errors::{panic_message, DispatchError, HandlerError};
use crate::event::EventEnvelope;
use crate::handler::EventHandler;
use crate::resolution::HandlerRegistry;
use crate::types::StreamId;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Instrument};

/// Handler name reported for a panic raised while resolving handlers.
pub const DISPATCH: &str = "<dispatch>";

/// Lifecycle of a dispatch bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Submissions are accepted
    Accepting,
    /// `complete()` was called; queued envelopes are still being handled
    Draining,
    /// Every submitted envelope has been handled
    Completed,
    /// A handler failed under [`HandlerErrorPolicy::Propagate`]
    Faulted,
}

#[derive(Debug, Clone)]
struct Progress {
    pending: usize,
    state: BusState,
    fault: Option<HandlerError>,
}

struct Queued {
    envelope: EventEnvelope,
    _slot: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Partition {
    queue: VecDeque<Queued>,
    scheduled: bool,
}

struct Inner {
    config: DispatchConfig,
    registry: Arc<HandlerRegistry>,
    partitions: Mutex<HashMap<StreamId, Partition>>,
    capacity: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

/// Delivers envelopes to the handlers resolved for them.
#[derive(Clone)]
pub struct DispatchBus {
    inner: Arc<Inner>,
}

impl fmt::Debug for DispatchBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.inner.progress.borrow();
        f.debug_struct("DispatchBus")
            .field("state", &progress.state)
            .field("pending", &progress.pending)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DispatchBus {
    /// Creates a bus over `registry`. Must be used inside a Tokio runtime.
    pub fn new(registry: Arc<HandlerRegistry>, config: DispatchConfig) -> Self {
        let (progress, _) = watch::channel(Progress {
            pending: 0,
            state: BusState::Accepting,
            fault: None,
        });
        Self {
            inner: Arc::new(Inner {
                capacity: Arc::new(Semaphore::new(config.buffer_capacity.into_inner())),
                workers: Arc::new(Semaphore::new(config.max_parallelism.into_inner())),
                config,
                registry,
                partitions: Mutex::new(HashMap::new()),
                progress,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        self.inner.progress.borrow().state
    }

    /// Envelopes submitted but not yet fully handled.
    pub fn pending(&self) -> usize {
        self.inner.progress.borrow().pending
    }

    /// Queues `envelope` behind earlier envelopes of the same stream.
    ///
    /// Waits while the bus is at capacity.
    ///
    /// # Errors
    /// `Closed` after [`complete`](Self::complete), `Faulted` after a
    /// propagated handler failure.
    pub async fn submit(&self, envelope: EventEnvelope) -> Result<(), DispatchError> {
        self.inner.check_accepting()?;

        let slot = Arc::clone(&self.inner.capacity)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Closed)?;

        // Re-checked atomically with the pending count, since the bus may have
        // closed while this producer waited for room.
        let mut rejected = None;
        self.inner.progress.send_if_modified(|progress| match progress.state {
            BusState::Accepting => {
                progress.pending += 1;
                true
            }
            BusState::Faulted => {
                rejected = progress.fault.clone().map(DispatchError::Faulted);
                false
            }
            BusState::Draining | BusState::Completed => {
                rejected = Some(DispatchError::Closed);
                false
            }
        });
        if let Some(err) = rejected {
            return Err(err);
        }

        let stream_id = envelope.stream_id().clone();
        trace!(
            stream_id = %stream_id,
            stream_position = %envelope.stream_position(),
            "envelope queued"
        );

        let spawn = {
            let mut partitions = self.inner.partitions.lock();
            let partition = partitions.entry(stream_id.clone()).or_default();
            partition.queue.push_back(Queued {
                envelope,
                _slot: slot,
            });
            !std::mem::replace(&mut partition.scheduled, true)
        };
        if spawn {
            let span = tracing::debug_span!("dispatch.partition", stream_id = %stream_id);
            tokio::spawn(Arc::clone(&self.inner).drain(stream_id).instrument(span));
        }
        Ok(())
    }

    /// Stops accepting submissions. Queued envelopes are still handled.
    pub fn complete(&self) {
        self.inner.progress.send_if_modified(|progress| {
            if progress.state != BusState::Accepting {
                return false;
            }
            progress.state = if progress.pending == 0 {
                BusState::Completed
            } else {
                BusState::Draining
            };
            true
        });
        debug!("dispatch bus completing");
    }

    /// Waits until every envelope is handled after [`complete`](Self::complete),
    /// or until a faulted bus has drained.
    ///
    /// # Errors
    /// `Faulted` with the first propagated handler failure.
    pub async fn completion(&self) -> Result<(), DispatchError> {
        let mut progress = self.inner.progress.subscribe();
        let settled = progress
            .wait_for(|p| {
                p.pending == 0 && matches!(p.state, BusState::Completed | BusState::Faulted)
            })
            .await
            .map_err(|_| DispatchError::Closed)?;

        match &settled.fault {
            Some(fault) => Err(DispatchError::Faulted(fault.clone())),
            None => Ok(()),
        }
    }

    /// Cancels in-flight and future handler invocations.
    ///
    /// Cancelled invocations count as handler failures.
    pub fn cancel(&self) {
        debug!("dispatch bus cancelled");
        self.inner.cancel.cancel();
    }

    /// Submits everything received on `receiver` until it closes.
    ///
    /// Pairs with a log that publishes committed envelopes to a channel.
    pub fn forward(
        &self,
        mut receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    ) -> JoinHandle<Result<(), DispatchError>> {
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                bus.submit(envelope).await?;
            }
            Ok(())
        })
    }
}

impl Inner {
    fn check_accepting(&self) -> Result<(), DispatchError> {
        let progress = self.progress.borrow();
        match progress.state {
            BusState::Accepting => Ok(()),
            BusState::Faulted => Err(progress
                .fault
                .clone()
                .map_or(DispatchError::Closed, DispatchError::Faulted)),
            BusState::Draining | BusState::Completed => Err(DispatchError::Closed),
        }
    }

    async fn drain(self: Arc<Self>, stream_id: StreamId) {
        let batch = self.config.drain_batch.into_inner();
        loop {
            let Ok(_worker) = Arc::clone(&self.workers).acquire_owned().await else {
                return;
            };

            for _ in 0..batch {
                let next = {
                    let mut partitions = self.partitions.lock();
                    let Some(partition) = partitions.get_mut(&stream_id) else {
                        return;
                    };
                    let next = partition.queue.pop_front();
                    if next.is_none() {
                        partitions.remove(&stream_id);
                    }
                    next
                };
                let Some(queued) = next else {
                    trace!("partition drained");
                    return;
                };

                self.dispatch(&queued.envelope).await;
                drop(queued);
                self.finish_one();
            }
            // Give the worker slot to another stream before continuing.
            trace!(batch, "drain batch exhausted, rescheduling");
        }
    }

    /// Runs every resolved handler for `envelope`.
    ///
    /// A panic outside the handler futures (in resolution or a handler's
    /// accessors) is reported like a handler panic so the partition keeps
    /// draining.
    async fn dispatch(&self, envelope: &EventEnvelope) {
        let outcome = AssertUnwindSafe(self.run_handlers(envelope))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            self.report(
                envelope,
                HandlerError::Panicked {
                    handler: DISPATCH.to_string(),
                    stream_id: envelope.stream_id().clone(),
                    position: envelope.stream_position(),
                    event_type: envelope.event_type(),
                    reason: panic_message(panic),
                },
            );
        }
    }

    // The registry selects handlers by lineage already, so `can_handle` is
    // not consulted here.
    async fn run_handlers(&self, envelope: &EventEnvelope) {
        let handlers = self.registry.resolve(envelope);
        for handler in handlers.iter() {
            if let Err(err) = self.invoke(handler.as_ref(), envelope).await {
                self.report(envelope, err);
            }
        }
    }

    fn report(&self, envelope: &EventEnvelope, err: HandlerError) {
        error!(
            handler = err.handler(),
            stream_id = %envelope.stream_id(),
            stream_position = %envelope.stream_position(),
            event_type = envelope.event_type().short_name(),
            error = %err,
            "event handler failed"
        );
        if self.config.error_policy == HandlerErrorPolicy::Propagate {
            self.fault(err);
        }
    }

    async fn invoke(&self, handler: &dyn EventHandler, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let started = Instant::now();
        let id = handler.id();
        let call = AssertUnwindSafe(handler.handle(envelope, &self.cancel)).catch_unwind();
        let timeout = self.config.handler_timeout.map(HandlerTimeoutMs::as_duration);

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            outcome = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                    None => Some(call.await),
                }
            } => Some(outcome),
        };

        let stream_id = envelope.stream_id().clone();
        let position = envelope.stream_position();
        let event_type = envelope.event_type();
        let handler = id.to_string();
        match outcome {
            Some(Some(Ok(Ok(())))) => {
                trace!(
                    handler = %id,
                    elapsed_ms = started.elapsed().as_millis(),
                    "event handled"
                );
                Ok(())
            }
            Some(Some(Ok(Err(reason)))) => Err(HandlerError::Failed {
                handler,
                stream_id,
                position,
                event_type,
                reason: reason.to_string(),
            }),
            Some(Some(Err(panic))) => Err(HandlerError::Panicked {
                handler,
                stream_id,
                position,
                event_type,
                reason: panic_message(panic),
            }),
            Some(None) => Err(HandlerError::TimedOut {
                handler,
                stream_id,
                position,
                event_type,
                timeout: timeout.unwrap_or_default(),
            }),
            None => Err(HandlerError::Cancelled {
                handler,
                stream_id,
                position,
                event_type,
            }),
        }
    }

    fn fault(&self, err: HandlerError) {
        self.progress.send_if_modified(|progress| {
            if progress.state == BusState::Faulted {
                return false;
            }
            progress.state = BusState::Faulted;
            progress.fault = Some(err);
            true
        });
    }

    fn finish_one(&self) {
        self.progress.send_modify(|progress| {
            progress.pending = progress.pending.saturating_sub(1);
            if progress.pending == 0 && progress.state == BusState::Draining {
                progress.state = BusState::Completed;
            }
        });
    }
}
