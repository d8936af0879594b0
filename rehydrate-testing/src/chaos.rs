//! Fault injection for event logs.
//!
//! [`ChaosEventLog`] wraps any [`EventLog`] and, with configurable
//! probabilities, fails operations as unavailable or rejects writes with a
//! revision conflict before they reach the wrapped log. Use it to exercise
//! retry loops and error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use nutype::nutype;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use rehydrate::{
    EnvelopeStream, EventLog, EventLogError, EventLogResult, ExpectedRevision, NewEvent,
    ReadRange, StreamId, StreamRevision, Transaction,
};
use tracing::debug;

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// ```ignore
/// use rehydrate_testing::chaos::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f32);

/// How often a [`ChaosEventLog`] misbehaves.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    conflict_probability: Probability,
}

impl ChaosConfig {
    /// A config whose injections repeat from run to run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Seeds the injection sequence.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    /// Chance that any operation fails with [`EventLogError::Unavailable`].
    ///
    /// Values outside [0.0, 1.0] are clamped.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        if let Ok(probability) = Probability::try_new(probability.clamp(0.0, 1.0)) {
            self.failure_probability = probability;
        }
        self
    }

    /// Chance that a write is rejected with [`EventLogError::RevisionConflict`].
    ///
    /// Values outside [0.0, 1.0] are clamped.
    #[must_use]
    pub fn with_conflict_probability(mut self, probability: f32) -> Self {
        if let Ok(probability) = Probability::try_new(probability.clamp(0.0, 1.0)) {
            self.conflict_probability = probability;
        }
        self
    }
}

/// Wraps a log with [`ChaosEventLog`].
pub trait ChaosEventLogExt: Sized {
    /// Wraps `self`.
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventLog<Self>;
}

impl<L: EventLog> ChaosEventLogExt for L {
    fn with_chaos(self, config: ChaosConfig) -> ChaosEventLog<Self> {
        ChaosEventLog::new(self, config)
    }
}

/// An [`EventLog`] that injects failures in front of another log.
#[derive(Debug)]
pub struct ChaosEventLog<L> {
    log: L,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl<L> ChaosEventLog<L> {
    /// Wraps `log`.
    pub fn new(log: L, config: ChaosConfig) -> Self {
        let seed = config.deterministic_seed.unwrap_or_else(random::<u64>);
        Self {
            log,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            injected: AtomicUsize::new(0),
        }
    }

    /// The wrapped log.
    pub const fn inner(&self) -> &L {
        &self.log
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();
        let inject = if probability <= 0.0 {
            false
        } else if probability >= 1.0 {
            true
        } else {
            self.rng.lock().random_bool(f64::from(probability))
        };
        if inject {
            let _ = self.injected.fetch_add(1, Ordering::Relaxed);
        }
        inject
    }

    fn fail(&self, operation: &'static str) -> EventLogResult<()> {
        if self.should_inject(self.config.failure_probability) {
            debug!(operation, "injecting failure");
            return Err(EventLogError::Unavailable(format!(
                "chaos: injected failure during {operation}"
            )));
        }
        Ok(())
    }

    fn conflict(&self, stream_id: &StreamId, expected: ExpectedRevision) -> EventLogResult<()> {
        if self.should_inject(self.config.conflict_probability) {
            debug!(stream_id = %stream_id, "injecting revision conflict");
            return Err(EventLogError::RevisionConflict {
                stream: stream_id.clone(),
                expected: expected.to_string(),
                actual: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<L: EventLog> EventLog for ChaosEventLog<L> {
    async fn exists(&self, stream_id: &StreamId) -> EventLogResult<bool> {
        self.fail("exists")?;
        self.log.exists(stream_id).await
    }

    async fn current_revision(
        &self,
        stream_id: &StreamId,
    ) -> EventLogResult<Option<StreamRevision>> {
        self.fail("current_revision")?;
        self.log.current_revision(stream_id).await
    }

    async fn create(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        self.conflict(stream_id, ExpectedRevision::NoStream)?;
        self.fail("create")?;
        self.log.create(stream_id, events).await
    }

    async fn append(
        &self,
        stream_id: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> EventLogResult<StreamRevision> {
        self.conflict(stream_id, expected)?;
        self.fail("append")?;
        self.log.append(stream_id, expected, events).await
    }

    fn read_forward(&self, stream_id: &StreamId, range: ReadRange) -> EnvelopeStream<'_> {
        match self.fail("read_forward") {
            Ok(()) => self.log.read_forward(stream_id, range),
            Err(error) => stream::iter([Err(error)]).boxed(),
        }
    }

    async fn transaction(
        &self,
        transaction: Transaction,
    ) -> EventLogResult<BTreeMap<StreamId, StreamRevision>> {
        if let Some((stream_id, entry)) = transaction.iter().next() {
            self.conflict(stream_id, entry.expected)?;
        }
        self.fail("transaction")?;
        self.log.transaction(transaction).await
    }
}
