//! Behavioural contract for [`EventLog`] implementations.
//!
//! Each `test_*` function runs one scenario against a fresh log built by the
//! supplied factory and reports a [`ContractTestFailure`] naming the scenario
//! on violation. [`event_log_contract_tests!`](crate::event_log_contract_tests)
//! expands to one `#[tokio::test]` per scenario.

use std::fmt;
use std::sync::Arc;

use futures::TryStreamExt;
use rehydrate::{
    Event, EventEnvelope, EventLog, EventLogError, ExpectedRevision, NewEvent, ReadRange,
    StreamId, StreamRevision, Transaction,
};
use uuid::Uuid;

/// A violated contract scenario.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn log_error(scenario: &'static str, operation: &'static str, error: &EventLogError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

/// Payload written by the contract scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractTestEvent {
    /// Distinguishes events within a scenario
    pub sequence: u32,
}

impl Event for ContractTestEvent {}

fn contract_stream_id(
    scenario: &'static str,
    label: &str,
) -> Result<StreamId, ContractTestFailure> {
    // Include UUID so scenarios never collide in a shared backend
    let raw = format!("contract::{scenario}::{label}::{}", Uuid::now_v7());

    StreamId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct stream id `{raw}`: {error}"),
        )
    })
}

fn contract_events(sequences: std::ops::Range<u32>) -> Vec<NewEvent> {
    sequences
        .map(|sequence| NewEvent::new(ContractTestEvent { sequence }))
        .collect()
}

async fn read_all<L: EventLog>(
    scenario: &'static str,
    log: &L,
    stream_id: &StreamId,
    range: ReadRange,
) -> Result<Vec<EventEnvelope>, ContractTestFailure> {
    log.read_forward(stream_id, range)
        .try_collect()
        .await
        .map_err(|error| ContractTestFailure::log_error(scenario, "read_forward", &error))
}

fn sequences(envelopes: &[EventEnvelope]) -> Vec<u32> {
    envelopes
        .iter()
        .filter_map(|envelope| envelope.event_as::<ContractTestEvent>())
        .map(|event| event.sequence)
        .collect()
}

fn positions(envelopes: &[EventEnvelope]) -> Vec<u64> {
    envelopes
        .iter()
        .map(|envelope| envelope.stream_position().value())
        .collect()
}

/// Created events read back in order at positions 0, 1, 2, ...
pub async fn test_basic_read_write<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "basic_read_write";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "single")?;

    let revision = log
        .create(&stream_id, contract_events(0..3))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;
    if revision != StreamRevision::new(2) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("create of three events returned revision {revision}, expected 2"),
        ));
    }

    let envelopes = read_all(SCENARIO, &log, &stream_id, ReadRange::all()).await?;
    if sequences(&envelopes) != [0, 1, 2] || positions(&envelopes) != [0, 1, 2] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected sequences and positions [0, 1, 2], observed {:?} at {:?}",
                sequences(&envelopes),
                positions(&envelopes)
            ),
        ));
    }

    if envelopes.iter().any(|envelope| envelope.stream_id() != &stream_id) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "envelopes carry a foreign stream id",
        ));
    }

    match log.current_revision(&stream_id).await {
        Ok(Some(current)) if current == revision => Ok(()),
        Ok(other) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("current_revision reported {other:?}, expected Some({revision})"),
        )),
        Err(error) => Err(ContractTestFailure::log_error(
            SCENARIO,
            "current_revision",
            &error,
        )),
    }
}

/// An append with a stale expected revision is rejected and writes nothing.
pub async fn test_concurrent_revision_conflicts<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "concurrent_revision_conflicts";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "shared")?;

    let _ = log
        .create(&stream_id, contract_events(0..2))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    let stale = ExpectedRevision::Exact(StreamRevision::initial());
    match log.append(&stream_id, stale, contract_events(2..3)).await {
        Err(EventLogError::RevisionConflict { actual, .. })
            if actual == Some(StreamRevision::new(1)) => {}
        Err(error) => return Err(ContractTestFailure::log_error(SCENARIO, "append", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected revision conflict but append succeeded",
            ))
        }
    }

    let envelopes = read_all(SCENARIO, &log, &stream_id, ReadRange::all()).await?;
    if envelopes.len() != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected append left {} events, expected 2", envelopes.len()),
        ));
    }
    Ok(())
}

/// Creating a stream that already exists is a revision conflict.
pub async fn test_create_existing_stream_conflicts<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "create_existing_stream_conflicts";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "twice")?;

    let _ = log
        .create(&stream_id, contract_events(0..1))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    match log.create(&stream_id, contract_events(1..2)).await {
        Err(EventLogError::RevisionConflict { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::log_error(SCENARIO, "create", &error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "second create of the same stream succeeded",
        )),
    }
}

/// Of several writers racing with the same expectation, exactly one wins.
pub async fn test_racing_appends_single_winner<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog + 'static,
{
    const SCENARIO: &str = "racing_appends_single_winner";
    const WRITERS: u32 = 8;

    let log = Arc::new(make_log());
    let stream_id = contract_stream_id(SCENARIO, "race")?;

    let _ = log
        .create(&stream_id, contract_events(0..1))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    let expected = ExpectedRevision::Exact(StreamRevision::initial());
    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let log = Arc::clone(&log);
            let stream_id = stream_id.clone();
            tokio::spawn(async move {
                log.append(&stream_id, expected, contract_events(100 + writer..101 + writer))
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for writer in writers {
        match writer.await {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(EventLogError::RevisionConflict { .. })) => {}
            Ok(Err(error)) => {
                return Err(ContractTestFailure::log_error(SCENARIO, "append", &error))
            }
            Err(join) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("writer task failed: {join}"),
                ))
            }
        }
    }

    if winners != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one successful writer, observed {winners}"),
        ));
    }

    let envelopes = read_all(SCENARIO, &*log, &stream_id, ReadRange::all()).await?;
    if envelopes.len() != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("stream holds {} events after the race, expected 2", envelopes.len()),
        ));
    }
    Ok(())
}

/// Writes to one stream are invisible in another.
pub async fn test_stream_isolation<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "stream_isolation";

    let log = make_log();
    let left_stream = contract_stream_id(SCENARIO, "left")?;
    let right_stream = contract_stream_id(SCENARIO, "right")?;

    let _ = log
        .create(&left_stream, contract_events(0..1))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;
    let _ = log
        .create(&right_stream, contract_events(10..12))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    let left = read_all(SCENARIO, &log, &left_stream, ReadRange::all()).await?;
    let right = read_all(SCENARIO, &log, &right_stream, ReadRange::all()).await?;

    if sequences(&left) != [0] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("left stream observed {:?}, expected [0]", sequences(&left)),
        ));
    }
    if sequences(&right) != [10, 11] || positions(&right) != [0, 1] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "right stream observed {:?} at {:?}, expected [10, 11] at [0, 1]",
                sequences(&right),
                positions(&right)
            ),
        ));
    }
    Ok(())
}

/// A missing stream does not exist, has no revision, and cannot be read or
/// appended to at an exact revision.
pub async fn test_missing_stream_reads<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "missing_stream_reads";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "nonexistent")?;

    match log.exists(&stream_id).await {
        Ok(false) => {}
        Ok(true) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "exists reported a stream that was never written",
            ))
        }
        Err(error) => return Err(ContractTestFailure::log_error(SCENARIO, "exists", &error)),
    }

    match log.current_revision(&stream_id).await {
        Ok(None) => {}
        Ok(Some(revision)) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("missing stream reported revision {revision}"),
            ))
        }
        Err(error) => {
            return Err(ContractTestFailure::log_error(
                SCENARIO,
                "current_revision",
                &error,
            ))
        }
    }

    let read: Result<Vec<EventEnvelope>, _> = log
        .read_forward(&stream_id, ReadRange::all())
        .try_collect()
        .await;
    match read {
        Err(EventLogError::StreamNotFound(_)) => {}
        Err(error) => return Err(ContractTestFailure::log_error(SCENARIO, "read_forward", &error)),
        Ok(envelopes) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("reading a missing stream yielded {} events", envelopes.len()),
            ))
        }
    }

    let exact = ExpectedRevision::Exact(StreamRevision::initial());
    match log.append(&stream_id, exact, contract_events(0..1)).await {
        Err(EventLogError::StreamNotFound(_)) => Ok(()),
        Err(error) => Err(ContractTestFailure::log_error(SCENARIO, "append", &error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "append at an exact revision created a missing stream",
        )),
    }
}

/// Empty batches are rejected and create nothing.
pub async fn test_empty_append_rejected<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "empty_append_rejected";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "empty")?;

    match log.create(&stream_id, Vec::new()).await {
        Err(EventLogError::EmptyAppend(_)) => {}
        Err(error) => return Err(ContractTestFailure::log_error(SCENARIO, "create", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "create accepted an empty batch",
            ))
        }
    }

    match log.exists(&stream_id).await {
        Ok(false) => Ok(()),
        Ok(true) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "rejected empty create left a stream behind",
        )),
        Err(error) => Err(ContractTestFailure::log_error(SCENARIO, "exists", &error)),
    }
}

/// Read ranges are inclusive on both ends.
pub async fn test_read_range_bounds<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "read_range_bounds";

    let log = make_log();
    let stream_id = contract_stream_id(SCENARIO, "ranged")?;

    let _ = log
        .create(&stream_id, contract_events(0..5))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    let range = ReadRange::all()
        .from_revision(StreamRevision::new(1))
        .to_revision(StreamRevision::new(3));
    let envelopes = read_all(SCENARIO, &log, &stream_id, range).await?;

    if positions(&envelopes) == [1, 2, 3] {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("range 1..=3 returned positions {:?}", positions(&envelopes)),
        ))
    }
}

/// A transaction with one stale expectation writes nothing at all.
pub async fn test_conflict_preserves_atomicity<F, L>(make_log: F) -> ContractTestResult
where
    F: Fn() -> L,
    L: EventLog,
{
    const SCENARIO: &str = "conflict_preserves_atomicity";

    let log = make_log();
    let existing = contract_stream_id(SCENARIO, "existing")?;
    let fresh = contract_stream_id(SCENARIO, "fresh")?;

    let _ = log
        .create(&existing, contract_events(0..2))
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "create", &error))?;

    let conflicting = Transaction::new()
        .with_stream(fresh.clone(), ExpectedRevision::NoStream, contract_events(0..1))
        .with_stream(
            existing.clone(),
            ExpectedRevision::Exact(StreamRevision::initial()),
            contract_events(2..3),
        );

    match log.transaction(conflicting).await {
        Err(EventLogError::RevisionConflict { .. }) => {}
        Err(error) => return Err(ContractTestFailure::log_error(SCENARIO, "transaction", &error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "transaction with a stale expectation succeeded",
            ))
        }
    }

    let fresh_exists = log
        .exists(&fresh)
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "exists", &error))?;
    if fresh_exists {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "failed transaction partially created a stream",
        ));
    }

    let committed = Transaction::new()
        .with_stream(fresh.clone(), ExpectedRevision::NoStream, contract_events(0..1))
        .with_stream(
            existing.clone(),
            ExpectedRevision::Exact(StreamRevision::new(1)),
            contract_events(2..3),
        );
    let revisions = log
        .transaction(committed)
        .await
        .map_err(|error| ContractTestFailure::log_error(SCENARIO, "transaction", &error))?;

    if revisions.get(&fresh) == Some(&StreamRevision::initial())
        && revisions.get(&existing) == Some(&StreamRevision::new(2))
    {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("transaction reported revisions {revisions:?}"),
        ))
    }
}

/// Expands to one `#[tokio::test]` per contract scenario.
///
/// ```ignore
/// rehydrate_testing::event_log_contract_tests! {
///     suite = in_memory,
///     make_log = rehydrate_memory::InMemoryEventLog::new,
/// }
/// ```
#[macro_export]
macro_rules! event_log_contract_tests {
    (suite = $suite:ident, make_log = $make_log:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_basic_read_write, test_concurrent_revision_conflicts,
                test_conflict_preserves_atomicity, test_create_existing_stream_conflicts,
                test_empty_append_rejected, test_missing_stream_reads,
                test_racing_appends_single_winner, test_read_range_bounds,
                test_stream_isolation,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn basic_read_write_contract() {
                test_basic_read_write($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_revision_conflicts_contract() {
                test_concurrent_revision_conflicts($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn create_existing_stream_conflicts_contract() {
                test_create_existing_stream_conflicts($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn racing_appends_single_winner_contract() {
                test_racing_appends_single_winner($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stream_isolation_contract() {
                test_stream_isolation($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_stream_reads_contract() {
                test_missing_stream_reads($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn empty_append_rejected_contract() {
                test_empty_append_rejected($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn read_range_bounds_contract() {
                test_read_range_bounds($make_log)
                    .await
                    .expect("event log contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn conflict_preserves_atomicity_contract() {
                test_conflict_preserves_atomicity($make_log)
                    .await
                    .expect("event log contract failed");
            }
        }
    };
}

pub use event_log_contract_tests;
