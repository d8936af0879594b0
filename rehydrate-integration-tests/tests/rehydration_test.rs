//! Rehydration against a real log: stream reads feed the aggregate factory.

mod common;

use common::{account_stream, Account, Deposited, Opened, Renamed, Withdrawn};
use proptest::prelude::*;
use rehydrate::{
    AggregateFactory, EventLog, EventType, ExpectedRevision, NewEvent, ReadRange, RehydrationError,
    Services, StreamRevision,
};
use rehydrate_memory::InMemoryEventLog;

fn factory() -> AggregateFactory<Account> {
    AggregateFactory::new(&Services::new()).unwrap()
}

fn rev(value: u64) -> StreamRevision {
    StreamRevision::new(value)
}

#[tokio::test]
async fn create_then_update_scenario() {
    let log = InMemoryEventLog::new();
    let stream = account_stream("a");
    let factory = factory();

    // Given: a new stream holding only the creation event
    let revision = log
        .create(&stream, vec![NewEvent::new(Opened { owner: "ada".into() })])
        .await
        .unwrap();
    assert_eq!(revision, rev(0));

    // When: rehydrating from the start
    let created = factory
        .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
        .await
        .unwrap();
    assert_eq!(created.revision, rev(0));

    // And: one more event is appended and folded from the watermark onwards
    let revision = log
        .append(
            &stream,
            ExpectedRevision::Exact(created.revision),
            vec![NewEvent::new(Deposited { amount: 40 })],
        )
        .await
        .unwrap();
    assert_eq!(revision, rev(1));

    let tail = ReadRange::all().from_revision(created.revision.next());
    let updated = factory
        .update_from(&stream, log.read_forward(&stream, tail), created)
        .await
        .unwrap();

    // Then: the watermark is 1 and both transitions applied in order
    assert_eq!(updated.revision, rev(1));
    assert_eq!(updated.aggregate.balance, 40);
    assert_eq!(
        updated.aggregate.history,
        ["opened by ada", "deposited 40"]
    );
}

#[tokio::test]
async fn empty_stream_scenario() {
    let factory = factory();
    let stream = account_stream("empty");

    let result = factory
        .create_from(&stream, futures::stream::empty())
        .await;

    assert!(matches!(
        result,
        Err(RehydrationError::EmptyStream { aggregate_type: "Account", .. })
    ));
}

#[tokio::test]
async fn reading_a_missing_stream_surfaces_the_log_error() {
    let log = InMemoryEventLog::new();
    let stream = account_stream("missing");

    let result = factory()
        .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
        .await;

    assert!(matches!(result, Err(RehydrationError::Log(_))));
}

#[tokio::test]
async fn first_event_without_create_transition_is_rejected() {
    let log = InMemoryEventLog::new();
    let stream = account_stream("legacy");
    log.create(&stream, vec![NewEvent::new(Deposited { amount: 1 })])
        .await
        .unwrap();

    let result = factory()
        .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
        .await;

    match result {
        Err(RehydrationError::NoTransition { event_type, .. }) => {
            assert_eq!(event_type, EventType::of::<Deposited>());
        }
        other => panic!("expected NoTransition, got {other:?}"),
    }
}

#[tokio::test]
async fn mid_stream_event_without_update_transition_is_rejected() {
    let log = InMemoryEventLog::new();
    let stream = account_stream("renamed");
    log.create(
        &stream,
        vec![
            NewEvent::new(Opened { owner: "ada".into() }),
            NewEvent::new(Renamed { owner: "grace".into() }),
        ],
    )
    .await
    .unwrap();

    let result = factory()
        .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
        .await;

    assert!(matches!(result, Err(RehydrationError::NoTransition { .. })));
}

#[tokio::test]
async fn failing_transition_reports_its_identity() {
    let log = InMemoryEventLog::new();
    let stream = account_stream("overdrawn");
    log.create(
        &stream,
        vec![
            NewEvent::new(Opened { owner: "ada".into() }),
            NewEvent::new(Withdrawn { amount: 5 }),
        ],
    )
    .await
    .unwrap();

    let result = factory()
        .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
        .await;

    match result {
        Err(RehydrationError::TransitionFailed { transition, .. }) => {
            assert_eq!(transition, "withdrawn");
        }
        other => panic!("expected TransitionFailed, got {other:?}"),
    }
}

async fn seeded_log(deposits: &[u64]) -> InMemoryEventLog {
    let log = InMemoryEventLog::new();
    let mut events = vec![NewEvent::new(Opened { owner: "prop".into() })];
    events.extend(
        deposits
            .iter()
            .map(|amount| NewEvent::new(Deposited { amount: *amount })),
    );
    log.create(&account_stream("prop"), events).await.unwrap();
    log
}

proptest! {
    #[test]
    fn fold_is_deterministic(deposits in prop::collection::vec(1u64..1_000, 0..40)) {
        tokio_test::block_on(async {
            let log = seeded_log(&deposits).await;
            let stream = account_stream("prop");
            let factory = factory();

            let first = factory
                .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
                .await
                .unwrap();
            let second = factory
                .create_from(&stream, log.read_forward(&stream, ReadRange::all()))
                .await
                .unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.revision.value(), deposits.len() as u64);
            prop_assert_eq!(first.aggregate.balance, deposits.iter().sum::<u64>());
            Ok(())
        })?;
    }

    #[test]
    fn update_advances_watermark_by_envelope_count(
        prefix in 0usize..10,
        deposits in prop::collection::vec(1u64..1_000, 0..30),
    ) {
        tokio_test::block_on(async {
            let log = seeded_log(&deposits).await;
            let stream = account_stream("prop");
            let factory = factory();
            let prefix = prefix.min(deposits.len()) as u64;

            let prior = factory
                .create_from(
                    &stream,
                    log.read_forward(&stream, ReadRange::all().to_revision(rev(prefix))),
                )
                .await
                .unwrap();
            let tail = ReadRange::all().from_revision(prior.revision.next());
            let from = prior.revision.value();
            let updated = factory
                .update_from(&stream, log.read_forward(&stream, tail), prior)
                .await
                .unwrap();

            let consumed = deposits.len() as u64 - prefix;
            prop_assert_eq!(updated.revision.value(), from + consumed);
            prop_assert_eq!(updated.aggregate.balance, deposits.iter().sum::<u64>());
            Ok(())
        })?;
    }
}
