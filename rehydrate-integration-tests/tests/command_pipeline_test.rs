//! The command pipeline end to end against the in-memory log.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    account_stream, pipeline, Account, Deposit, Deposited, OpenAccount, Opened, Withdraw,
    Withdrawn,
};
use rehydrate::{
    retry_on_conflict, ActorId, CachingConcurrencyTracker, CancellationToken, Command,
    CommandDescriptor, CommandError, CommandHandler, CommandOutcome, CommandPipeline, Decision,
    EventLog, ExpectedRevision, NewEvent, ReadRange, RegistrationError, RetryConfig, RetryPolicy,
    Services, StreamId, StreamRevision, StreamSource, Transaction,
};
use rehydrate_memory::InMemoryEventLog;
use rehydrate_testing::{ChaosConfig, ChaosEventLogExt};
use tokio::sync::Barrier;
use tracing_test::traced_test;

fn rev(value: u64) -> StreamRevision {
    StreamRevision::new(value)
}

async fn open(log: &Arc<InMemoryEventLog>, id: &str) {
    pipeline::<OpenAccount>(log)
        .handle(OpenAccount {
            id: id.into(),
            owner: "ada".into(),
        })
        .await
        .unwrap();
}

fn balance_of(log: &InMemoryEventLog, id: &str) -> u64 {
    log.events(&account_stream(id))
        .iter()
        .map(|envelope| {
            if let Some(deposited) = envelope.event_as::<Deposited>() {
                i128::from(deposited.amount)
            } else if let Some(withdrawn) = envelope.event_as::<Withdrawn>() {
                -i128::from(withdrawn.amount)
            } else {
                0
            }
        })
        .sum::<i128>()
        .try_into()
        .unwrap()
}

#[tokio::test]
#[traced_test]
async fn open_deposit_withdraw_scenario() {
    let log = Arc::new(InMemoryEventLog::new());

    // Given: a freshly opened account
    let opened = pipeline::<OpenAccount>(&log)
        .handle(OpenAccount {
            id: "1".into(),
            owner: "ada".into(),
        })
        .await
        .unwrap();
    assert_eq!(opened, CommandOutcome::Committed { revision: rev(0) });

    // When: money goes in and part of it comes out
    let deposited = pipeline::<Deposit>(&log)
        .handle(Deposit {
            id: "1".into(),
            amount: 100,
        })
        .await
        .unwrap();
    assert_eq!(deposited.revision(), Some(rev(1)));

    let withdrawn = pipeline::<Withdraw>(&log)
        .handle(Withdraw {
            id: "1".into(),
            amount: 30,
        })
        .await
        .unwrap();

    // Then: the business method's result comes back with the new revision
    assert_eq!(
        withdrawn,
        CommandOutcome::Result {
            value: 70,
            revision: Some(rev(2)),
            committed: true,
        }
    );
    assert!(withdrawn.is_committed());
    assert_eq!(log.events(&account_stream("1")).len(), 3);
    assert_eq!(balance_of(&log, "1"), 70);
    assert!(logs_contain("command handled"));
}

#[tokio::test]
async fn validation_failure_writes_nothing() {
    let log = Arc::new(InMemoryEventLog::new());

    let result = pipeline::<OpenAccount>(&log)
        .handle(OpenAccount {
            id: "blank".into(),
            owner: "   ".into(),
        })
        .await;

    match result {
        Err(CommandError::Validation(err)) => {
            assert_eq!(err.field.as_deref(), Some("owner"));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
    assert_eq!(log.stream_count(), 0);

    open(&log, "blank").await;
    let result = pipeline::<Deposit>(&log)
        .handle(Deposit {
            id: "blank".into(),
            amount: 0,
        })
        .await;
    assert!(matches!(result, Err(CommandError::Validation(_))));
    assert_eq!(log.events(&account_stream("blank")).len(), 1);
}

#[tokio::test]
async fn updating_a_missing_stream_is_stream_not_found() {
    let log = Arc::new(InMemoryEventLog::new());

    let result = pipeline::<Deposit>(&log)
        .handle(Deposit {
            id: "ghost".into(),
            amount: 5,
        })
        .await;

    match result {
        Err(CommandError::StreamNotFound(stream)) => assert_eq!(stream, account_stream("ghost")),
        other => panic!("expected StreamNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn creating_an_existing_stream_conflicts() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "twice").await;

    let result = pipeline::<OpenAccount>(&log)
        .handle(OpenAccount {
            id: "twice".into(),
            owner: "grace".into(),
        })
        .await;

    assert!(result.unwrap_err().is_conflict());
    assert_eq!(log.events(&account_stream("twice")).len(), 1);
}

#[tokio::test]
async fn business_rule_rejection_is_reported_verbatim() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "poor").await;

    let err = pipeline::<Withdraw>(&log)
        .handle(Withdraw {
            id: "poor".into(),
            amount: 1,
        })
        .await
        .unwrap_err();

    match err {
        CommandError::BusinessRule(reason) => assert_eq!(reason.to_string(), "insufficient funds"),
        other => panic!("expected BusinessRule, got {other:?}"),
    }
    assert_eq!(log.events(&account_stream("poor")).len(), 1);
}

/// A deposit whose business method waits for a second concurrent deposit
/// before deciding, so both load the same revision.
#[derive(Debug)]
struct RacingDeposit {
    amount: u64,
}

impl Command for RacingDeposit {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(StreamSource::Fixed(account_stream("race")))
            .requires::<Barrier>()
            .execute_async(|command: Arc<Self>, _, ctx| async move {
                let barrier = ctx.service::<Barrier>().ok_or("barrier missing")?;
                let _ = barrier.wait().await;
                Ok(Decision::event(Deposited {
                    amount: command.amount,
                }))
            })
            .build()
    }
}

#[tokio::test]
async fn concurrent_commands_on_one_revision_have_one_winner() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "race").await;

    let services = Arc::new(Services::new().with(Barrier::new(2)));
    let racing = CommandPipeline::<RacingDeposit, _>::new(Arc::clone(&log), services).unwrap();

    let (first, second) = tokio::join!(
        racing.handle(RacingDeposit { amount: 1 }),
        racing.handle(RacingDeposit { amount: 2 }),
    );

    let results = [first, second];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let conflicts: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .collect();

    assert_eq!(committed, 1);
    assert_eq!(conflicts.len(), 1);
    match conflicts[0] {
        CommandError::RevisionConflict { actual, .. } => assert_eq!(*actual, Some(rev(1))),
        other => panic!("expected RevisionConflict, got {other:?}"),
    }
    assert_eq!(log.events(&account_stream("race")).len(), 2);
}

#[test]
fn missing_required_service_fails_at_construction() {
    let log = Arc::new(InMemoryEventLog::new());

    let result = CommandPipeline::<RacingDeposit, _>::new(log, Arc::new(Services::new()));

    assert!(matches!(
        result,
        Err(RegistrationError::MissingService { .. })
    ));
}

/// A deposit that stamps who made it onto every event.
#[derive(Debug)]
struct TellerDeposit {
    id: String,
    teller: String,
}

impl Command for TellerDeposit {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(StreamSource::derived(|c: &Self| {
            StreamId::try_new(format!("account-{}", c.id))
        }))
        .enrich("correlation", |_, ctx, _, event| {
            event.metadata_mut().correlation_id = Some(ctx.correlation_id());
            Ok(())
        })
        .enrich("teller", |command, _, _, event| {
            event.metadata_mut().actor_id = Some(ActorId::try_new(command.teller.clone())?);
            Ok(())
        })
        .execute(|_, _, _| {
            Ok(Decision::events([
                NewEvent::new(Deposited { amount: 10 }),
                NewEvent::new(Deposited { amount: 20 }),
            ]))
        })
        .build()
    }
}

#[tokio::test]
async fn enrichers_stamp_every_pending_event() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "teller").await;

    let outcome = CommandPipeline::<TellerDeposit, _>::new(Arc::clone(&log), Arc::new(Services::new()))
        .unwrap()
        .handle(TellerDeposit {
            id: "teller".into(),
            teller: "grace".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.revision(), Some(rev(2)));

    let events = log.events(&account_stream("teller"));
    let stamped: Vec<_> = events[1..]
        .iter()
        .map(|envelope| envelope.metadata().cloned().unwrap_or_default())
        .collect();

    assert_eq!(stamped.len(), 2);
    assert!(stamped
        .iter()
        .all(|m| m.actor_id.as_ref().map(ToString::to_string).as_deref() == Some("grace")));
    assert!(stamped[0].correlation_id.is_some());
    assert_eq!(stamped[0].correlation_id, stamped[1].correlation_id);
}

#[tokio::test]
async fn failing_enricher_aborts_the_commit() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "nobody").await;

    let result =
        CommandPipeline::<TellerDeposit, _>::new(Arc::clone(&log), Arc::new(Services::new()))
            .unwrap()
            .handle(TellerDeposit {
                id: "nobody".into(),
                teller: String::new(),
            })
            .await;

    match result {
        Err(CommandError::Enrichment { enricher, .. }) => assert_eq!(enricher, "teller"),
        other => panic!("expected Enrichment, got {other:?}"),
    }
    assert_eq!(log.events(&account_stream("nobody")).len(), 1);
}

#[tokio::test]
async fn caching_tracker_skips_lookup_until_stale() {
    let log = Arc::new(InMemoryEventLog::new());
    let tracker = Arc::new(CachingConcurrencyTracker::new());
    let opener = pipeline::<OpenAccount>(&log).with_tracker(tracker.clone());
    let depositor = pipeline::<Deposit>(&log).with_tracker(tracker.clone());

    opener
        .handle(OpenAccount {
            id: "cached".into(),
            owner: "ada".into(),
        })
        .await
        .unwrap();
    let deposit = || Deposit {
        id: "cached".into(),
        amount: 5,
    };
    depositor.handle(deposit()).await.unwrap();
    assert_eq!(tracker.len(), 1);

    // Given: another writer moves the stream behind the tracker's back
    log.append(
        &account_stream("cached"),
        ExpectedRevision::Any,
        vec![NewEvent::new(Deposited { amount: 1 })],
    )
    .await
    .unwrap();

    // Then: the stale expectation is rejected at commit
    let err = depositor.handle(deposit()).await.unwrap_err();
    assert!(err.is_conflict());

    // And: once forgotten, the pipeline asks the log again
    assert_eq!(tracker.forget(&account_stream("cached")), Some(rev(1)));
    let outcome = depositor.handle(deposit()).await.unwrap();
    assert_eq!(outcome.revision(), Some(rev(3)));
}

#[derive(Debug)]
struct Transfer {
    from: String,
    to: String,
    amount: u64,
}

impl Command for Transfer {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(StreamSource::derived(|c: &Self| {
            StreamId::try_new(format!("account-{}", c.from))
        }))
        .execute(|command, account, ctx| {
            let account = account.ok_or("source not loaded")?;
            if account.balance < command.amount {
                return Err("insufficient funds".into());
            }
            let expected = ctx
                .expected_revision()
                .map_or(ExpectedRevision::Any, ExpectedRevision::Exact);
            Ok(Decision::Transaction(
                Transaction::new()
                    .with_stream(
                        ctx.stream_id().clone(),
                        expected,
                        [NewEvent::new(Withdrawn {
                            amount: command.amount,
                        })],
                    )
                    .with_stream(
                        StreamId::try_new(format!("account-{}", command.to))?,
                        ExpectedRevision::Any,
                        [NewEvent::new(Deposited {
                            amount: command.amount,
                        })],
                    ),
            ))
        })
        .build()
    }
}

#[tokio::test]
async fn transaction_decision_commits_every_stream_atomically() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "src").await;
    open(&log, "dst").await;
    pipeline::<Deposit>(&log)
        .handle(Deposit {
            id: "src".into(),
            amount: 50,
        })
        .await
        .unwrap();

    let outcome = pipeline::<Transfer>(&log)
        .handle(Transfer {
            from: "src".into(),
            to: "dst".into(),
            amount: 20,
        })
        .await
        .unwrap();

    match outcome {
        CommandOutcome::Transaction { revisions } => {
            assert_eq!(revisions.get(&account_stream("src")), Some(&rev(2)));
            assert_eq!(revisions.get(&account_stream("dst")), Some(&rev(1)));
        }
        other => panic!("expected Transaction, got {other:?}"),
    }
    assert_eq!(balance_of(&log, "src"), 30);
    assert_eq!(balance_of(&log, "dst"), 20);
}

#[tokio::test]
async fn cancelled_command_never_commits() {
    let log = Arc::new(InMemoryEventLog::new());
    let token = CancellationToken::new();
    token.cancel();

    let result = pipeline::<OpenAccount>(&log)
        .handle_with_cancellation(
            OpenAccount {
                id: "cancelled".into(),
                owner: "ada".into(),
            },
            &token,
        )
        .await;

    assert!(matches!(result, Err(CommandError::Cancelled)));
    assert!(!log.exists(&account_stream("cancelled")).await.unwrap());
}

/// Business method that never finishes on its own.
#[derive(Debug)]
struct Stall;

impl Command for Stall {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(StreamSource::Fixed(account_stream("stall")))
            .execute_async(|_, _, _| async {
                std::future::pending::<()>().await;
                Ok(Decision::NoEvents)
            })
            .build()
    }
}

#[tokio::test]
async fn cancellation_interrupts_a_running_business_method() {
    let log = Arc::new(InMemoryEventLog::new());
    open(&log, "stall").await;
    let token = CancellationToken::new();

    let stalled = pipeline::<Stall>(&log);
    let canceller = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        }
    };
    let (result, ()) = tokio::join!(stalled.handle_with_cancellation(Stall, &token), canceller);

    assert!(matches!(result, Err(CommandError::Cancelled)));
    assert_eq!(log.events(&account_stream("stall")).len(), 1);
}

fn fast_retries(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn retry_rides_out_injected_conflicts() {
    let inner = Arc::new(InMemoryEventLog::new());
    inner
        .create(
            &account_stream("flaky"),
            vec![NewEvent::new(Opened { owner: "ada".into() })],
        )
        .await
        .unwrap();
    let flaky = Arc::clone(&inner).with_chaos(
        ChaosConfig::deterministic()
            .with_seed(7)
            .with_conflict_probability(0.5),
    );
    let depositor =
        CommandPipeline::<Deposit, _>::new(flaky, Arc::new(Services::new())).unwrap();

    for _ in 0..5 {
        retry_on_conflict(&fast_retries(30), &RetryPolicy::default(), || {
            depositor.handle(Deposit {
                id: "flaky".into(),
                amount: 10,
            })
        })
        .await
        .unwrap();
    }

    assert_eq!(balance_of(&inner, "flaky"), 50);
    let revision = inner
        .current_revision(&account_stream("flaky"))
        .await
        .unwrap();
    assert_eq!(revision, Some(rev(5)));
}

#[tokio::test]
async fn retry_gives_up_with_the_last_conflict() {
    let inner = Arc::new(InMemoryEventLog::new());
    inner
        .create(
            &account_stream("doomed"),
            vec![NewEvent::new(Opened { owner: "ada".into() })],
        )
        .await
        .unwrap();
    let doomed = Arc::clone(&inner).with_chaos(ChaosConfig::default().with_conflict_probability(1.0));
    let depositor =
        CommandPipeline::<Deposit, _>::new(doomed, Arc::new(Services::new())).unwrap();

    let err = retry_on_conflict(&fast_retries(3), &RetryPolicy::default(), || {
        depositor.handle(Deposit {
            id: "doomed".into(),
            amount: 10,
        })
    })
    .await
    .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(depositor.log().injected(), 3);
    let stored = inner
        .read_forward(&account_stream("doomed"), ReadRange::all());
    assert_eq!(futures::StreamExt::count(stored).await, 1);
}
