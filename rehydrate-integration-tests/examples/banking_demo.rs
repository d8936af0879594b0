//! Banking walkthrough
//!
//! Opens two accounts, moves money through the command pipeline and keeps a
//! balance read model up to date through the dispatch bus.
//!
//! ```text
//! RUST_LOG=rehydrate=debug cargo run -p rehydrate-integration-tests --example banking_demo
//! ```

#[path = "../tests/common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{pipeline, Deposit, Deposited, OpenAccount, Withdraw, Withdrawn};
use parking_lot::Mutex;
use rehydrate::{
    retry_on_conflict, CommandHandler, DispatchBus, DispatchConfig, FnHandler, HandlerRegistry,
    RetryConfig, RetryPolicy,
};
use rehydrate_memory::InMemoryEventLog;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let (publisher, published) = mpsc::unbounded_channel();
    let log = Arc::new(InMemoryEventLog::new().with_publisher(publisher));

    let balances = Arc::new(Mutex::new(BTreeMap::<String, i128>::new()));
    let projection = {
        let balances = Arc::clone(&balances);
        FnHandler::catch_all("balances", move |envelope, _| {
            let delta = envelope
                .event_as::<Deposited>()
                .map(|d| i128::from(d.amount))
                .or_else(|| envelope.event_as::<Withdrawn>().map(|w| -i128::from(w.amount)))
                .unwrap_or_default();
            *balances
                .lock()
                .entry(envelope.stream_id().to_string())
                .or_default() += delta;
            async { Ok(()) }
        })
    };
    let bus = DispatchBus::new(
        Arc::new(HandlerRegistry::new().with(projection)),
        DispatchConfig::default(),
    );
    let forwarding = bus.forward(published);

    let opener = pipeline::<OpenAccount>(&log);
    for (id, owner) in [("alice", "Alice"), ("bob", "Bob")] {
        opener
            .handle(OpenAccount {
                id: id.into(),
                owner: owner.into(),
            })
            .await?;
    }

    let depositor = pipeline::<Deposit>(&log);
    depositor
        .handle(Deposit {
            id: "alice".into(),
            amount: 1_000,
        })
        .await?;
    depositor
        .handle(Deposit {
            id: "bob".into(),
            amount: 250,
        })
        .await?;

    let withdrawer = pipeline::<Withdraw>(&log);
    let remaining = retry_on_conflict(&RetryConfig::default(), &RetryPolicy::default(), || {
        withdrawer.handle(Withdraw {
            id: "alice".into(),
            amount: 300,
        })
    })
    .await?
    .into_value();
    info!(?remaining, "alice withdrew 300");

    match withdrawer
        .handle(Withdraw {
            id: "bob".into(),
            amount: 1_000,
        })
        .await
    {
        Ok(_) => info!("bob overdrew"),
        Err(err) => info!(error = %err, "bob's withdrawal was refused"),
    }

    drop((opener, depositor, withdrawer, log));
    forwarding.await??;
    bus.complete();
    bus.completion().await?;

    for (account, balance) in balances.lock().iter() {
        info!(account = %account, balance = %balance, "read model");
    }
    Ok(())
}
