//! A small banking domain shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rehydrate::{
    Aggregate, Command, CommandDescriptor, CommandPipeline, Decision, Event, EventType, NewEvent,
    RegistrationError, Services, StreamId, StreamSource, Transitions, ValidationError,
};
use rehydrate_memory::InMemoryEventLog;

/// Marker shared by every account event, so handlers can subscribe to all
/// of them at once.
pub trait AccountEvent {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposited {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawn {
    pub amount: u64,
}

/// Stored by an older version of the domain; no transition handles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub owner: String,
}

macro_rules! account_event {
    ($($event:ty),*) => {
        $(
            impl AccountEvent for $event {}

            impl Event for $event {
                fn supertypes(&self) -> Vec<EventType> {
                    vec![EventType::of::<dyn AccountEvent>()]
                }
            }
        )*
    };
}

account_event!(Opened, Deposited, Withdrawn, Renamed);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Account {
    pub owner: String,
    pub balance: u64,
    pub history: Vec<String>,
}

impl Aggregate for Account {
    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn transitions() -> Result<Transitions<Self>, RegistrationError> {
        Transitions::builder()
            .create::<Opened>("opened", |e| Account {
                owner: e.owner.clone(),
                balance: 0,
                history: vec![format!("opened by {}", e.owner)],
            })
            .update::<Deposited>("deposited", |mut account, e| {
                account.balance += e.amount;
                account.history.push(format!("deposited {}", e.amount));
                account
            })
            .try_update::<Withdrawn>("withdrawn", |mut account, e| {
                account.balance = account
                    .balance
                    .checked_sub(e.amount)
                    .ok_or("withdrawal exceeds balance")?;
                account.history.push(format!("withdrew {}", e.amount));
                Ok(account)
            })
            .build()
    }
}

pub fn account_stream(id: &str) -> StreamId {
    StreamId::try_new(format!("account-{id}")).unwrap()
}

fn derived_stream<C: 'static>(id: fn(&C) -> &str) -> StreamSource<C> {
    StreamSource::derived(move |command: &C| StreamId::try_new(format!("account-{}", id(command))))
}

#[derive(Debug, Clone)]
pub struct OpenAccount {
    pub id: String,
    pub owner: String,
}

impl Command for OpenAccount {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::creating(derived_stream(|c: &OpenAccount| &c.id))
            .validate(|c| {
                if c.owner.trim().is_empty() {
                    return Err(ValidationError::for_field("owner", "must not be blank"));
                }
                Ok(())
            })
            .execute(|c, _, _| {
                Ok(Decision::event(Opened {
                    owner: c.owner.clone(),
                }))
            })
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct Deposit {
    pub id: String,
    pub amount: u64,
}

impl Command for Deposit {
    type Aggregate = Account;
    type Output = ();

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(derived_stream(|c: &Deposit| &c.id))
            .validate(|c| {
                if c.amount == 0 {
                    return Err(ValidationError::for_field("amount", "must be positive"));
                }
                Ok(())
            })
            .execute(|c, _, _| Ok(Decision::event(Deposited { amount: c.amount })))
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct Withdraw {
    pub id: String,
    pub amount: u64,
}

impl Command for Withdraw {
    type Aggregate = Account;
    type Output = u64;

    fn descriptor() -> Result<CommandDescriptor<Self>, RegistrationError> {
        CommandDescriptor::updating(derived_stream(|c: &Withdraw| &c.id))
            .execute(|c, account, _| {
                let account = account.ok_or("account not loaded")?;
                let remaining = account
                    .balance
                    .checked_sub(c.amount)
                    .ok_or("insufficient funds")?;
                Ok(Decision::with_result(
                    [NewEvent::new(Withdrawn { amount: c.amount })],
                    remaining,
                ))
            })
            .build()
    }
}

pub type MemoryPipeline<C> = CommandPipeline<C, Arc<InMemoryEventLog>>;

pub fn pipeline<C: Command>(log: &Arc<InMemoryEventLog>) -> MemoryPipeline<C> {
    CommandPipeline::new(Arc::clone(log), Arc::new(Services::new())).unwrap()
}
