//! Event metadata carried alongside committed events.
//!
//! Metadata is optional on every envelope. It records correlation, causation
//! and actor information plus free-form entries added by enrichers.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Links related events across command boundaries.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a fresh, time-ordered correlation id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Links an event to whatever caused it (a command, another event).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct CausationId(Uuid);

/// Identifies the user or system actor responsible for an event.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ActorId(String);

/// Contextual information attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Links events in the same logical workflow
    pub correlation_id: Option<CorrelationId>,
    /// Links this event to its direct cause
    pub causation_id: Option<CausationId>,
    /// The actor that produced the event
    pub actor_id: Option<ActorId>,
    /// Additional custom metadata
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl EventMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id.
    #[must_use]
    pub const fn with_causation_id(mut self, causation_id: CausationId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Sets the actor id.
    #[must_use]
    pub fn with_actor_id(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Adds a custom entry, replacing any previous value for `key`.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Looks up a custom entry.
    pub fn custom(&self, key: &str) -> Option<&str> {
        self.custom.get(key).map(String::as_str)
    }
}
