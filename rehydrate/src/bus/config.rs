//! Dispatch bus configuration.
//!
//! Every limit is a validated newtype, so a `DispatchConfig` that exists is
//! usable: there is no zero-worker or zero-capacity bus.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of streams whose events are handled concurrently.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 4_096),
    default = 8,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxParallelism(usize);

/// Maximum number of envelopes queued or in flight across all streams.
///
/// Producers wait in `submit` once the bus holds this many.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    default = 1_024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BufferCapacity(usize);

/// Envelopes one worker handles for a stream before giving up its slot.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 32,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct DrainBatch(usize);

/// Limit for a single handler invocation in milliseconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct HandlerTimeoutMs(u64);

impl HandlerTimeoutMs {
    /// Convert to Duration for use with tokio::time::timeout.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// What a handler failure does to the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Log the failure and carry on.
    #[default]
    Contain,
    /// Fault the bus: reject new submissions and report the failure from
    /// `completion()` once queued work has drained.
    Propagate,
}

/// Dispatch bus configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrently handled streams.
    pub max_parallelism: MaxParallelism,
    /// Envelopes held before producers wait.
    pub buffer_capacity: BufferCapacity,
    /// Envelopes per worker turn.
    pub drain_batch: DrainBatch,
    /// Per-invocation limit, none by default.
    pub handler_timeout: Option<HandlerTimeoutMs>,
    /// Reaction to handler failures.
    pub error_policy: HandlerErrorPolicy,
}

impl DispatchConfig {
    /// Default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrently handled streams.
    #[must_use]
    pub const fn with_max_parallelism(mut self, max_parallelism: MaxParallelism) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Sets the buffer capacity.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, buffer_capacity: BufferCapacity) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Sets the drain batch.
    #[must_use]
    pub const fn with_drain_batch(mut self, drain_batch: DrainBatch) -> Self {
        self.drain_batch = drain_batch;
        self
    }

    /// Sets the per-invocation limit.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Option<HandlerTimeoutMs>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub const fn with_error_policy(mut self, error_policy: HandlerErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}
