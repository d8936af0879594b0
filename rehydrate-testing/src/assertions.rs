//! Helpers for waiting on envelopes published by an event log.

use rehydrate::EventEnvelope;
use std::time::Duration;
use tokio::sync::mpsc;

/// Error returned when collecting published envelopes fails.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    /// Timeout expired before collecting the expected number of envelopes.
    #[error("timeout waiting for {expected} envelopes, received {received}")]
    Timeout {
        /// Envelopes asked for
        expected: usize,
        /// Envelopes received before the deadline
        received: usize,
    },

    /// The sending side closed before enough envelopes arrived.
    #[error("publisher closed after {received} of {expected} envelopes")]
    Closed {
        /// Envelopes asked for
        expected: usize,
        /// Envelopes received before the channel closed
        received: usize,
    },
}

/// Collect `count` envelopes from a publisher channel with a timeout.
pub async fn collect_published(
    receiver: &mut mpsc::UnboundedReceiver<EventEnvelope>,
    count: usize,
    timeout: Duration,
) -> Result<Vec<EventEnvelope>, CollectionError> {
    let mut collected = Vec::with_capacity(count);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while collected.len() < count {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(envelope) => collected.push(envelope),
                None => {
                    return Err(CollectionError::Closed {
                        expected: count,
                        received: collected.len(),
                    })
                }
            },
            () = &mut deadline => {
                return Err(CollectionError::Timeout {
                    expected: count,
                    received: collected.len(),
                })
            }
        }
    }
    Ok(collected)
}
