//! Command correlator: matches outbound commands to their acks by sequence
//! number, with timeout (spec §4.7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::CommandError;

/// Outcome delivered to a command's waiter exactly once (spec §3 "In-flight
/// command table").
#[derive(Debug)]
pub enum CommandOutcome {
    Success(Vec<u8>),
    Timeout,
}

struct InFlight {
    sender: oneshot::Sender<CommandOutcome>,
    deadline: Instant,
}

/// Default command timeout (spec §5).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Default)]
pub struct CommandCorrelator {
    in_flight: Mutex<HashMap<u16, InFlight>>,
}

impl CommandCorrelator {
    #[must_use]
    pub fn new() -> Self {
        Self { in_flight: Mutex::new(HashMap::new()) }
    }

    /// Registers a sequence number as awaiting an ack, returning the
    /// receiving half of the channel the result will be delivered on.
    ///
    /// The entry must be inserted *before* the packet is handed to the
    /// socket, so that an ack racing the send can never be dropped for
    /// arriving "too early" (spec §5 ordering guarantee).
    pub async fn register(&self, seq: u16, timeout: Duration) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.in_flight.lock().await.insert(seq, InFlight { sender: tx, deadline });
        rx
    }

    /// Matches an incoming ack by sequence number. Drops and logs the ack
    /// if no matching entry is registered (spec §4.7).
    pub async fn complete(&self, seq: u16, payload: Vec<u8>) {
        let entry = self.in_flight.lock().await.remove(&seq);
        match entry {
            Some(in_flight) => {
                // Ignore send errors: the waiter may have already given up
                // (e.g. the caller dropped the future), which is fine.
                let _ = in_flight.sender.send(CommandOutcome::Success(payload));
            }
            None => {
                debug!(seq, "ack received for unknown or already-resolved sequence number");
            }
        }
    }

    /// Sweeps expired entries, delivering `Timeout` to each. Called from a
    /// reactor tick (spec §4.7, §5).
    pub async fn reap_expired(&self, now: Instant) {
        let mut in_flight = self.in_flight.lock().await;
        let expired: Vec<u16> = in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline < now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(entry) = in_flight.remove(&seq) {
                let _ = entry.sender.send(CommandOutcome::Timeout);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Awaits the outcome of a registered command, translating a dropped sender
/// (correlator shut down mid-wait) into [`CommandError::Cancelled`].
pub async fn await_outcome(rx: oneshot::Receiver<CommandOutcome>) -> Result<CommandOutcome, CommandError> {
    rx.await.map_err(|_| {
        warn!("command waiter dropped before resolution");
        CommandError::Cancelled
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_delivers_success_and_clears_entry() {
        let correlator = CommandCorrelator::new();
        let rx = correlator.register(1, DEFAULT_TIMEOUT).await;
        correlator.complete(1, vec![0x00]).await;
        let outcome = await_outcome(rx).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Success(p) if p == vec![0x00]));
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn expired_entry_delivers_timeout() {
        let correlator = CommandCorrelator::new();
        let rx = correlator.register(7, Duration::from_millis(0)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        correlator.reap_expired(Instant::now()).await;
        let outcome = await_outcome(rx).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Timeout));
        assert!(correlator.is_empty().await);
    }

    #[tokio::test]
    async fn ack_wins_when_racing_reap() {
        let correlator = CommandCorrelator::new();
        let rx = correlator.register(3, Duration::from_millis(0)).await;
        // Ack arrives first even though the deadline has technically passed;
        // `complete` runs to completion (removes the entry) before `reap_expired`
        // gets the lock, so the entry is gone by the time the sweep looks.
        correlator.complete(3, vec![0xFF]).await;
        correlator.reap_expired(Instant::now()).await;
        let outcome = await_outcome(rx).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Success(_)));
    }

    #[tokio::test]
    async fn unknown_ack_is_dropped_without_panic() {
        let correlator = CommandCorrelator::new();
        correlator.complete(99, vec![]).await; // no registration for seq 99
        assert!(correlator.is_empty().await);
    }
}
