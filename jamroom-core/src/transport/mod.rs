//! Relay transport
//!
//! Abstract pub/sub client to a room channel. The relay is the only party
//! that stamps revisions and timestamps; a client's own publishes come back
//! on the broadcast like everyone else's, which is what the echo guard
//! relies on.

mod ws;

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sync::{Participant, RoomEvent, RoomSnapshot, SequencedEvent};

pub use ws::WsTransport;

/// Base delay for reconnect backoff
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Random jitter added on top of each backoff step
const BACKOFF_JITTER_MS: u64 = 500;

/// Transport-related errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("transport closed")]
    Closed,

    #[error("relay rejected us: {0}")]
    Rejected(String),
}

/// What the transport delivers to its consumer, strictly in relay
/// delivery order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A stamped room event
    Event(SequencedEvent),
    /// Connection lost; reconnect with backoff is already underway
    Disconnected,
    /// Re-joined after a drop; the snapshot is current and must be applied
    /// unconditionally
    Reconnected(RoomSnapshot),
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:3000/ws`
    pub relay_url: String,
    /// Connection attempts before an initial join gives up
    pub join_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3000/ws".to_string(),
            join_attempts: 5,
        }
    }
}

/// Pub/sub client to a room channel.
///
/// `join` is idempotent: joining an already-joined room re-fetches the
/// snapshot. `publish` is fire-and-forget; the stamped event comes back on
/// the inbound stream. `take_events` hands out the single inbound queue
/// (once).
pub trait SyncTransport: Send + 'static {
    fn join(
        &mut self,
        room_id: String,
        identity: Participant,
    ) -> BoxFuture<'_, Result<RoomSnapshot, ConnectionError>>;

    fn publish(&self, event: RoomEvent) -> Result<(), ConnectionError>;

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Reconnect delay for the given attempt number: exponential from
/// [`BACKOFF_BASE`] capped at [`BACKOFF_CAP`], plus jitter so a restarted
/// relay is not stampeded.
pub fn reconnect_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let exp = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(5))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    exp + Duration::from_millis(jitter)
}

/// Reconnect schedule: counts completed failures and hands out the delay
/// to sleep before the next attempt. The first delay is [`BACKOFF_BASE`];
/// each following one doubles up to [`BACKOFF_CAP`].
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts so far
    pub fn failures(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, then advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = reconnect_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// A successful connect restarts the schedule
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        for attempt in 0..12 {
            let delay = reconnect_delay(attempt);
            let floor = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(5)).min(BACKOFF_CAP);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(
                delay <= BACKOFF_CAP + Duration::from_millis(BACKOFF_JITTER_MS),
                "attempt {attempt}: {delay:?} above cap"
            );
        }
    }

    #[test]
    fn test_backoff_base_is_one_second() {
        let delay = reconnect_delay(0);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_schedule_starts_at_base_and_doubles() {
        let jitter = Duration::from_millis(BACKOFF_JITTER_MS);
        let mut backoff = Backoff::new();

        let first = backoff.next_delay();
        assert!(first >= BACKOFF_BASE && first < BACKOFF_BASE + jitter);
        assert_eq!(backoff.failures(), 1);

        let second = backoff.next_delay();
        assert!(second >= BACKOFF_BASE * 2 && second < BACKOFF_BASE * 2 + jitter);

        // A successful connect restarts at the base delay.
        backoff.reset();
        let restarted = backoff.next_delay();
        assert!(restarted >= BACKOFF_BASE && restarted < BACKOFF_BASE + jitter);
    }
}
