//! Echo suppression for self-published events
//!
//! Every publish round-trips through the relay back to the sender. Without
//! suppression, a client's own play/pause would come back looking like an
//! independent external command and double-toggle the audio engine. The
//! guard keeps a short-lived set of pending local intents; a returning event
//! that matches one is a confirmed echo and must not re-drive the engine.

use tracing::debug;

use super::protocol::RoomEvent;

/// How long a pending intent waits for its echo before being treated as a
/// lost publish (generously larger than any plausible relay round trip).
pub const ECHO_TTL_MS: u64 = 4_000;

/// Position tolerance when matching a play-pause echo, after accounting for
/// time elapsed since the intent was published.
pub const ECHO_POSITION_TOLERANCE_SECS: f64 = 1.5;

/// A local intent that has been published but not yet confirmed
#[derive(Debug, Clone)]
struct PendingIntent {
    /// The payload exactly as published
    sent: RoomEvent,
    /// When it was published (unix millis)
    issued_at_ms: u64,
}

/// Pending-intent set with fingerprint matching and expiry.
///
/// All methods take `now_ms` so expiry and elapsed-time tolerance are
/// deterministic under test.
#[derive(Debug, Default)]
pub struct EchoGuard {
    pending: Vec<PendingIntent>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a just-published local intent. Only song-change and play-pause
    /// are suppressible; other kinds are ignored.
    pub fn register(&mut self, event: &RoomEvent, now_ms: u64) {
        if !matches!(
            event,
            RoomEvent::SongChange { .. } | RoomEvent::PlayPause { .. }
        ) {
            return;
        }
        self.pending.push(PendingIntent {
            sent: event.clone(),
            issued_at_ms: now_ms,
        });
    }

    /// Try to consume an inbound event (already known to originate from this
    /// client) as the confirmed echo of a pending intent.
    ///
    /// Returns true if a pending entry matched; the entry is removed and the
    /// caller must not re-apply the event to the audio engine.
    pub fn consume(&mut self, event: &RoomEvent, now_ms: u64) -> bool {
        self.prune(now_ms);

        let idx = self
            .pending
            .iter()
            .position(|p| Self::matches(&p.sent, event, now_ms.saturating_sub(p.issued_at_ms)));

        match idx {
            Some(i) => {
                let p = self.pending.remove(i);
                debug!(
                    kind = event.kind(),
                    elapsed_ms = now_ms.saturating_sub(p.issued_at_ms),
                    "confirmed echo, suppressing"
                );
                true
            }
            None => false,
        }
    }

    /// Drop pending intents whose kind was just superseded by a genuine
    /// remote event. Once the engine has been re-driven by someone else's
    /// command, a pending intent no longer describes the engine, so its late
    /// echo must be applied, not suppressed.
    pub fn invalidate_kind(&mut self, kind: &str) {
        let before = self.pending.len();
        self.pending.retain(|p| p.sent.kind() != kind);
        if self.pending.len() != before {
            debug!(kind, "pending intents superseded by remote event");
        }
    }

    /// Expire entries older than [`ECHO_TTL_MS`] (lost publishes)
    pub fn prune(&mut self, now_ms: u64) {
        self.pending
            .retain(|p| now_ms.saturating_sub(p.issued_at_ms) < ECHO_TTL_MS);
    }

    /// Drop everything (leaving the room)
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of unconfirmed intents
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn matches(sent: &RoomEvent, echoed: &RoomEvent, elapsed_ms: u64) -> bool {
        match (sent, echoed) {
            (
                RoomEvent::SongChange { track: sent_track },
                RoomEvent::SongChange { track: echo_track },
            ) => sent_track.track_id == echo_track.track_id,
            (
                RoomEvent::PlayPause {
                    is_playing: sent_playing,
                    position: sent_pos,
                },
                RoomEvent::PlayPause {
                    is_playing: echo_playing,
                    position: echo_pos,
                },
            ) => {
                if sent_playing != echo_playing {
                    return false;
                }
                // The relay stamps slightly after we published; while playing
                // the expected echoed position advances with wall time.
                let expected = if *sent_playing {
                    sent_pos + elapsed_ms as f64 / 1000.0
                } else {
                    *sent_pos
                };
                (echo_pos - expected).abs() <= ECHO_POSITION_TOLERANCE_SECS
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pause_at(position: f64) -> RoomEvent {
        RoomEvent::PlayPause {
            is_playing: false,
            position,
        }
    }

    fn play_at(position: f64) -> RoomEvent {
        RoomEvent::PlayPause {
            is_playing: true,
            position,
        }
    }

    #[test]
    fn test_exact_echo_is_consumed_once() {
        let mut guard = EchoGuard::new();
        guard.register(&pause_at(10.0), 1_000);

        assert!(guard.consume(&pause_at(10.0), 1_100));
        // Entry removed; the same payload again is not an echo
        assert!(!guard.consume(&pause_at(10.0), 1_200));
    }

    #[test]
    fn test_position_tolerance_accounts_for_elapsed_time() {
        let mut guard = EchoGuard::new();
        guard.register(&play_at(100.0), 0);

        // 2s later the expected echoed position is 102.0; 103.0 is within
        // the 1.5s band, 104.0 is not.
        assert!(guard.consume(&play_at(103.0), 2_000));

        guard.register(&play_at(100.0), 0);
        assert!(!guard.consume(&play_at(104.0), 2_000));
    }

    #[test]
    fn test_diverged_payload_is_not_an_echo() {
        let mut guard = EchoGuard::new();
        guard.register(&play_at(0.0), 0);

        // Same kind, opposite play state: someone else's command won the race
        assert!(!guard.consume(&pause_at(0.0), 100));
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let mut guard = EchoGuard::new();
        guard.register(&pause_at(5.0), 0);

        assert!(!guard.consume(&pause_at(5.0), ECHO_TTL_MS + 1));
        assert_eq!(guard.pending_len(), 0);
    }

    #[test]
    fn test_invalidate_kind_drops_superseded_intents() {
        let mut guard = EchoGuard::new();
        guard.register(&pause_at(0.0), 0);
        guard.invalidate_kind("play-pause");

        assert!(!guard.consume(&pause_at(0.0), 100));
    }

    #[test]
    fn test_clear_on_leave() {
        let mut guard = EchoGuard::new();
        guard.register(&pause_at(1.0), 0);
        guard.register(&play_at(2.0), 0);
        guard.clear();
        assert_eq!(guard.pending_len(), 0);
    }
}
