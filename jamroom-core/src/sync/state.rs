//! Room State Management
//!
//! `RoomPlaybackState` is the relay-authoritative fact about what the room
//! is playing; `LocalPlaybackState` is one client's private mirror of it.

use serde::{Deserialize, Serialize};

use super::protocol::{RoomEvent, SequencedEvent, TrackRef};

/// The shared, eventually-consistent room fact.
///
/// A room has exactly one of these at any revision. Clients never mutate it
/// directly; they propose events via publish and accept the relay's stamped
/// rebroadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPlaybackState {
    /// Current track, absent until the first song-change
    pub track: Option<TrackRef>,
    /// Whether the room is playing
    pub is_playing: bool,
    /// Position in seconds, meaningful only paired with `updated_at_ms`
    pub position: f64,
    /// Relay-assigned revision of the event that produced this state
    pub revision: u64,
    /// Who issued that event (diagnostic, not authority)
    pub origin_client_id: Option<String>,
    /// Relay clock when that event was accepted (unix millis)
    pub updated_at_ms: u64,
}

impl RoomPlaybackState {
    /// State of a freshly opened room: revision 0, no track
    pub fn new(now_ms: u64) -> Self {
        Self {
            track: None,
            is_playing: false,
            position: 0.0,
            revision: 0,
            origin_client_id: None,
            updated_at_ms: now_ms,
        }
    }

    /// Position extrapolated to `now_ms`.
    ///
    /// `position` is only trusted at the instant `updated_at_ms` was
    /// observed; while playing, elapsed wall time is added before any
    /// comparison against a local position.
    pub fn extrapolated_position(&self, now_ms: u64) -> f64 {
        if self.is_playing {
            self.position + now_ms.saturating_sub(self.updated_at_ms) as f64 / 1000.0
        } else {
            self.position
        }
    }

    /// Fold a stamped event into the room fact.
    ///
    /// Used by the relay when it sequences an event, and by clients to keep
    /// their mirror current. `time-sync` and roster/chat events never touch
    /// the track or play state.
    pub fn apply(&mut self, ev: &SequencedEvent) {
        self.revision = ev.revision;
        self.updated_at_ms = ev.updated_at_ms;
        self.origin_client_id = Some(ev.origin_client_id.clone());

        match &ev.event {
            RoomEvent::SongChange { track } => {
                self.track = Some(track.clone());
                // Relay convention: a new song starts playing from zero
                self.position = 0.0;
                self.is_playing = true;
            }
            RoomEvent::PlayPause {
                is_playing,
                position,
            } => {
                self.is_playing = *is_playing;
                self.position = *position;
            }
            RoomEvent::TimeSync { position } => {
                self.position = *position;
            }
            RoomEvent::ParticipantJoined { .. }
            | RoomEvent::ParticipantLeft { .. }
            | RoomEvent::ChatMessage { .. } => {}
        }
    }
}

/// A client's private playback mirror.
///
/// Tracks the highest relay revision this client has applied; anything at or
/// below it is stale and discarded.
#[derive(Debug, Clone, Default)]
pub struct LocalPlaybackState {
    /// Mirrored current track
    pub track: Option<TrackRef>,
    /// Mirrored play state
    pub is_playing: bool,
    /// Mirrored position (seconds) as of the last applied event
    pub position: f64,
    /// Highest relay revision applied this session (non-decreasing)
    pub last_applied_revision: u64,
}

impl LocalPlaybackState {
    /// Seed the mirror from a join snapshot. Snapshots are authoritative,
    /// so this bumps `last_applied_revision` unconditionally.
    pub fn seed(&mut self, state: &RoomPlaybackState) {
        self.track = state.track.clone();
        self.is_playing = state.is_playing;
        self.position = state.position;
        self.last_applied_revision = state.revision;
    }

    /// Check whether an inbound revision is stale (already reflected here)
    pub fn is_stale(&self, revision: u64) -> bool {
        revision <= self.last_applied_revision
    }

    /// Record a stamped event in the mirror. Caller has already checked
    /// staleness; this only keeps the mirror fields in step.
    pub fn observe(&mut self, ev: &SequencedEvent) {
        debug_assert!(ev.revision > self.last_applied_revision);
        self.last_applied_revision = ev.revision;

        match &ev.event {
            RoomEvent::SongChange { track } => {
                self.track = Some(track.clone());
                self.position = 0.0;
                self.is_playing = true;
            }
            RoomEvent::PlayPause {
                is_playing,
                position,
            } => {
                self.is_playing = *is_playing;
                self.position = *position;
            }
            RoomEvent::TimeSync { position } => {
                self.position = *position;
            }
            RoomEvent::ParticipantJoined { .. }
            | RoomEvent::ParticipantLeft { .. }
            | RoomEvent::ChatMessage { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_pause(revision: u64, at_ms: u64, is_playing: bool, position: f64) -> SequencedEvent {
        SequencedEvent {
            revision,
            updated_at_ms: at_ms,
            origin_client_id: "c1".into(),
            event: RoomEvent::PlayPause {
                is_playing,
                position,
            },
        }
    }

    #[test]
    fn test_new_room_is_empty_at_revision_zero() {
        let state = RoomPlaybackState::new(1_000);
        assert_eq!(state.revision, 0);
        assert!(state.track.is_none());
        assert!(!state.is_playing);
    }

    #[test]
    fn test_extrapolation_only_while_playing() {
        let mut state = RoomPlaybackState::new(0);
        state.apply(&play_pause(1, 10_000, true, 100.0));
        assert!((state.extrapolated_position(11_000) - 101.0).abs() < 1e-9);

        state.apply(&play_pause(2, 20_000, false, 50.0));
        assert!((state.extrapolated_position(25_000) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_song_change_convention() {
        let mut state = RoomPlaybackState::new(0);
        state.apply(&play_pause(1, 1_000, false, 33.0));

        let track = TrackRef {
            track_id: "t9".into(),
            stream_url: Some("https://cdn.example/t9".into()),
            title: "Nine".into(),
            artist: "A".into(),
            artwork_url: String::new(),
        };
        state.apply(&SequencedEvent {
            revision: 2,
            updated_at_ms: 2_000,
            origin_client_id: "c2".into(),
            event: RoomEvent::SongChange {
                track: track.clone(),
            },
        });

        assert_eq!(state.track, Some(track));
        assert_eq!(state.position, 0.0);
        assert!(state.is_playing);
        assert_eq!(state.revision, 2);
    }

    #[test]
    fn test_time_sync_never_changes_play_state() {
        let mut state = RoomPlaybackState::new(0);
        state.apply(&play_pause(1, 1_000, false, 10.0));
        state.apply(&SequencedEvent {
            revision: 2,
            updated_at_ms: 2_000,
            origin_client_id: "c1".into(),
            event: RoomEvent::TimeSync { position: 77.0 },
        });
        assert!(!state.is_playing);
        assert_eq!(state.position, 77.0);
    }

    #[test]
    fn test_local_stale_guard() {
        let mut local = LocalPlaybackState::default();
        local.observe(&play_pause(5, 1_000, true, 1.0));
        assert!(local.is_stale(5));
        assert!(local.is_stale(4));
        assert!(!local.is_stale(6));
    }
}
