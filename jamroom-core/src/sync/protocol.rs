//! Sync Protocol Messages
//!
//! Everything that crosses the wire between a client and the room relay.
//! Event kinds are stable strings (`song-change`, `play-pause`, ...) so the
//! relay and the browser shell agree on them.

use serde::{Deserialize, Serialize};

use super::state::RoomPlaybackState;

/// A track as the room refers to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRef {
    /// Opaque catalogue identifier
    pub track_id: String,
    /// Resolved stream URL, if the publisher already resolved it.
    /// Absent means each receiver resolves it against the catalogue itself.
    pub stream_url: Option<String>,
    /// Track title
    pub title: String,
    /// Artist name
    pub artist: String,
    /// Cover artwork URL
    pub artwork_url: String,
}

/// Participant in a listening room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Unique client ID
    pub client_id: String,
    /// Display name chosen by the user
    pub display_name: String,
}

/// Events published into a room.
///
/// Clients publish these revisionless; the relay stamps them into
/// [`SequencedEvent`]s and rebroadcasts to every member, sender included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// A new track was chosen. The relay sets `position = 0` and
    /// `is_playing = true` by convention when it stamps this.
    SongChange { track: TrackRef },

    /// Play, pause, or seek (a seek is a play-pause carrying the new position)
    PlayPause { is_playing: bool, position: f64 },

    /// Advisory position report from a playing client. Never changes the
    /// room's track or play state.
    TimeSync { position: f64 },

    /// Someone joined the room (relay-originated)
    ParticipantJoined { participant: Participant },

    /// Someone left the room (relay-originated)
    ParticipantLeft { client_id: String },

    /// Chat line, passed through to the presentation layer untouched
    ChatMessage { client_id: String, text: String },
}

impl RoomEvent {
    /// Wire name of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::SongChange { .. } => "song-change",
            RoomEvent::PlayPause { .. } => "play-pause",
            RoomEvent::TimeSync { .. } => "time-sync",
            RoomEvent::ParticipantJoined { .. } => "participant-joined",
            RoomEvent::ParticipantLeft { .. } => "participant-left",
            RoomEvent::ChatMessage { .. } => "chat-message",
        }
    }

    /// Check if this event drives playback (as opposed to roster/chat traffic)
    pub fn is_playback(&self) -> bool {
        matches!(
            self,
            RoomEvent::SongChange { .. }
                | RoomEvent::PlayPause { .. }
                | RoomEvent::TimeSync { .. }
        )
    }
}

/// A room event after the relay accepted it into the room's log.
///
/// `revision` is the sole ordering key; `updated_at_ms` is only used to
/// extrapolate elapsed time, never to order events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Relay-assigned, per-room monotonic
    pub revision: u64,
    /// Relay clock at the moment of acceptance (unix millis)
    pub updated_at_ms: u64,
    /// Who published the event (echo matching + diagnostics, not authority)
    pub origin_client_id: String,
    /// The event itself
    pub event: RoomEvent,
}

/// Snapshot handed to a client on (re)join. Its embedded revision is
/// guaranteed current at the moment the relay sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub state: RoomPlaybackState,
    pub participants: Vec<Participant>,
}

/// Frames a client sends to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Join (or re-join) a room. Idempotent: re-joining just re-fetches
    /// the snapshot.
    Join { room_id: String, identity: Participant },
    /// Publish an event into the room. Fire-and-forget; the stamped event
    /// comes back on the broadcast like everyone else's.
    Publish { event: RoomEvent },
    /// Leave the room
    Leave,
}

/// Frames the relay sends to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Join response
    Snapshot(RoomSnapshot),
    /// A stamped room event, delivered in revision order
    Event(SequencedEvent),
    /// Terminal error (e.g. malformed join)
    Error { message: String },
}

/// Current wall-clock time in unix milliseconds
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
