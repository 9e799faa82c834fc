//! Local audio engine seam
//!
//! The Reconciler is the only code allowed to drive the audio engine; the
//! presentation layer reports user gestures as [`UserTransportEvent`]s and
//! otherwise keeps its hands off. That exclusivity is what makes echo
//! suppression tractable.

use crate::sync::TrackRef;

/// Thin control surface over a single media element / decoder.
///
/// Implementations are expected to swallow their own playback errors and
/// stay in the last good state; the sync engine never unwinds through this
/// trait.
pub trait AudioEngine: Send + 'static {
    /// Point the engine at a stream URL (stops current playback)
    fn load(&mut self, url: &str);
    /// Start or resume playback
    fn play(&mut self);
    /// Pause playback
    fn pause(&mut self);
    /// Jump to an absolute position in seconds
    fn seek(&mut self, seconds: f64);
    /// Current playback position in seconds
    fn position(&self) -> f64;
}

/// A transport change made by the user, not by the Reconciler.
///
/// The UI reports these; the Reconciler applies them locally first (no
/// network round trip for the initiating user) and then publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum UserTransportEvent {
    /// User pressed play
    Play,
    /// User pressed pause
    Pause,
    /// User scrubbed to a position (seconds)
    Seek { position: f64 },
    /// User picked a track to play for the room
    SelectTrack { track: TrackRef },
}
