//! The Reconciler
//!
//! Single authority that merges local user intent and relay-sequenced room
//! events into one command stream for the audio engine. Local intents apply
//! optimistically and publish; inbound events pass the revision guard, then
//! the echo check, and only then drive the engine.
//!
//! All methods take `now_ms` so ordering, expiry and extrapolation behaviour
//! is deterministic under test.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{AudioEngine, UserTransportEvent};

use super::drift::DriftCorrector;
use super::echo_guard::EchoGuard;
use super::protocol::{RoomEvent, SequencedEvent, TrackRef};
use super::state::{LocalPlaybackState, RoomPlaybackState};

/// How long a track may sit in `Loading` before the machine falls back to
/// `Idle` (covers a stream resolution that never completes).
pub const LOADING_WATCHDOG_MS: u64 = 10_000;

/// Interval between advisory time-sync reports while this client plays
pub const TIME_SYNC_INTERVAL_MS: u64 = 5_000;

/// Where the state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No track selected
    Idle,
    /// Track chosen, stream URL not yet resolved
    Loading,
    Playing,
    Paused,
    /// Transient while a seek is being issued; re-enters Playing/Paused
    Seeking,
    /// Transport lost. The engine stays exactly as last rendered; the only
    /// accepted local mutation is a user pause, whose publish is queued.
    Disconnected,
}

/// A track waiting on stream resolution, plus the room fact to land on once
/// the stream is ready.
#[derive(Debug, Clone)]
struct PendingLoad {
    track: TrackRef,
    started_at_ms: u64,
    position: f64,
    updated_at_ms: u64,
    is_playing: bool,
    /// Local selections publish their song-change once the URL is known;
    /// remote song-changes never republish.
    publish_on_ready: bool,
}

/// What became of an inbound relay event
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// `revision <= last_applied_revision`: already reflected, discarded
    Stale,
    /// Confirmed echo of a pending local intent (or our own time-sync);
    /// mirror updated, engine untouched
    Echo,
    /// Genuine change, applied to the engine
    Applied,
    /// Applied, but the track needs a stream URL resolved before the engine
    /// can load it
    NeedsStream(TrackRef),
    /// Roster/chat traffic for the presentation layer
    PassThrough,
}

/// The room playback reconciler for one client.
pub struct Reconciler<E: AudioEngine> {
    client_id: String,
    engine: E,
    local: LocalPlaybackState,
    phase: Phase,
    loading: Option<PendingLoad>,
    queued_pause: bool,
    echo_guard: EchoGuard,
    outbound: mpsc::UnboundedSender<RoomEvent>,
    last_time_sync_ms: u64,
}

impl<E: AudioEngine> Reconciler<E> {
    /// Create a reconciler around an engine. Published intents go out on
    /// `outbound` in the order they were decided.
    pub fn new(client_id: impl Into<String>, engine: E, outbound: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self {
            client_id: client_id.into(),
            engine,
            local: LocalPlaybackState::default(),
            phase: Phase::Idle,
            loading: None,
            queued_pause: false,
            echo_guard: EchoGuard::new(),
            outbound,
            last_time_sync_ms: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn local(&self) -> &LocalPlaybackState {
        &self.local
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// A user gesture on this client. Applied to the engine immediately,
    /// registered with the echo guard, then published. Returns a track that
    /// still needs stream resolution, if any.
    pub fn handle_user_event(
        &mut self,
        ev: UserTransportEvent,
        now_ms: u64,
    ) -> Option<TrackRef> {
        if self.phase == Phase::Disconnected {
            return self.handle_user_event_disconnected(ev);
        }
        if self.phase == Phase::Loading && !matches!(ev, UserTransportEvent::SelectTrack { .. }) {
            self.retarget_pending_load(ev, now_ms);
            return None;
        }

        match ev {
            UserTransportEvent::Play => {
                if self.local.track.is_none() {
                    debug!("user play with no track selected, ignoring");
                    return None;
                }
                self.engine.play();
                self.phase = Phase::Playing;
                self.local.is_playing = true;
                let position = self.engine.position();
                self.publish_intent(
                    RoomEvent::PlayPause {
                        is_playing: true,
                        position,
                    },
                    now_ms,
                );
            }
            UserTransportEvent::Pause => {
                if self.local.track.is_none() {
                    debug!("user pause with no track selected, ignoring");
                    return None;
                }
                self.engine.pause();
                self.phase = Phase::Paused;
                self.local.is_playing = false;
                let position = self.engine.position();
                self.publish_intent(
                    RoomEvent::PlayPause {
                        is_playing: false,
                        position,
                    },
                    now_ms,
                );
            }
            UserTransportEvent::Seek { position } => {
                if self.local.track.is_none() {
                    debug!("user seek with no track selected, ignoring");
                    return None;
                }
                let was_playing = self.local.is_playing;
                self.phase = Phase::Seeking;
                self.engine.seek(position);
                self.local.position = position;
                self.phase = if was_playing { Phase::Playing } else { Phase::Paused };
                self.publish_intent(
                    RoomEvent::PlayPause {
                        is_playing: was_playing,
                        position,
                    },
                    now_ms,
                );
            }
            UserTransportEvent::SelectTrack { track } => {
                if let Some(url) = track.stream_url.clone() {
                    self.engine.load(&url);
                    self.engine.seek(0.0);
                    self.engine.play();
                    self.phase = Phase::Playing;
                    self.local.track = Some(track.clone());
                    self.local.is_playing = true;
                    self.local.position = 0.0;
                    self.loading = None;
                    self.publish_intent(RoomEvent::SongChange { track }, now_ms);
                } else {
                    info!(track_id = %track.track_id, "track selected, resolving stream");
                    self.phase = Phase::Loading;
                    self.loading = Some(PendingLoad {
                        track: track.clone(),
                        started_at_ms: now_ms,
                        position: 0.0,
                        updated_at_ms: now_ms,
                        is_playing: true,
                        publish_on_ready: true,
                    });
                    return Some(track);
                }
            }
        }
        None
    }

    /// Transport gestures while a stream is still resolving cannot drive
    /// the engine; they move where the pending load lands and publish the
    /// intent with those landing values instead.
    fn retarget_pending_load(&mut self, ev: UserTransportEvent, now_ms: u64) {
        let Some(load) = self.loading.as_mut() else {
            return;
        };
        let expected = DriftCorrector::expected_position(
            load.position,
            load.updated_at_ms,
            now_ms,
            load.is_playing,
        );
        let (is_playing, position) = match ev {
            UserTransportEvent::Play => (true, expected),
            UserTransportEvent::Pause => (false, expected),
            UserTransportEvent::Seek { position } => (load.is_playing, position),
            UserTransportEvent::SelectTrack { .. } => return,
        };
        load.is_playing = is_playing;
        load.position = position;
        load.updated_at_ms = now_ms;
        debug!(is_playing, position, "gesture during loading retargets the pending load");
        self.publish_intent(RoomEvent::PlayPause { is_playing, position }, now_ms);
    }

    fn handle_user_event_disconnected(&mut self, ev: UserTransportEvent) -> Option<TrackRef> {
        match ev {
            UserTransportEvent::Pause => {
                // The user can always silence their own device; the publish
                // waits for the reconnect snapshot.
                self.engine.pause();
                self.local.is_playing = false;
                self.queued_pause = true;
                info!("user pause while disconnected, queued for reconnect");
            }
            other => {
                warn!(?other, "transport down, local intent not accepted");
            }
        }
        None
    }

    /// An inbound relay event, consumed strictly in delivery order.
    pub fn handle_remote(&mut self, ev: &SequencedEvent, now_ms: u64) -> RemoteOutcome {
        if self.local.is_stale(ev.revision) {
            debug!(
                revision = ev.revision,
                last_applied = self.local.last_applied_revision,
                "stale event discarded"
            );
            return RemoteOutcome::Stale;
        }

        self.local.observe(ev);

        if !ev.event.is_playback() {
            return RemoteOutcome::PassThrough;
        }

        let from_self = ev.origin_client_id == self.client_id;

        // Our own time-sync reports come straight back off the broadcast;
        // drift-checking a client against itself is meaningless.
        if from_self && matches!(ev.event, RoomEvent::TimeSync { .. }) {
            return RemoteOutcome::Echo;
        }

        if from_self && self.echo_guard.consume(&ev.event, now_ms) {
            // The engine already reflects the user's action.
            return RemoteOutcome::Echo;
        }

        // Genuine external change (or an echo whose payload diverged because
        // a newer event beat it to the relay). Anything we had pending for
        // this kind no longer describes the engine.
        self.echo_guard.invalidate_kind(ev.event.kind());

        match &ev.event {
            RoomEvent::SongChange { track } => self.apply_song_change(track, ev.updated_at_ms, now_ms),
            RoomEvent::PlayPause {
                is_playing,
                position,
            } => {
                self.apply_play_pause(*is_playing, *position, ev.updated_at_ms, now_ms);
                RemoteOutcome::Applied
            }
            RoomEvent::TimeSync { position } => {
                self.apply_time_sync(*position, ev.updated_at_ms, now_ms);
                RemoteOutcome::Applied
            }
            _ => unreachable!("non-playback events returned above"),
        }
    }

    fn apply_song_change(
        &mut self,
        track: &TrackRef,
        updated_at_ms: u64,
        now_ms: u64,
    ) -> RemoteOutcome {
        match track.stream_url.clone() {
            Some(url) => {
                self.engine.load(&url);
                // Relay convention: a fresh song-change is playing from zero
                // as of its stamp.
                let position =
                    DriftCorrector::expected_position(0.0, updated_at_ms, now_ms, true);
                self.engine.seek(position);
                self.engine.play();
                self.phase = Phase::Playing;
                self.loading = None;
                info!(track_id = %track.track_id, position, "remote track change applied");
                RemoteOutcome::Applied
            }
            None => {
                self.phase = Phase::Loading;
                self.loading = Some(PendingLoad {
                    track: track.clone(),
                    started_at_ms: now_ms,
                    position: 0.0,
                    updated_at_ms,
                    is_playing: true,
                    publish_on_ready: false,
                });
                RemoteOutcome::NeedsStream(track.clone())
            }
        }
    }

    fn apply_play_pause(&mut self, is_playing: bool, position: f64, updated_at_ms: u64, now_ms: u64) {
        if self.phase == Phase::Loading {
            // Still waiting for the stream; just move the landing target.
            if let Some(load) = self.loading.as_mut() {
                load.is_playing = is_playing;
                load.position = position;
                load.updated_at_ms = updated_at_ms;
            }
            return;
        }

        if is_playing {
            self.engine.play();
            self.phase = Phase::Playing;
        } else {
            self.engine.pause();
            self.phase = Phase::Paused;
        }

        let expected =
            DriftCorrector::expected_position(position, updated_at_ms, now_ms, is_playing);
        if let Some(target) = DriftCorrector::correction(expected, self.engine.position()) {
            self.engine.seek(target);
        }
    }

    fn apply_time_sync(&mut self, position: f64, updated_at_ms: u64, now_ms: u64) {
        match self.phase {
            Phase::Playing | Phase::Paused => {
                let expected = DriftCorrector::expected_position(
                    position,
                    updated_at_ms,
                    now_ms,
                    self.local.is_playing,
                );
                if let Some(target) = DriftCorrector::correction(expected, self.engine.position()) {
                    self.engine.seek(target);
                }
            }
            Phase::Loading => {
                if let Some(load) = self.loading.as_mut() {
                    load.position = position;
                    load.updated_at_ms = updated_at_ms;
                }
            }
            _ => {}
        }
    }

    /// Apply a join/reconnect snapshot unconditionally (its revision is
    /// guaranteed current). Returns a track needing stream resolution.
    pub fn apply_snapshot(&mut self, state: &RoomPlaybackState, now_ms: u64) -> Option<TrackRef> {
        self.local.seed(state);
        self.echo_guard.clear();
        self.loading = None;

        match state.track.clone() {
            None => {
                self.phase = Phase::Idle;
                None
            }
            Some(track) => match track.stream_url.clone() {
                Some(url) => {
                    self.engine.load(&url);
                    self.engine.seek(state.extrapolated_position(now_ms));
                    if state.is_playing {
                        self.engine.play();
                        self.phase = Phase::Playing;
                    } else {
                        self.engine.pause();
                        self.phase = Phase::Paused;
                    }
                    None
                }
                None => {
                    self.phase = Phase::Loading;
                    self.loading = Some(PendingLoad {
                        track: track.clone(),
                        started_at_ms: now_ms,
                        position: state.position,
                        updated_at_ms: state.updated_at_ms,
                        is_playing: state.is_playing,
                        publish_on_ready: false,
                    });
                    Some(track)
                }
            },
        }
    }

    /// Stream URL resolution finished for `track_id`.
    pub fn finish_loading(&mut self, track_id: &str, url: String, now_ms: u64) {
        if self.phase != Phase::Loading {
            debug!(track_id, "stream resolved after leaving Loading, dropping");
            return;
        }
        let Some(load) = self.loading.take() else {
            return;
        };
        if load.track.track_id != track_id {
            // A newer song-change superseded this resolution.
            self.loading = Some(load);
            return;
        }

        let mut track = load.track.clone();
        track.stream_url = Some(url.clone());

        self.engine.load(&url);
        let position = DriftCorrector::expected_position(
            load.position,
            load.updated_at_ms,
            now_ms,
            load.is_playing,
        );
        self.engine.seek(position);
        if load.is_playing {
            self.engine.play();
            self.phase = Phase::Playing;
        } else {
            self.engine.pause();
            self.phase = Phase::Paused;
        }

        self.local.track = Some(track.clone());
        self.local.is_playing = load.is_playing;
        self.local.position = position;

        if load.publish_on_ready {
            self.publish_intent(RoomEvent::SongChange { track }, now_ms);
        }
    }

    /// Stream URL resolution failed; fall back to Idle for that track.
    pub fn fail_loading(&mut self, track_id: &str) {
        if self.phase == Phase::Loading
            && self
                .loading
                .as_ref()
                .is_some_and(|l| l.track.track_id == track_id)
        {
            warn!(track_id, "stream resolution failed, back to Idle");
            self.phase = Phase::Idle;
            self.loading = None;
        }
    }

    /// Transport lost. The engine stays exactly as last rendered.
    pub fn on_disconnected(&mut self) {
        info!("transport lost, freezing local playback");
        self.phase = Phase::Disconnected;
        self.loading = None;
    }

    /// Transport recovered with a fresh snapshot. The snapshot applies
    /// unconditionally, then any pause the user queued while offline is
    /// re-applied and published.
    pub fn on_reconnected(&mut self, state: &RoomPlaybackState, now_ms: u64) -> Option<TrackRef> {
        info!(revision = state.revision, "reconnected, snapping to snapshot");
        let needs_stream = self.apply_snapshot(state, now_ms);

        if self.queued_pause {
            self.queued_pause = false;
            self.engine.pause();
            if self.phase == Phase::Playing {
                self.phase = Phase::Paused;
            }
            self.local.is_playing = false;
            let position = self.engine.position();
            self.publish_intent(
                RoomEvent::PlayPause {
                    is_playing: false,
                    position,
                },
                now_ms,
            );
        }

        needs_stream
    }

    /// Periodic housekeeping: echo expiry and the loading watchdog.
    /// Returns true if the watchdog abandoned a stuck load.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        self.echo_guard.prune(now_ms);

        if self.phase == Phase::Loading {
            if let Some(load) = self.loading.as_ref() {
                if now_ms.saturating_sub(load.started_at_ms) >= LOADING_WATCHDOG_MS {
                    warn!(track_id = %load.track.track_id, "stream resolution timed out, back to Idle");
                    self.phase = Phase::Idle;
                    self.loading = None;
                    return true;
                }
            }
        }
        false
    }

    /// Emit an advisory time-sync if this client is playing and the interval
    /// has elapsed. Any playing client may emit; there is no leader.
    pub fn emit_time_sync_if_due(&mut self, now_ms: u64) {
        if self.phase != Phase::Playing {
            return;
        }
        if now_ms.saturating_sub(self.last_time_sync_ms) < TIME_SYNC_INTERVAL_MS {
            return;
        }
        self.last_time_sync_ms = now_ms;
        let position = self.engine.position();
        self.publish(RoomEvent::TimeSync { position });
    }

    /// Tear down on room leave: cancel pending intents.
    pub fn shutdown(&mut self) {
        self.echo_guard.clear();
        self.loading = None;
        self.queued_pause = false;
    }

    fn publish_intent(&mut self, event: RoomEvent, now_ms: u64) {
        self.echo_guard.register(&event, now_ms);
        self.publish(event);
    }

    fn publish(&mut self, event: RoomEvent) {
        // Fire-and-forget: the relay's stamped rebroadcast is the ack.
        if self.outbound.send(event).is_err() {
            warn!("outbound channel closed, dropping publish");
        }
    }
}
