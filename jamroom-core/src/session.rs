//! Room session orchestration
//!
//! Wires a [`Reconciler`] to a [`SyncTransport`] and the catalog, and runs
//! the event loop that keeps them fed: remote events in, local intents
//! out, stream-url resolution off the hot path, periodic ticks for the
//! loading watchdog and time-sync cadence.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::audio::{AudioEngine, UserTransportEvent};
use crate::catalog::{CatalogClient, CatalogError};
use crate::sync::{
    current_time_ms, Participant, Reconciler, RemoteOutcome, RoomEvent, TrackRef,
};
use crate::transport::{ConnectionError, SyncTransport, TransportEvent};

/// How often the loop ticks the reconciler when nothing else is happening
const TICK_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("session is no longer running")]
    Stopped,
    #[error("transport event stream was already taken")]
    EventsTaken,
}

/// Notifications a UI layer can subscribe to
///
/// All methods default to no-ops so callers implement only what they show.
pub trait SessionCallback: Send + Sync + 'static {
    fn on_chat(&self, _client_id: &str, _text: &str) {}
    fn on_participant_joined(&self, _participant: &Participant) {}
    fn on_participant_left(&self, _client_id: &str) {}
    fn on_disconnected(&self) {}
    fn on_reconnected(&self) {}
    fn on_track_resolve_failed(&self, _track_id: &str) {}
}

enum SessionCommand {
    User(UserTransportEvent),
    Chat(String),
}

/// Handle to a joined room
///
/// Dropping the handle (or calling [`RoomSession::leave`]) stops the loop,
/// which sends a leave frame through the transport on its way out.
pub struct RoomSession {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RoomSession {
    /// Join a room and start the session loop.
    ///
    /// Blocks until the relay has answered the join with a snapshot (or
    /// the transport gives up).
    pub async fn join<E, T>(
        mut transport: T,
        engine: E,
        catalog: CatalogClient,
        room_id: String,
        identity: Participant,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Self, SessionError>
    where
        E: AudioEngine,
        T: SyncTransport,
    {
        let snapshot = transport.join(room_id.clone(), identity.clone()).await?;
        let events = transport.take_events().ok_or(SessionError::EventsTaken)?;
        info!(room_id = %snapshot.room_id, revision = snapshot.state.revision, "joined room");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();

        let mut reconciler = Reconciler::new(identity.client_id.clone(), engine, outbound_tx);
        let initial = reconciler.apply_snapshot(&snapshot.state, current_time_ms());

        let mut session_loop = SessionLoop {
            reconciler,
            transport,
            catalog,
            identity,
            callback,
            events,
            outbound_rx,
            command_rx,
            shutdown_rx,
            resolve_tx,
            resolve_rx,
        };
        if let Some(track) = initial {
            session_loop.spawn_resolve(track);
        }
        tokio::spawn(session_loop.run());

        Ok(Self {
            command_tx,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Feed a user transport action (play, pause, seek, track selection)
    pub fn handle_user_event(&self, event: UserTransportEvent) -> Result<(), SessionError> {
        self.command_tx
            .send(SessionCommand::User(event))
            .map_err(|_| SessionError::Stopped)
    }

    /// Send a chat line to the room
    pub fn send_chat(&self, text: String) -> Result<(), SessionError> {
        self.command_tx
            .send(SessionCommand::Chat(text))
            .map_err(|_| SessionError::Stopped)
    }

    /// Leave the room and stop the loop
    pub fn leave(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct ResolveResult {
    track_id: String,
    outcome: Result<String, CatalogError>,
}

struct SessionLoop<E: AudioEngine, T: SyncTransport> {
    reconciler: Reconciler<E>,
    transport: T,
    catalog: CatalogClient,
    identity: Participant,
    callback: Arc<dyn SessionCallback>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    outbound_rx: mpsc::UnboundedReceiver<RoomEvent>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown_rx: oneshot::Receiver<()>,
    resolve_tx: mpsc::UnboundedSender<ResolveResult>,
    resolve_rx: mpsc::UnboundedReceiver<ResolveResult>,
}

impl<E: AudioEngine, T: SyncTransport> SessionLoop<E, T> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    debug!("session shutting down");
                    break;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::User(event)) => {
                            if let Some(track) = self.reconciler.handle_user_event(event, current_time_ms()) {
                                self.spawn_resolve(track);
                            }
                        }
                        Some(SessionCommand::Chat(text)) => {
                            let event = RoomEvent::ChatMessage {
                                client_id: self.identity.client_id.clone(),
                                text,
                            };
                            if let Err(e) = self.transport.publish(event) {
                                warn!("chat publish failed: {e}");
                            }
                        }
                        None => break,
                    }
                }

                transport_event = self.events.recv() => {
                    match transport_event {
                        Some(TransportEvent::Event(sequenced)) => {
                            match self.reconciler.handle_remote(&sequenced, current_time_ms()) {
                                RemoteOutcome::NeedsStream(track) => self.spawn_resolve(track),
                                RemoteOutcome::PassThrough => self.dispatch(&sequenced.event),
                                RemoteOutcome::Stale
                                | RemoteOutcome::Echo
                                | RemoteOutcome::Applied => {}
                            }
                        }
                        Some(TransportEvent::Disconnected) => {
                            self.reconciler.on_disconnected();
                            self.callback.on_disconnected();
                        }
                        Some(TransportEvent::Reconnected(snapshot)) => {
                            if let Some(track) =
                                self.reconciler.on_reconnected(&snapshot.state, current_time_ms())
                            {
                                self.spawn_resolve(track);
                            }
                            self.callback.on_reconnected();
                        }
                        None => break,
                    }
                }

                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(event) => {
                            if let Err(e) = self.transport.publish(event) {
                                warn!("publish failed: {e}");
                            }
                        }
                        None => break,
                    }
                }

                resolved = self.resolve_rx.recv() => {
                    if let Some(ResolveResult { track_id, outcome }) = resolved {
                        match outcome {
                            Ok(url) => {
                                self.reconciler.finish_loading(&track_id, url, current_time_ms());
                            }
                            Err(e) => {
                                warn!(track_id, "stream resolution failed: {e}");
                                self.reconciler.fail_loading(&track_id);
                                self.callback.on_track_resolve_failed(&track_id);
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    let now = current_time_ms();
                    self.reconciler.tick(now);
                    self.reconciler.emit_time_sync_if_due(now);
                }
            }
        }

        self.reconciler.shutdown();
    }

    /// Resolve a track's stream url off the loop
    fn spawn_resolve(&self, track: TrackRef) {
        let catalog = self.catalog.clone();
        let tx = self.resolve_tx.clone();
        tokio::spawn(async move {
            let outcome = catalog.resolve_stream_url(&track.track_id).await;
            let _ = tx.send(ResolveResult {
                track_id: track.track_id,
                outcome,
            });
        });
    }

    /// Forward non-playback room events to the callback layer
    fn dispatch(&self, event: &RoomEvent) {
        match event {
            RoomEvent::ChatMessage { client_id, text } => {
                self.callback.on_chat(client_id, text);
            }
            RoomEvent::ParticipantJoined { participant } => {
                self.callback.on_participant_joined(participant);
            }
            RoomEvent::ParticipantLeft { client_id } => {
                self.callback.on_participant_left(client_id);
            }
            _ => {}
        }
    }
}
