//! WebSocket transport to the relay
//!
//! One background task owns the connection for its whole life: initial
//! join handshake, frame pumping, and backoff reconnects that re-join and
//! surface the fresh snapshot.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::sync::{ClientFrame, Participant, RelayFrame, RoomSnapshot};

use super::{Backoff, ConnectionError, SyncTransport, TransportConfig, TransportEvent};

type JoinWaiter = Arc<Mutex<Option<oneshot::Sender<Result<RoomSnapshot, ConnectionError>>>>>;

/// WebSocket implementation of [`SyncTransport`]
pub struct WsTransport {
    config: TransportConfig,
    command_tx: Option<mpsc::UnboundedSender<ClientFrame>>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    join_waiter: JoinWaiter,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            command_tx: None,
            event_rx: None,
            join_waiter: Arc::new(Mutex::new(None)),
        }
    }
}

impl SyncTransport for WsTransport {
    fn join(
        &mut self,
        room_id: String,
        identity: Participant,
    ) -> BoxFuture<'_, Result<RoomSnapshot, ConnectionError>> {
        let url = match Url::parse(&self.config.relay_url) {
            Ok(url) => url,
            Err(e) => {
                let msg = format!("{}: {e}", self.config.relay_url);
                return Box::pin(async move { Err(ConnectionError::InvalidUrl(msg)) });
            }
        };

        let (tx, rx) = oneshot::channel();
        *self.join_waiter.lock() = Some(tx);

        match &self.command_tx {
            Some(cmd) => {
                // Already running: idempotent re-join, just re-fetch the
                // snapshot through the live connection.
                if cmd.send(ClientFrame::Join { room_id, identity }).is_err() {
                    if let Some(tx) = self.join_waiter.lock().take() {
                        let _ = tx.send(Err(ConnectionError::Closed));
                    }
                }
            }
            None => {
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                self.command_tx = Some(command_tx);
                self.event_rx = Some(event_rx);

                let task = ConnectionTask {
                    url,
                    room_id,
                    identity,
                    command_rx,
                    event_tx,
                    join_waiter: Arc::clone(&self.join_waiter),
                    join_attempts: self.config.join_attempts,
                };
                tokio::spawn(task.run());
            }
        }

        Box::pin(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Closed),
            }
        })
    }

    fn publish(&self, event: crate::sync::RoomEvent) -> Result<(), ConnectionError> {
        self.command_tx
            .as_ref()
            .ok_or(ConnectionError::Closed)?
            .send(ClientFrame::Publish { event })
            .map_err(|_| ConnectionError::Closed)
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Background task owning the relay connection
struct ConnectionTask {
    url: Url,
    room_id: String,
    identity: Participant,
    command_rx: mpsc::UnboundedReceiver<ClientFrame>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    join_waiter: JoinWaiter,
    join_attempts: u32,
}

/// Why a live connection ended
enum Ended {
    /// Socket error or close; reconnect
    Lost,
    /// Consumer went away or the relay rejected us terminally; stop
    Terminal,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut ever_connected = false;
        let mut backoff = Backoff::new();

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %self.url, "relay connected");
                    backoff.reset();
                    let ended = self.drive(ws, &mut ever_connected).await;
                    match ended {
                        Ended::Terminal => return,
                        Ended::Lost => {
                            warn!("relay connection lost");
                            if self.event_tx.send(TransportEvent::Disconnected).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, failures = backoff.failures(), "relay connect failed: {e}");
                    if !ever_connected && backoff.failures() + 1 >= self.join_attempts {
                        self.fail_waiter(ConnectionError::Unreachable(e.to_string()));
                        return;
                    }
                }
            }

            // First retry waits the base delay; the schedule advances after.
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Pump one live connection until it drops
    async fn drive(&mut self, ws: WsStream, ever_connected: &mut bool) -> Ended {
        let (mut sink, mut stream) = ws.split();

        let join = ClientFrame::Join {
            room_id: self.room_id.clone(),
            identity: self.identity.clone(),
        };
        if send_frame(&mut sink, &join).await.is_err() {
            return Ended::Lost;
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(frame) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                return Ended::Lost;
                            }
                        }
                        None => {
                            // Transport handle dropped: polite goodbye.
                            let _ = send_frame(&mut sink, &ClientFrame::Leave).await;
                            return Ended::Terminal;
                        }
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<RelayFrame>(&text) {
                                Ok(frame) => {
                                    if let Some(end) = self.handle_frame(frame, ever_connected) {
                                        return end;
                                    }
                                }
                                Err(e) => warn!("undecodable relay frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return Ended::Lost;
                        }
                        Some(Ok(_)) => {
                            debug!("ignoring non-text relay frame");
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: RelayFrame, ever_connected: &mut bool) -> Option<Ended> {
        match frame {
            RelayFrame::Snapshot(snapshot) => {
                let waiter = self.join_waiter.lock().take();
                match waiter {
                    Some(tx) => {
                        *ever_connected = true;
                        let _ = tx.send(Ok(snapshot));
                    }
                    None => {
                        // Unprompted snapshot: this is a reconnect re-join.
                        if self.event_tx.send(TransportEvent::Reconnected(snapshot)).is_err() {
                            return Some(Ended::Terminal);
                        }
                    }
                }
                None
            }
            RelayFrame::Event(event) => {
                if self.event_tx.send(TransportEvent::Event(event)).is_err() {
                    Some(Ended::Terminal)
                } else {
                    None
                }
            }
            RelayFrame::Error { message } => {
                warn!("relay error: {message}");
                if self.join_waiter.lock().is_some() {
                    // The join itself was refused; that is terminal.
                    self.fail_waiter(ConnectionError::Rejected(message));
                    Some(Ended::Terminal)
                } else {
                    None
                }
            }
        }
    }

    fn fail_waiter(&self, err: ConnectionError) {
        if let Some(tx) = self.join_waiter.lock().take() {
            let _ = tx.send(Err(err));
        }
    }
}

async fn send_frame(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &ClientFrame,
) -> Result<(), ()> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(Message::Text(json)).await.map_err(|e| {
            warn!("relay send failed: {e}");
        }),
        Err(e) => {
            warn!("frame serialization failed: {e}");
            Ok(())
        }
    }
}
