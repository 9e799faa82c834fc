//! Room registry and event sequencing
//!
//! The relay is the single writer of revisions: every event a client
//! publishes is stamped here, under the room lock, with the next revision
//! and the relay clock, folded into the room fact, and fanned out to every
//! member of the room including the publisher.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use jamroom_core::sync::{
    current_time_ms, Participant, RelayFrame, RoomEvent, RoomPlaybackState, RoomSnapshot,
    SequencedEvent,
};

use crate::metrics::Metrics;

/// Fan-out buffer per room; a client this far behind is lagged out
const ROOM_CHANNEL_CAPACITY: usize = 256;

/// One live room
pub struct Room {
    /// Authoritative room fact, revision included
    pub state: RoomPlaybackState,
    /// Current members by client id
    pub participants: HashMap<String, Participant>,
    /// Fan-out channel carrying pre-serialized [`RelayFrame`] JSON
    pub tx: broadcast::Sender<String>,
}

impl Room {
    fn new(now_ms: u64) -> Self {
        let (tx, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            state: RoomPlaybackState::new(now_ms),
            participants: HashMap::new(),
            tx,
        }
    }

    /// Stamp an event with the next revision and fold it into the room fact
    fn stamp(&mut self, origin_client_id: &str, event: RoomEvent) -> SequencedEvent {
        let stamped = SequencedEvent {
            revision: self.state.revision + 1,
            updated_at_ms: current_time_ms(),
            origin_client_id: origin_client_id.to_string(),
            event,
        };
        self.state.apply(&stamped);
        stamped
    }

    /// Stamp, serialize and fan out in one step
    fn sequence(&mut self, origin_client_id: &str, event: RoomEvent) {
        let stamped = self.stamp(origin_client_id, event);
        debug!(
            revision = stamped.revision,
            kind = stamped.event.kind(),
            origin = origin_client_id,
            "sequenced event"
        );
        if let Ok(json) = serde_json::to_string(&RelayFrame::Event(stamped)) {
            // No receivers just means an empty room; not an error.
            let _ = self.tx.send(json);
        }
    }

    fn snapshot(&self, room_id: &str) -> RoomSnapshot {
        RoomSnapshot {
            room_id: room_id.to_string(),
            state: self.state.clone(),
            participants: self.participants.values().cloned().collect(),
        }
    }
}

/// Shared server state behind the axum router
pub struct AppState {
    rooms: RwLock<HashMap<String, Room>>,
    pub metrics: RwLock<Metrics>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            metrics: RwLock::new(Metrics::new()),
        }
    }

    /// Join (or create) a room.
    ///
    /// The joiner's `participant-joined` event is sequenced before the
    /// snapshot is taken, so the snapshot already lists the joiner and
    /// carries the join's revision.
    pub fn join_room(
        &self,
        room_id: &str,
        identity: Participant,
    ) -> (RoomSnapshot, broadcast::Receiver<String>) {
        let mut rooms = self.rooms.write();
        let created = !rooms.contains_key(room_id);
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(current_time_ms()));

        let rx = room.tx.subscribe();
        let client_id = identity.client_id.clone();
        room.sequence(
            &client_id,
            RoomEvent::ParticipantJoined {
                participant: identity.clone(),
            },
        );
        room.participants.insert(client_id.clone(), identity);

        let snapshot = room.snapshot(room_id);
        drop(rooms);

        if created {
            info!(room_id, "room opened");
            self.metrics.write().room_opened();
        }
        info!(room_id, client_id, "participant joined");
        (snapshot, rx)
    }

    /// Sequence a published event into its room
    pub fn publish(&self, room_id: &str, origin_client_id: &str, event: RoomEvent) -> bool {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        room.sequence(origin_client_id, event);
        drop(rooms);
        self.metrics.write().event_sequenced();
        true
    }

    /// Fresh snapshot for an idempotent re-join over a live socket
    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.rooms.read().get(room_id).map(|r| r.snapshot(room_id))
    }

    /// Remove a participant; the room itself is dropped once empty
    pub fn leave_room(&self, room_id: &str, client_id: &str) {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        if room.participants.remove(client_id).is_none() {
            return;
        }
        room.sequence(
            client_id,
            RoomEvent::ParticipantLeft {
                client_id: client_id.to_string(),
            },
        );

        let emptied = room.participants.is_empty();
        if emptied {
            rooms.remove(room_id);
        }
        drop(rooms);

        info!(room_id, client_id, "participant left");
        if emptied {
            info!(room_id, "room closed");
            self.metrics.write().room_closed();
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamroom_core::sync::TrackRef;

    fn participant(id: &str) -> Participant {
        Participant {
            client_id: id.to_string(),
            display_name: id.to_uppercase(),
        }
    }

    fn track(id: &str) -> TrackRef {
        TrackRef {
            track_id: id.to_string(),
            stream_url: Some(format!("https://cdn.example/{id}.m4a")),
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            artwork_url: String::new(),
        }
    }

    #[test]
    fn join_snapshot_lists_joiner_and_carries_join_revision() {
        let state = AppState::new();
        let (snap, _rx) = state.join_room("jam", participant("alice"));

        assert_eq!(snap.state.revision, 1);
        assert_eq!(snap.participants.len(), 1);
        assert_eq!(snap.participants[0].client_id, "alice");
    }

    #[test]
    fn revisions_are_per_room_and_strictly_increasing() {
        let state = AppState::new();
        let (_, mut rx_a) = state.join_room("a", participant("alice"));
        state.join_room("b", participant("bob"));

        state.publish("a", "alice", RoomEvent::SongChange { track: track("t1") });
        state.publish("a", "alice", RoomEvent::TimeSync { position: 3.0 });
        state.publish("b", "bob", RoomEvent::SongChange { track: track("t2") });

        // Skip alice's own join event.
        let _ = rx_a.try_recv().unwrap();
        let mut last = 0;
        while let Ok(json) = rx_a.try_recv() {
            let frame: RelayFrame = serde_json::from_str(&json).unwrap();
            let RelayFrame::Event(ev) = frame else {
                panic!("expected event frame");
            };
            assert!(ev.revision > last);
            last = ev.revision;
        }
        assert_eq!(last, 3);
        assert_eq!(state.snapshot("b").unwrap().state.revision, 2);
    }

    #[test]
    fn published_events_reach_the_publisher_too() {
        let state = AppState::new();
        let (_, mut rx) = state.join_room("jam", participant("alice"));
        let _ = rx.try_recv().unwrap();

        state.publish(
            "jam",
            "alice",
            RoomEvent::PlayPause {
                is_playing: true,
                position: 10.0,
            },
        );

        let frame: RelayFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let RelayFrame::Event(ev) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(ev.origin_client_id, "alice");
        assert!(ev.updated_at_ms > 0);
    }

    #[test]
    fn playback_events_update_the_room_fact() {
        let state = AppState::new();
        state.join_room("jam", participant("alice"));
        state.publish("jam", "alice", RoomEvent::SongChange { track: track("t1") });
        state.publish(
            "jam",
            "alice",
            RoomEvent::PlayPause {
                is_playing: false,
                position: 42.5,
            },
        );

        let snap = state.snapshot("jam").unwrap();
        assert_eq!(snap.state.track.as_ref().unwrap().track_id, "t1");
        assert!(!snap.state.is_playing);
        assert_eq!(snap.state.position, 42.5);
    }

    #[test]
    fn last_leave_closes_the_room() {
        let state = AppState::new();
        state.join_room("jam", participant("alice"));
        state.join_room("jam", participant("bob"));
        assert_eq!(state.room_count(), 1);

        state.leave_room("jam", "alice");
        assert_eq!(state.room_count(), 1);
        state.leave_room("jam", "bob");
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn publish_to_unknown_room_is_rejected() {
        let state = AppState::new();
        assert!(!state.publish("nope", "alice", RoomEvent::TimeSync { position: 0.0 }));
    }
}
