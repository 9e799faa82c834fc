//! Metrics tracking for the relay server

use chrono::{DateTime, Local};

/// Server counters, exposed as JSON on `/stats`
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Currently connected clients
    pub connected_clients: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Currently open rooms
    pub active_rooms: usize,

    /// Total rooms opened since start
    pub total_rooms: u64,

    /// Events sequenced since start
    pub events_sequenced: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            connected_clients: 0,
            total_connections: 0,
            peak_connections: 0,
            active_rooms: 0,
            total_rooms: 0,
            events_sequenced: 0,
        }
    }

    pub fn client_connected(&mut self) {
        self.connected_clients += 1;
        self.total_connections += 1;
        if self.connected_clients > self.peak_connections {
            self.peak_connections = self.connected_clients;
        }
    }

    pub fn client_disconnected(&mut self) {
        self.connected_clients = self.connected_clients.saturating_sub(1);
    }

    pub fn room_opened(&mut self) {
        self.active_rooms += 1;
        self.total_rooms += 1;
    }

    pub fn room_closed(&mut self) {
        self.active_rooms = self.active_rooms.saturating_sub(1);
    }

    pub fn event_sequenced(&mut self) {
        self.events_sequenced += 1;
    }

    /// Uptime as a short human-readable string
    pub fn uptime(&self) -> String {
        let secs = Local::now()
            .signed_duration_since(self.start_time)
            .num_seconds()
            .max(0);
        match (secs / 3600, (secs % 3600) / 60, secs % 60) {
            (0, 0, s) => format!("{s}s"),
            (0, m, s) => format!("{m}m {s}s"),
            (h, m, _) => format!("{h}h {m}m"),
        }
    }
}
