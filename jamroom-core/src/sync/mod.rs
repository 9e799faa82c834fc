//! Sync Engine
//!
//! Keeps every room member's playback converged over the relay's
//! broadcast channel.

mod drift;
mod echo_guard;
mod protocol;
mod reconciler;
mod state;

pub use drift::{DriftCorrector, DRIFT_THRESHOLD_SECS};
pub use echo_guard::{EchoGuard, ECHO_POSITION_TOLERANCE_SECS, ECHO_TTL_MS};
pub use protocol::*;
pub use reconciler::{
    Phase, Reconciler, RemoteOutcome, LOADING_WATCHDOG_MS, TIME_SYNC_INTERVAL_MS,
};
pub use state::{LocalPlaybackState, RoomPlaybackState};
