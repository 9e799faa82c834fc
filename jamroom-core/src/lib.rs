//! Jamroom - Core Library
//!
//! Room playback synchronization for a web music player: keeps several
//! independent clients' audio playback (track, play state, position)
//! converged in near-real-time over a relay-sequenced broadcast channel,
//! while each client's own media engine stays driveable by its own user.

pub mod audio;
pub mod catalog;
pub mod session;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use audio::{AudioEngine, UserTransportEvent};
pub use catalog::{CatalogClient, CatalogError};
pub use session::{RoomSession, SessionCallback, SessionError};
pub use sync::{Reconciler, RoomEvent, RoomPlaybackState, RoomSnapshot, SequencedEvent};
pub use transport::{ConnectionError, SyncTransport, TransportEvent};
