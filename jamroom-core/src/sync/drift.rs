//! Drift correction between local and authoritative position
//!
//! Runs whenever an applied remote event carries a position. Small deltas
//! are jitter and latency noise; correcting them would cause audible
//! stutter, so only drift at or beyond the threshold triggers a snap seek.

use tracing::debug;

/// Drift at or beyond this many seconds gets a hard seek
pub const DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Periodic comparator between local and last-known-authoritative position
#[derive(Debug, Default)]
pub struct DriftCorrector;

impl DriftCorrector {
    /// Authoritative position extrapolated to `now_ms`
    pub fn expected_position(
        remote_position: f64,
        updated_at_ms: u64,
        now_ms: u64,
        is_playing: bool,
    ) -> f64 {
        if is_playing {
            remote_position + now_ms.saturating_sub(updated_at_ms) as f64 / 1000.0
        } else {
            remote_position
        }
    }

    /// Compare the extrapolated remote position against the local one.
    /// Returns the seek target when the drift band is exceeded, `None` when
    /// the local engine should be left alone.
    pub fn correction(expected: f64, local: f64) -> Option<f64> {
        let drift = expected - local;
        if drift.abs() >= DRIFT_THRESHOLD_SECS {
            debug!(drift_secs = drift, target = expected, "drift beyond band, snapping");
            Some(expected)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_drift_is_left_alone() {
        // Remote position 100.0 at T, playing; local 101.2 at T+1s.
        // Expected 101.0, drift 0.2 < 2.0: no seek.
        let expected = DriftCorrector::expected_position(100.0, 0, 1_000, true);
        assert!((expected - 101.0).abs() < 1e-9);
        assert_eq!(DriftCorrector::correction(expected, 101.2), None);
    }

    #[test]
    fn test_large_drift_snaps_to_expected() {
        // Same instant, local 105.0: drift 4.0 >= 2.0, hard seek to 101.0.
        let expected = DriftCorrector::expected_position(100.0, 0, 1_000, true);
        assert_eq!(DriftCorrector::correction(expected, 105.0), Some(101.0));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(DriftCorrector::correction(102.0, 100.0).is_some());
        assert!(DriftCorrector::correction(101.999, 100.0).is_none());
    }

    #[test]
    fn test_behind_drift_also_corrects() {
        assert_eq!(DriftCorrector::correction(100.0, 95.0), Some(100.0));
    }

    #[test]
    fn test_paused_position_is_not_extrapolated() {
        let expected = DriftCorrector::expected_position(60.0, 0, 30_000, false);
        assert_eq!(expected, 60.0);
    }
}
