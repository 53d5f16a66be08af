//! Low-pass filtering of received signal strength samples.
//!
//! Advertisement bursts report RSSI values that jump by several dBm between
//! consecutive samples. Threshold decisions are made on a smoothed value
//! instead, where the weight given to a new sample grows with the time since
//! the previous one.

use std::time::Duration;

/// Raw signal strength in dBm. Higher (less negative) means closer.
pub type Rssi = i16;

/// Value reported by the platform when no RSSI is available for a sample.
pub const RSSI_UNAVAILABLE: Rssi = 127;

/// Upper bound on the weight of a new sample.
///
/// A single sample arriving after a long gap can move the filtered value at
/// most 80% of the way towards itself.
pub const MAX_SAMPLE_WEIGHT: f64 = 0.8;

/// Compute the next filtered signal value.
///
/// Returns `raw` unchanged when there is no history yet (`previous` is
/// [`RSSI_UNAVAILABLE`]). Otherwise blends the two values with the weight
/// `k = min(elapsed, 0.8)` and rounds to the nearest integer.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use beacon_link::signal::{RSSI_UNAVAILABLE, filter};
///
/// assert_eq!(filter(RSSI_UNAVAILABLE, -60, Duration::ZERO), -60);
/// assert_eq!(filter(-60, -50, Duration::from_secs(5)), -52);
/// ```
pub fn filter(previous: Rssi, raw: Rssi, elapsed: Duration) -> Rssi {
    if previous == RSSI_UNAVAILABLE {
        return raw;
    }
    let k = elapsed.as_secs_f64().min(MAX_SAMPLE_WEIGHT);
    let blended = (1.0 - k) * f64::from(previous) + k * f64::from(raw);
    blended.round() as Rssi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_passes_through() {
        for raw in [-100, -70, -45, 0] {
            assert_eq!(filter(RSSI_UNAVAILABLE, raw, Duration::from_millis(250)), raw);
        }
    }

    #[test]
    fn test_weight_saturates_for_long_gaps() {
        // 0.2 * -80 + 0.8 * -40 = -48
        assert_eq!(filter(-80, -40, Duration::from_millis(800)), -48);
        assert_eq!(filter(-80, -40, Duration::from_secs(3)), -48);
        assert_eq!(filter(-80, -40, Duration::from_secs(3600)), -48);
    }

    #[test]
    fn test_short_gap_favours_history() {
        // 0.9 * -80 + 0.1 * -40 = -76
        assert_eq!(filter(-80, -40, Duration::from_millis(100)), -76);
    }

    #[test]
    fn test_zero_gap_keeps_previous() {
        assert_eq!(filter(-62, -30, Duration::ZERO), -62);
    }

    #[test]
    fn test_rounds_to_nearest() {
        // 0.5 * -61 + 0.5 * -64 = -62.5 -> -63 (away from zero)
        assert_eq!(filter(-61, -64, Duration::from_millis(500)), -63);
        // 0.7 * -60 + 0.3 * -61 = -60.3 -> -60
        assert_eq!(filter(-60, -61, Duration::from_millis(300)), -60);
    }
}
