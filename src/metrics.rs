use crate::error::BenchError;
use crate::loss::LossSnapshot;
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::time::{Duration, Instant};

/// Minimum number of back-to-back clock reads used for calibration
pub const MIN_CALIBRATION_SAMPLES: usize = 1000;

/// Average cost of one clock read
///
/// Subtracted from every measured interval so that microsecond-scale runs
/// are not inflated by the timestamp reads themselves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockOverhead {
    pub micros: f64,
}

impl ClockOverhead {
    pub fn zero() -> Self {
        Self { micros: 0.0 }
    }

    /// Sample the clock `samples` times in a row and average the cost
    ///
    /// Fewer than [`MIN_CALIBRATION_SAMPLES`] requested samples are raised to
    /// that minimum.
    pub fn calibrate(samples: usize) -> Self {
        let samples = samples.max(MIN_CALIBRATION_SAMPLES);
        let start = Instant::now();
        let mut last = start;
        for _ in 0..samples {
            last = black_box(Instant::now());
        }
        let total = last.saturating_duration_since(start);
        Self {
            micros: total.as_secs_f64() * 1e6 / (samples + 1) as f64,
        }
    }
}

/// Clamp a raw microsecond value into `u64`
///
/// Negative values (clock went backwards, overhead larger than the run)
/// saturate at 0 and values beyond the range saturate at `u64::MAX`; both
/// are reported as [`BenchError::ArithmeticSaturation`] carrying the
/// clamped value.
pub fn clamp_micros(raw_micros: f64) -> Result<u64, BenchError> {
    if raw_micros.is_nan() || raw_micros < u64::MIN as f64 {
        return Err(BenchError::ArithmeticSaturation {
            raw_micros,
            clamped: u64::MIN,
        });
    }
    if raw_micros >= u64::MAX as f64 {
        return Err(BenchError::ArithmeticSaturation {
            raw_micros,
            clamped: u64::MAX,
        });
    }
    Ok(raw_micros as u64)
}

/// Length of the timed run minus the calibrated clock overhead
pub fn elapsed_total_micros(
    start: Instant,
    end: Instant,
    overhead: ClockOverhead,
) -> Result<u64, BenchError> {
    let raw = match end.checked_duration_since(start) {
        Some(elapsed) => elapsed.as_secs_f64() * 1e6,
        None => -(start.duration_since(end).as_secs_f64() * 1e6),
    };
    clamp_micros(raw - overhead.micros)
}

/// Per-iteration throughput derived from a loss snapshot and elapsed time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub received_samples: u64,
    pub lost_samples: u64,
    pub total_time_us: u64,
    pub samples_per_second: f64,
    pub megabits_per_second: f64,
}

impl ThroughputMetrics {
    /// `(last_seq - lost) * 1e6 / elapsed_us`; zero when no time elapsed
    pub fn compute(snapshot: LossSnapshot, total_time_us: u64, payload_size: u32) -> Self {
        let received = snapshot.received();
        let samples_per_second = if total_time_us > 0 {
            received as f64 * 1e6 / total_time_us as f64
        } else {
            0.0
        };
        let megabits_per_second = samples_per_second * f64::from(payload_size) * 8.0 / 1e6;

        Self {
            received_samples: received,
            lost_samples: snapshot.cumulative_lost,
            total_time_us,
            samples_per_second,
            megabits_per_second,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.total_time_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_in_range() {
        assert_eq!(clamp_micros(0.0).unwrap(), 0);
        assert_eq!(clamp_micros(1234.9).unwrap(), 1234);
    }

    #[test]
    fn test_clamp_negative_saturates_at_zero() {
        match clamp_micros(-0.25) {
            Err(BenchError::ArithmeticSaturation { clamped, .. }) => assert_eq!(clamped, 0),
            other => panic!("expected saturation, got {:?}", other),
        }
    }

    #[test]
    fn test_clamp_overflow_saturates_at_max() {
        match clamp_micros(1e30) {
            Err(BenchError::ArithmeticSaturation { clamped, .. }) => {
                assert_eq!(clamped, u64::MAX)
            }
            other => panic!("expected saturation, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_elapsed_with_overhead_is_zero() {
        let now = Instant::now();
        let overhead = ClockOverhead { micros: 0.5 };
        let total = elapsed_total_micros(now, now, overhead).unwrap_or_else(|e| match e {
            BenchError::ArithmeticSaturation { clamped, .. } => clamped,
            other => panic!("unexpected error {:?}", other),
        });
        assert_eq!(total, 0);
    }

    #[test]
    fn test_backwards_interval_saturates() {
        let start = Instant::now();
        let end = start + Duration::from_millis(5);
        assert!(matches!(
            elapsed_total_micros(end, start, ClockOverhead::zero()),
            Err(BenchError::ArithmeticSaturation { clamped: 0, .. })
        ));
    }

    #[test]
    fn test_elapsed_subtracts_overhead() {
        let start = Instant::now();
        let end = start + Duration::from_micros(1_000);
        let overhead = ClockOverhead { micros: 10.0 };
        assert_eq!(elapsed_total_micros(start, end, overhead).unwrap(), 990);
    }

    #[test]
    fn test_elapsed_keeps_sub_microsecond_fraction() {
        let start = Instant::now();
        let end = start + Duration::from_nanos(1_000_900);
        let overhead = ClockOverhead { micros: 0.03 };
        // 1000.9 - 0.03 = 1000.87, truncated after the subtraction
        assert_eq!(elapsed_total_micros(start, end, overhead).unwrap(), 1000);
    }

    #[test]
    fn test_calibration_is_small_and_non_negative() {
        let overhead = ClockOverhead::calibrate(10);
        assert!(overhead.micros >= 0.0);
        assert!(overhead.micros < 1_000.0);
    }

    #[test]
    fn test_throughput_from_snapshot() {
        let snapshot = LossSnapshot {
            last_sequence_seen: 1000,
            cumulative_lost: 10,
        };
        let metrics = ThroughputMetrics::compute(snapshot, 500_000, 1024);
        assert_eq!(metrics.received_samples, 990);
        assert_eq!(metrics.lost_samples, 10);
        assert!((metrics.samples_per_second - 1980.0).abs() < 1e-9);
        assert!((metrics.megabits_per_second - 1980.0 * 1024.0 * 8.0 / 1e6).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_with_no_elapsed_time() {
        let metrics = ThroughputMetrics::compute(LossSnapshot::default(), 0, 64);
        assert_eq!(metrics.samples_per_second, 0.0);
        assert_eq!(metrics.received_samples, 0);
    }
}
