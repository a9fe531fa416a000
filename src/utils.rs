//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the subscriber, the scripted publisher and the
//! binary.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: Human-readable display of durations and rates
//! - **Naming**: Host lookup and qualification of control/data topic names
//! - **Identification**: Unique run identifiers for result files
//!
//! ## Usage Examples
//!
//! ```rust
//! use pubsub_throughput::utils::*;
//! use std::time::Duration;
//!
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! let topics = TopicNames::new(Some("node1"), 42);
//! assert_eq!(topics.data, "ThroughputTest_node1_42_DATA");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a benchmark run
///
/// Creates a UUID v4 string used to tag result files so that runs from
/// several hosts can be merged without collisions.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// Automatically selects the most appropriate unit based on magnitude:
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use pubsub_throughput::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a sample rate with K/M suffixes
///
/// ## Examples
///
/// ```rust
/// # use pubsub_throughput::utils::format_sample_rate;
/// assert_eq!(format_sample_rate(512.0), "512.00 samples/s");
/// assert_eq!(format_sample_rate(1_500_000.0), "1.50M samples/s");
/// ```
pub fn format_sample_rate(samples_per_second: f64) -> String {
    if samples_per_second < 1_000.0 {
        format!("{:.2} samples/s", samples_per_second)
    } else if samples_per_second < 1_000_000.0 {
        format!("{:.2}K samples/s", samples_per_second / 1_000.0)
    } else {
        format!("{:.2}M samples/s", samples_per_second / 1_000_000.0)
    }
}

/// Format a bit rate given in megabits per second
pub fn format_bit_rate(megabits_per_second: f64) -> String {
    if megabits_per_second < 1_000.0 {
        format!("{:.2} Mbit/s", megabits_per_second)
    } else {
        format!("{:.2} Gbit/s", megabits_per_second / 1_000.0)
    }
}

/// Name of the local host
///
/// Falls back to the `HOSTNAME` environment variable and finally to
/// `"localhost"` when the system call is unavailable or fails.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Topic names shared by the publisher and subscriber of one test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    /// Data channel under measurement
    pub data: String,
    /// Commands from publisher to subscriber
    pub pub2sub: String,
    /// Commands from subscriber to publisher
    pub sub2pub: String,
}

impl TopicNames {
    /// Build names qualified with the process id and, optionally, the host
    pub fn new(hostname: Option<&str>, pid: u32) -> Self {
        let base = match hostname {
            Some(host) => format!("ThroughputTest_{}_{}", host, pid),
            None => format!("ThroughputTest_{}", pid),
        };
        Self {
            data: format!("{}_DATA", base),
            pub2sub: format!("{}_PUB2SUB", base),
            sub2pub: format!("{}_SUB2PUB", base),
        }
    }
}
