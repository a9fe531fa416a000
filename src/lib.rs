//! # Pub-Sub Throughput Subscriber Library
//!
//! The receiving half of a distributed throughput benchmark for a
//! publish-subscribe transport. For each payload size the publisher drives,
//! the subscriber counts delivered and lost samples, times the run, and
//! reports the result back over a dedicated control channel.
//!
//! ## Architecture Overview
//!
//! The library is organized bottom-up:
//!
//! - `matching`: matched-peer counts per endpoint role with condition-variable barriers
//! - `loss`: sequence-gap loss detector fed from the data callback
//! - `schema`: static and dynamic payload types and the per-iteration data endpoint
//! - `subscriber`: the test controller state machine tying the above together
//! - `transport`: the transport interface, an in-process loopback bus and a scripted publisher
//! - `command`, `metrics`, `results`: control messages, timing math and result output
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubsub_throughput::transport::{IterationPlan, LoopbackBus, ScriptedPublisher};
//! use pubsub_throughput::{SubscriberConfig, ThroughputSubscriber};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bus = LoopbackBus::new();
//!     let config = SubscriberConfig::default();
//!
//!     let mut subscriber = ThroughputSubscriber::new(config.clone(), Arc::new(bus.participant()));
//!     subscriber.init()?;
//!
//!     let publisher = ScriptedPublisher::new(
//!         bus.participant(),
//!         config,
//!         vec![IterationPlan::new(1024, 100, 10_000)],
//!     )
//!     .spawn();
//!
//!     for result in subscriber.run()? {
//!         println!("{} bytes: {:.0} samples/s", result.payload_size, result.samples_per_second);
//!     }
//!     publisher.join().expect("publisher thread panicked")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! The controller runs on the caller's thread and blocks on condition
//! variables; the transport delivers match and data notifications on its own
//! threads. The data mutex shared between the data callback and the
//! controller is what makes the end-of-test snapshot exact.

/// Control-channel command values and their byte codec
pub mod command;

/// Command-line interface for the self-test binary
pub mod cli;

/// Typed errors of the subscriber core
pub mod error;

/// Tracing formatter and subscriber initialization
pub mod logging;

/// Loss accounting by sequence-number gaps
pub mod loss;

/// Matched-peer counting and discovery barriers
///
/// Each tracker pairs a mutex-guarded count with a condition variable. The
/// transport's matching callbacks update it; the controller blocks on it.
pub mod matching;

/// Clock calibration, saturating elapsed time and throughput math
pub mod metrics;

/// Result records and JSON output
pub mod results;

/// Payload types and the per-iteration data endpoint
pub mod schema;

/// The subscriber-side test controller
pub mod subscriber;

/// Transport interface and the in-process loopback implementation
pub mod transport;

pub mod utils;

pub use command::{CommandKind, ThroughputCommand};
pub use error::{BenchError, Stage};
pub use loss::{LossDetector, LossSnapshot, SequenceSample};
pub use matching::{EndpointRole, MatchTracker};
pub use metrics::{ClockOverhead, ThroughputMetrics};
pub use results::{IterationResult, ResultsManager};
pub use subscriber::{RunPhase, SubscriberConfig, ThroughputSubscriber};

/// The current version of the throughput subscriber
///
/// Populated from Cargo.toml and written into result files.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Payload sizes of the self-test run, in bytes
    pub const PAYLOAD_SIZES: [u32; 4] = [32, 256, 1024, 8192];

    /// Target in-flight samples per iteration
    ///
    /// Also the history depth of a best-effort reader.
    pub const DEMAND: u32 = 100;

    /// Samples the scripted publisher sends per iteration
    pub const SAMPLES: u32 = 10_000;

    /// Upper bound of the dynamic payload type
    pub const MAX_PAYLOAD_SIZE: u32 = 65_536;

    /// Bounded wait between checks of the command reader
    pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Back-to-back clock reads used to calibrate timing overhead
    pub const CALIBRATION_SAMPLES: usize = crate::metrics::MIN_CALIBRATION_SAMPLES;
}
