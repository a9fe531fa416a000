//! # Throughput Subscriber - Self-Test Entry Point
//!
//! Runs the subscriber test controller against a scripted publisher on an
//! in-process loopback bus. The controller, the command protocol and the
//! loss accounting are the same code a networked deployment would use; only
//! the transport is local.
//!
//! ## Architecture Overview
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: Processes command-line configuration
//! 2. **Initialize logging**: Colorized tracing output, or a log file
//! 3. **Initialize the subscriber**: Joins the domain and creates control endpoints
//! 4. **Start the publisher**: Plays one iteration per payload size on its own thread
//! 5. **Run the command loop**: Services commands until ALL_STOPS
//! 6. **Generate results**: Logs a summary and writes JSON when requested
//!
//! ## Error Handling
//!
//! Initialization failures are fatal and reported before the publisher is
//! started. Failures inside an iteration are logged by the controller and
//! surface here as a publisher error.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use pubsub_throughput::{
    cli::Args,
    logging,
    results::ResultsManager,
    subscriber::{SubscriberConfig, ThroughputSubscriber},
    transport::{IterationPlan, LoopbackBus, ScriptedPublisher},
};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    // The guard flushes the non-blocking file writer on drop.
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!("Starting throughput subscriber self-test");
    info!("Configuration: {:?}", args);

    let config = SubscriberConfig::from_args(&args)?;
    let bus = LoopbackBus::new();

    let mut subscriber = ThroughputSubscriber::new(config.clone(), Arc::new(bus.participant()));
    subscriber
        .init()
        .context("Subscriber initialization failed")?;

    let plans = build_plans(&args);
    let publisher = ScriptedPublisher::new(bus.participant(), config, plans).spawn();

    let results = subscriber.run()?;

    match publisher.join() {
        Ok(Ok(reports)) => info!("Publisher received {} report(s)", reports.len()),
        Ok(Err(e)) => {
            error!("Publisher failed: {:#}", e);
            return Err(e);
        }
        Err(_) => return Err(anyhow!("Publisher thread panicked")),
    }

    let mut results_manager = ResultsManager::new(args.output_file.as_deref());
    for result in results {
        results_manager.add_result(result);
    }
    results_manager.finalize()?;

    info!("Throughput subscriber self-test completed successfully");
    Ok(())
}

/// One plan per payload size, each dropping the requested ranges
fn build_plans(args: &Args) -> Vec<IterationPlan> {
    args.payload_sizes
        .iter()
        .map(|size| {
            args.drop.iter().cloned().fold(
                IterationPlan::new(*size, args.demand, args.samples),
                IterationPlan::with_dropped,
            )
        })
        .collect()
}
