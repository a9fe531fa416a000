//! # Throughput Subscriber
//!
//! The test controller for the receiving side of the benchmark. It keeps a
//! remote publisher and this process in lock-step over two control channels
//! while the data channel under measurement is created, timed, drained and
//! torn down once per payload size.
//!
//! ## Phases
//!
//! ```text
//! Idle --init--> AwaitingControlDiscovery --2 command peers--> AwaitingCommand
//! AwaitingCommand --READY_TO_START--> RunningTest   (data barrier, then BEGIN)
//! RunningTest     --TEST_STARTS-->    RunningTest   (start timestamp)
//! RunningTest     --TEST_ENDS-->      StoppingTest  (end timestamp, snapshot)
//! StoppingTest    --quiesced-->       AwaitingCommand (teardown, TEST_RESULTS)
//! AwaitingCommand --ALL_STOPS-->      AllStopped
//! ```
//!
//! ## Data Path
//!
//! Samples are consumed on the transport's callback thread by
//! [`DataReaderListener`], which holds the data mutex for the whole drain.
//! The controller takes the same mutex at TEST_ENDS to snapshot the loss
//! detector and close the collection window, and releases it before touching
//! any match tracker. Entities are destroyed only after the publisher's
//! writer has unmatched and the reader has no callbacks queued or running.

use crate::cli::Args;
use crate::command::{CommandKind, ThroughputCommand};
use crate::error::{BenchError, Stage};
use crate::loss::{LossDetector, LossSnapshot};
use crate::matching::{EndpointRole, MatchListener, MatchTracker};
use crate::metrics::{elapsed_total_micros, ClockOverhead, ThroughputMetrics};
use crate::results::IterationResult;
use crate::schema::{DataEndpointQos, PayloadSchemaManager, SeqnumField};
use crate::transport::{
    ChannelHandle, Direction, EndpointId, EndpointListener, EndpointSpec, HistoryPolicy,
    MatchStatus, ParticipantOptions, Reliability, SchemaHandle, SchemaKind, Transport,
    TransportError,
};
use crate::utils::{format_bit_rate, format_duration, format_sample_rate, local_hostname, TopicNames};
use anyhow::bail;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Domains are derived from the process id modulo this value
pub const DOMAIN_ID_MODULUS: u32 = 230;

/// Startup parameters handed to the controller
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    /// Reliable data reader; best-effort otherwise
    pub reliable: bool,
    /// Process id shared with the publisher; qualifies topics and the domain
    pub pid: u32,
    /// Qualify topic names with the local hostname
    pub hostname: bool,
    /// Overrides the pid-derived domain
    pub forced_domain: Option<u32>,
    pub xml_profile: Option<PathBuf>,
    /// Use the runtime-described payload type instead of one type per size
    pub dynamic_types: bool,
    /// Upper bound of the dynamic payload sequence
    pub max_payload_size: u32,
    /// Bounded wait used when polling the command reader
    pub command_poll_interval: Duration,
    pub calibration_samples: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            reliable: false,
            pid: std::process::id(),
            hostname: false,
            forced_domain: None,
            xml_profile: None,
            dynamic_types: false,
            max_payload_size: crate::defaults::MAX_PAYLOAD_SIZE,
            command_poll_interval: crate::defaults::COMMAND_POLL_INTERVAL,
            calibration_samples: crate::defaults::CALIBRATION_SAMPLES,
        }
    }
}

impl SubscriberConfig {
    /// Build the configuration from parsed command-line arguments
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        if args.dynamic_types {
            if args.max_payload_size == 0 {
                bail!("--max-payload-size must be positive with --dynamic-types");
            }
            if let Some(size) = args
                .payload_sizes
                .iter()
                .find(|size| **size > args.max_payload_size)
            {
                bail!(
                    "payload size {} exceeds --max-payload-size {}",
                    size,
                    args.max_payload_size
                );
            }
        }

        Ok(Self {
            reliable: args.reliable,
            pid: args.pid.unwrap_or_else(std::process::id),
            hostname: args.hostname,
            forced_domain: args.domain,
            xml_profile: args.xml.clone(),
            dynamic_types: args.dynamic_types,
            max_payload_size: args.max_payload_size,
            ..Self::default()
        })
    }

    pub fn domain_id(&self) -> u32 {
        self.forced_domain
            .unwrap_or(self.pid % DOMAIN_ID_MODULUS)
    }

    pub fn topic_names(&self) -> TopicNames {
        if self.hostname {
            TopicNames::new(Some(&local_hostname()), self.pid)
        } else {
            TopicNames::new(None, self.pid)
        }
    }

    pub fn reliability(&self) -> Reliability {
        Reliability::from_flag(self.reliable)
    }

    /// History of the data reader for an iteration with the given demand
    pub fn data_history(&self, demand: u32) -> HistoryPolicy {
        if self.reliable {
            HistoryPolicy::KeepAll
        } else {
            HistoryPolicy::KeepLast((demand as usize).max(1))
        }
    }

    pub fn schema_kind(&self) -> SchemaKind {
        if self.dynamic_types {
            SchemaKind::Dynamic
        } else {
            SchemaKind::Static
        }
    }
}

/// Lifecycle phase of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    AwaitingControlDiscovery,
    AwaitingCommand,
    RunningTest,
    /// Collection closed; waiting for the data path to drain before teardown
    StoppingTest,
    AllStopped,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::AwaitingControlDiscovery => "awaiting control discovery",
            RunPhase::AwaitingCommand => "awaiting command",
            RunPhase::RunningTest => "running test",
            RunPhase::StoppingTest => "stopping test",
            RunPhase::AllStopped => "all stopped",
        };
        f.write_str(name)
    }
}

/// State guarded by the data mutex
#[derive(Debug, Default)]
struct DataState {
    detector: LossDetector,
    field: Option<SeqnumField>,
    collecting: bool,
    received: u64,
    not_alive: u64,
    discarded: u64,
}

impl DataState {
    fn open_window(&mut self, field: SeqnumField) {
        self.detector.reset();
        self.field = Some(field);
        self.collecting = true;
        self.received = 0;
        self.not_alive = 0;
        self.discarded = 0;
    }
}

/// Counters read at the end of an iteration
#[derive(Debug, Clone, Copy)]
struct WindowSummary {
    snapshot: LossSnapshot,
    received: u64,
    not_alive: u64,
    discarded: u64,
}

/// Listener attached to the data reader
///
/// Forwards match changes to the data tracker and drains every available
/// sample into the loss detector while the collection window is open.
pub struct DataReaderListener {
    tracker: Arc<MatchTracker>,
    data: Arc<Mutex<DataState>>,
}

impl EndpointListener for DataReaderListener {
    fn on_match_changed(&self, endpoint: EndpointId, status: MatchStatus) {
        debug!(
            "Data reader {} matched {} writer(s)",
            endpoint, status.current_count
        );
        self.tracker
            .on_match_change(EndpointRole::Data, status.current_count_change);
    }

    fn on_data_available(&self, endpoint: EndpointId, transport: &dyn Transport) {
        let mut state = self.data.lock();
        while let Some(delivery) = transport.try_take_next(endpoint) {
            if !state.collecting {
                state.discarded += 1;
                continue;
            }
            let Some(field) = state.field else {
                state.discarded += 1;
                continue;
            };
            let sample = field.sample_of(&delivery);
            if delivery.is_alive() {
                state.received += 1;
            } else {
                state.not_alive += 1;
            }
            state.detector.on_sample(sample);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CommandEndpoints {
    schema: SchemaHandle,
    pub2sub: ChannelHandle,
    sub2pub: ChannelHandle,
    reader: EndpointId,
    writer: EndpointId,
}

#[derive(Debug, Clone, Copy)]
struct Iteration {
    payload_size: u32,
    demand: u32,
    started: Option<Instant>,
}

/// The subscriber-side test controller
pub struct ThroughputSubscriber {
    config: SubscriberConfig,
    transport: Arc<dyn Transport>,
    topics: TopicNames,
    phase: RunPhase,
    command_matches: Arc<MatchTracker>,
    data_matches: Arc<MatchTracker>,
    data: Arc<Mutex<DataState>>,
    schemas: PayloadSchemaManager,
    command: Option<CommandEndpoints>,
    overhead: ClockOverhead,
    iteration: Option<Iteration>,
    results: Vec<IterationResult>,
}

impl ThroughputSubscriber {
    pub fn new(config: SubscriberConfig, transport: Arc<dyn Transport>) -> Self {
        let topics = config.topic_names();
        let schemas = PayloadSchemaManager::new(Arc::clone(&transport), topics.data.clone());
        Self {
            config,
            transport,
            topics,
            phase: RunPhase::Idle,
            command_matches: Arc::new(MatchTracker::new("command")),
            data_matches: Arc::new(MatchTracker::new("data")),
            data: Arc::new(Mutex::new(DataState::default())),
            schemas,
            command: None,
            overhead: ClockOverhead::zero(),
            iteration: None,
            results: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicNames {
        &self.topics
    }

    /// Calibrated cost of one clock read
    pub fn clock_overhead(&self) -> ClockOverhead {
        self.overhead
    }

    /// Results of the iterations completed so far
    pub fn results(&self) -> &[IterationResult] {
        &self.results
    }

    fn transition(&mut self, next: RunPhase) {
        debug!("Subscriber phase: {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Join the domain and create the control-channel entities
    ///
    /// Any failure is fatal; the caller must not proceed to [`Self::run`].
    pub fn init(&mut self) -> Result<(), BenchError> {
        if self.phase != RunPhase::Idle {
            return Err(BenchError::AlreadyInitialized);
        }

        self.overhead = ClockOverhead::calibrate(self.config.calibration_samples);
        debug!("Clock overhead calibrated at {:.4}us", self.overhead.micros);

        let options = ParticipantOptions {
            name: format!("throughput-subscriber-{}", self.config.pid),
            domain_id: self.config.domain_id(),
            profile_path: self.config.xml_profile.clone(),
        };
        match self.transport.open_participant(&options) {
            Ok(()) => {}
            Err(TransportError::AlreadyOpen) => debug!("Participant already open"),
            Err(e) => return Err(BenchError::create(Stage::Participant)(e)),
        }

        self.command = Some(self.create_command_endpoints()?);

        if self.config.dynamic_types {
            if let Err(e) = self
                .schemas
                .create_dynamic_schema(self.config.max_payload_size)
            {
                self.shutdown();
                return Err(e);
            }
        }

        info!(
            "Subscriber ready on domain {} ({}, {:?} payload type, topics {} / {} / {})",
            options.domain_id,
            self.config.reliability(),
            self.config.schema_kind(),
            self.topics.data,
            self.topics.pub2sub,
            self.topics.sub2pub
        );
        self.transition(RunPhase::AwaitingControlDiscovery);
        Ok(())
    }

    /// Create the command schema, both command channels and their endpoints
    ///
    /// Entities created before a failure are released again.
    fn create_command_endpoints(&self) -> Result<CommandEndpoints, BenchError> {
        let schema = self
            .transport
            .register_schema(&ThroughputCommand::schema_descriptor())
            .map_err(BenchError::create(Stage::SchemaRegistration))?;
        let mut channels = Vec::with_capacity(2);
        let mut endpoints = Vec::with_capacity(2);

        match self.build_command_endpoints(schema, &mut channels, &mut endpoints) {
            Ok(command) => Ok(command),
            Err(e) => {
                self.release_command_entities(&endpoints, &channels, schema);
                Err(e)
            }
        }
    }

    fn build_command_endpoints(
        &self,
        schema: SchemaHandle,
        channels: &mut Vec<ChannelHandle>,
        endpoints: &mut Vec<EndpointId>,
    ) -> Result<CommandEndpoints, BenchError> {
        let pub2sub = self
            .transport
            .create_channel(&self.topics.pub2sub, schema)
            .map_err(BenchError::create(Stage::Channel))?;
        channels.push(pub2sub);
        let sub2pub = self
            .transport
            .create_channel(&self.topics.sub2pub, schema)
            .map_err(BenchError::create(Stage::Channel))?;
        channels.push(sub2pub);

        let reader = self
            .transport
            .create_endpoint(
                &EndpointSpec {
                    channel: pub2sub,
                    direction: Direction::Reader,
                    reliability: Reliability::Reliable,
                    history: HistoryPolicy::KeepAll,
                },
                Arc::new(MatchListener::new(
                    EndpointRole::CommandReceive,
                    Arc::clone(&self.command_matches),
                )),
            )
            .map_err(BenchError::create(Stage::Endpoint))?;
        endpoints.push(reader);
        let writer = self
            .transport
            .create_endpoint(
                &EndpointSpec {
                    channel: sub2pub,
                    direction: Direction::Writer,
                    reliability: Reliability::Reliable,
                    history: HistoryPolicy::KeepAll,
                },
                Arc::new(MatchListener::new(
                    EndpointRole::CommandSend,
                    Arc::clone(&self.command_matches),
                )),
            )
            .map_err(BenchError::create(Stage::Endpoint))?;
        endpoints.push(writer);

        Ok(CommandEndpoints {
            schema,
            pub2sub,
            sub2pub,
            reader,
            writer,
        })
    }

    /// Destroy endpoints, then channels, then the command schema
    fn release_command_entities(
        &self,
        endpoints: &[EndpointId],
        channels: &[ChannelHandle],
        schema: SchemaHandle,
    ) {
        for endpoint in endpoints {
            if let Err(e) = self.transport.destroy_endpoint(*endpoint) {
                warn!("Failed to destroy command endpoint {}: {}", endpoint, e);
            }
        }
        for channel in channels {
            if let Err(e) = self.transport.destroy_channel(*channel) {
                warn!("Failed to destroy command channel {}: {}", channel, e);
            }
        }
        if let Err(e) = self.transport.unregister_schema(schema) {
            warn!("Failed to unregister command schema: {}", e);
        }
    }

    /// Run the command loop until ALL_STOPS
    ///
    /// Blocks until both control endpoints have discovered the publisher,
    /// then services commands one at a time. Returns the per-iteration
    /// results; transport entities are released before returning.
    pub fn run(&mut self) -> Result<Vec<IterationResult>, BenchError> {
        if self.phase != RunPhase::AwaitingControlDiscovery {
            return Err(BenchError::NotInitialized);
        }
        let command = self.command.ok_or(BenchError::NotInitialized)?;

        info!("Waiting for the publisher on the control channels");
        self.command_matches
            .wait_until(|counts| counts.command_total() >= 2, None);
        info!("Publisher discovered");
        self.transition(RunPhase::AwaitingCommand);

        while self.phase != RunPhase::AllStopped {
            if let Some(received) = self.next_command(command.reader) {
                self.handle_command(received);
            }
        }

        self.shutdown();
        Ok(self.results.clone())
    }

    /// Take one command, waiting at most the poll interval for it
    fn next_command(&self, reader: EndpointId) -> Option<ThroughputCommand> {
        match self.transport.try_take_next(reader) {
            Some(delivery) if delivery.is_alive() => {
                match ThroughputCommand::from_bytes(&delivery.payload) {
                    Ok(command) => Some(command),
                    Err(e) => {
                        warn!("Discarding undecodable command: {}", e);
                        None
                    }
                }
            }
            Some(_) => None,
            None => {
                self.transport
                    .wait_for_unread(reader, self.config.command_poll_interval);
                None
            }
        }
    }

    /// Apply one received command to the state machine
    pub fn handle_command(&mut self, command: ThroughputCommand) {
        debug!("Received {} in phase {}", command, self.phase);
        match (self.phase, command.kind) {
            (RunPhase::AwaitingCommand, CommandKind::ReadyToStart) => {
                self.prepare_iteration(command.size, command.demand)
            }
            (RunPhase::RunningTest, CommandKind::TestStarts) => {
                if let Some(iteration) = self.iteration.as_mut() {
                    iteration.started = Some(Instant::now());
                }
            }
            (RunPhase::RunningTest, CommandKind::TestEnds) => self.finish_iteration(),
            (RunPhase::AwaitingCommand, CommandKind::AllStops) => {
                info!("Publisher finished after {} iteration(s)", self.results.len());
                self.transition(RunPhase::AllStopped);
            }
            (RunPhase::RunningTest, CommandKind::AllStops) => {
                warn!("Ignoring ALL_STOPS while a test is running");
            }
            (phase, kind) => debug!("Ignoring {} in phase {}", kind, phase),
        }
    }

    fn prepare_iteration(&mut self, payload_size: u32, demand: u32) {
        info!(
            "Preparing iteration: {} byte payload, demand {}",
            payload_size, demand
        );

        if !self.config.dynamic_types {
            match self.schemas.create_static_schema(payload_size) {
                Ok(()) => {}
                Err(BenchError::AlreadyInitialized) => {
                    warn!("Payload schema still registered; reusing it")
                }
                Err(e) => error!("Failed to register payload schema: {}", e),
            }
        } else if payload_size > self.config.max_payload_size {
            warn!(
                "Payload size {} exceeds dynamic bound {}",
                payload_size, self.config.max_payload_size
            );
        }

        let Some(field) = self.schemas.schema().map(|s| s.seqnum_field()) else {
            error!("No payload schema available; not acknowledging READY_TO_START");
            return;
        };
        self.data.lock().open_window(field);

        let qos = DataEndpointQos {
            direction: Direction::Reader,
            reliability: self.config.reliability(),
            history: self.config.data_history(demand),
        };
        let listener = Arc::new(DataReaderListener {
            tracker: Arc::clone(&self.data_matches),
            data: Arc::clone(&self.data),
        });
        match self.schemas.create_data_endpoints(qos, listener) {
            Ok(_) => {}
            Err(BenchError::AlreadyInitialized) => {
                warn!("Data endpoints still exist; reusing them")
            }
            Err(e) => {
                error!("Failed to create data endpoints: {}", e);
                self.data.lock().collecting = false;
                return;
            }
        }

        self.iteration = Some(Iteration {
            payload_size,
            demand,
            started: None,
        });
        self.transition(RunPhase::RunningTest);

        debug!("Waiting for the publisher's data writer");
        self.data_matches
            .wait_until(|counts| counts.get(EndpointRole::Data) >= 1, None);

        if let Err(e) = self.send_command(ThroughputCommand::begin(payload_size, demand)) {
            error!("Failed to acknowledge READY_TO_START: {}", e);
        }
    }

    fn finish_iteration(&mut self) {
        let ended = Instant::now();
        let window = {
            let mut state = self.data.lock();
            state.collecting = false;
            WindowSummary {
                snapshot: state.detector.snapshot(),
                received: state.received,
                not_alive: state.not_alive,
                discarded: state.discarded,
            }
        };
        self.transition(RunPhase::StoppingTest);

        let Some(iteration) = self.iteration.take() else {
            warn!("TEST_ENDS without a prepared iteration");
            self.transition(RunPhase::AwaitingCommand);
            return;
        };
        if window.received == 0 {
            warn!(
                "No data received during the {} byte iteration",
                iteration.payload_size
            );
        }

        self.data_matches
            .wait_until(|counts| counts.get(EndpointRole::Data) == 0, None);
        if let Some(reader) = self.schemas.data_endpoint() {
            if let Err(e) = self.transport.await_quiescence(reader) {
                warn!("Data reader {} did not quiesce cleanly: {}", reader, e);
            }
        }
        if let Err(e) = self.schemas.destroy_data_endpoints() {
            warn!("Data endpoint teardown incomplete: {}", e);
        }

        let total_time_us = match iteration.started {
            Some(started) => match elapsed_total_micros(started, ended, self.overhead) {
                Ok(micros) => micros,
                Err(BenchError::ArithmeticSaturation { raw_micros, clamped }) => {
                    warn!(
                        "Elapsed time {:.3}us out of range, using {}us",
                        raw_micros, clamped
                    );
                    clamped
                }
                Err(e) => {
                    warn!("Could not compute elapsed time: {}", e);
                    0
                }
            },
            None => {
                warn!("TEST_ENDS without TEST_STARTS; reporting zero elapsed time");
                0
            }
        };

        let metrics =
            ThroughputMetrics::compute(window.snapshot, total_time_us, iteration.payload_size);
        let report = ThroughputCommand::test_results(
            iteration.payload_size,
            iteration.demand,
            window.snapshot.last_sequence_seen,
            window.snapshot.cumulative_lost,
            total_time_us,
        );
        if let Err(e) = self.send_command(report) {
            error!("Failed to send TEST_RESULTS: {}", e);
        }

        info!(
            "{:>8} bytes: {} received, {} lost, {} in {} ({})",
            iteration.payload_size,
            metrics.received_samples,
            metrics.lost_samples,
            format_sample_rate(metrics.samples_per_second),
            format_duration(metrics.elapsed()),
            format_bit_rate(metrics.megabits_per_second)
        );
        if window.not_alive > 0 || window.discarded > 0 {
            debug!(
                "{} not-alive sample(s), {} sample(s) outside the collection window",
                window.not_alive, window.discarded
            );
        }

        let result = IterationResult::new(
            self.results.len() + 1,
            iteration.payload_size,
            iteration.demand,
            window.snapshot,
            &metrics,
        )
        .with_qos(self.config.reliability(), self.config.schema_kind())
        .with_delivered(window.received);
        self.results.push(result);
        self.transition(RunPhase::AwaitingCommand);
    }

    fn send_command(&self, command: ThroughputCommand) -> Result<(), BenchError> {
        let writer = self
            .command
            .map(|c| c.writer)
            .ok_or(BenchError::NotInitialized)?;
        let bytes = command.to_bytes()?;
        self.transport
            .send(writer, &bytes)
            .map_err(BenchError::Send)?;
        debug!("Sent {}", command);
        Ok(())
    }

    /// Release every transport entity still owned by the controller
    pub fn shutdown(&mut self) {
        self.schemas.shutdown();
        if let Some(command) = self.command.take() {
            self.release_command_entities(
                &[command.reader, command.writer],
                &[command.pub2sub, command.sub2pub],
                command.schema,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DynamicSchema, PayloadSchema, StaticSchema};
    use crate::transport::{Delivery, LoopbackBus, LoopbackTransport, SchemaDescriptor};
    use std::thread;

    fn config(pid: u32) -> SubscriberConfig {
        SubscriberConfig {
            pid,
            calibration_samples: 0,
            command_poll_interval: Duration::from_millis(10),
            ..SubscriberConfig::default()
        }
    }

    #[test]
    fn test_domain_from_pid() {
        assert_eq!(config(231).domain_id(), 1);
        assert_eq!(config(229).domain_id(), 229);

        let forced = SubscriberConfig {
            forced_domain: Some(7),
            ..config(231)
        };
        assert_eq!(forced.domain_id(), 7);
    }

    #[test]
    fn test_config_from_args() {
        let args = Args {
            reliable: true,
            pid: Some(460),
            xml: Some(PathBuf::from("profiles.xml")),
            max_payload_size: 1024,
            payload_sizes: vec![64, 2048],
            ..Default::default()
        };
        let config = SubscriberConfig::from_args(&args).unwrap();
        assert!(config.reliable);
        assert_eq!(config.domain_id(), 0);
        assert_eq!(config.xml_profile, Some(PathBuf::from("profiles.xml")));
        assert_eq!(config.command_poll_interval, crate::defaults::COMMAND_POLL_INTERVAL);

        let dynamic = Args {
            dynamic_types: true,
            ..args
        };
        assert!(SubscriberConfig::from_args(&dynamic).is_err());
    }

    #[test]
    fn test_history_follows_reliability() {
        let best_effort = config(1);
        assert_eq!(best_effort.data_history(100), HistoryPolicy::KeepLast(100));
        assert_eq!(best_effort.data_history(0), HistoryPolicy::KeepLast(1));

        let reliable = SubscriberConfig {
            reliable: true,
            ..config(1)
        };
        assert_eq!(reliable.data_history(100), HistoryPolicy::KeepAll);
    }

    #[test]
    fn test_topic_names_use_pid() {
        let topics = config(42).topic_names();
        assert_eq!(topics.data, "ThroughputTest_42_DATA");
    }

    #[test]
    fn test_init_twice_is_rejected() {
        let bus = LoopbackBus::new();
        let mut subscriber = ThroughputSubscriber::new(config(3), Arc::new(bus.participant()));

        subscriber.init().unwrap();
        assert_eq!(subscriber.phase(), RunPhase::AwaitingControlDiscovery);
        assert!(matches!(
            subscriber.init(),
            Err(BenchError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_run_before_init_is_rejected() {
        let bus = LoopbackBus::new();
        let mut subscriber = ThroughputSubscriber::new(config(4), Arc::new(bus.participant()));
        assert!(matches!(subscriber.run(), Err(BenchError::NotInitialized)));
    }

    #[test]
    fn test_unexpected_commands_leave_phase_unchanged() {
        let bus = LoopbackBus::new();
        let mut subscriber = ThroughputSubscriber::new(config(5), Arc::new(bus.participant()));
        subscriber.init().unwrap();
        subscriber.transition(RunPhase::AwaitingCommand);

        subscriber.handle_command(ThroughputCommand::new(CommandKind::TestEnds));
        subscriber.handle_command(ThroughputCommand::new(CommandKind::None));
        subscriber.handle_command(ThroughputCommand::new(CommandKind::Begin));
        assert_eq!(subscriber.phase(), RunPhase::AwaitingCommand);

        subscriber.handle_command(ThroughputCommand::new(CommandKind::AllStops));
        assert_eq!(subscriber.phase(), RunPhase::AllStopped);
    }

    struct QueuedSamples(Mutex<Vec<Delivery>>);

    impl Transport for QueuedSamples {
        fn open_participant(&self, _: &ParticipantOptions) -> Result<(), TransportError> {
            Ok(())
        }
        fn register_schema(
            &self,
            _: &SchemaDescriptor,
        ) -> Result<SchemaHandle, TransportError> {
            Ok(SchemaHandle(1))
        }
        fn unregister_schema(&self, _: SchemaHandle) -> Result<(), TransportError> {
            Ok(())
        }
        fn create_channel(
            &self,
            _: &str,
            _: SchemaHandle,
        ) -> Result<ChannelHandle, TransportError> {
            Ok(ChannelHandle(1))
        }
        fn destroy_channel(&self, _: ChannelHandle) -> Result<(), TransportError> {
            Ok(())
        }
        fn create_endpoint(
            &self,
            _: &EndpointSpec,
            _: Arc<dyn EndpointListener>,
        ) -> Result<EndpointId, TransportError> {
            Ok(EndpointId(1))
        }
        fn destroy_endpoint(&self, _: EndpointId) -> Result<(), TransportError> {
            Ok(())
        }
        fn try_take_next(&self, _: EndpointId) -> Option<Delivery> {
            let mut queue = self.0.lock();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        }
        fn send(&self, _: EndpointId, _: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn wait_for_unread(&self, _: EndpointId, _: Duration) -> bool {
            false
        }
        fn await_quiescence(&self, _: EndpointId) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn encoded(seqnum: u32) -> Vec<u8> {
        let mut payload = vec![0u8; 8];
        payload[..4].copy_from_slice(&seqnum.to_le_bytes());
        payload
    }

    #[test]
    fn test_data_listener_counts_only_inside_window() {
        let data = Arc::new(Mutex::new(DataState::default()));
        let listener = DataReaderListener {
            tracker: Arc::new(MatchTracker::new("data")),
            data: Arc::clone(&data),
        };
        let source = QueuedSamples(Mutex::new(vec![Delivery::alive(encoded(1))]));

        listener.on_data_available(EndpointId(1), &source);
        assert_eq!(data.lock().discarded, 1);
        assert_eq!(data.lock().received, 0);

        let field = PayloadSchema::Static(StaticSchema::new(4)).seqnum_field();
        data.lock().open_window(field);
        source.0.lock().extend([
            Delivery::alive(encoded(1)),
            Delivery::alive(encoded(2)),
            Delivery::not_alive(encoded(3)),
            Delivery::alive(encoded(5)),
        ]);
        listener.on_data_available(EndpointId(1), &source);

        let state = data.lock();
        assert_eq!(state.received, 3);
        assert_eq!(state.not_alive, 1);
        assert_eq!(state.detector.snapshot().last_sequence_seen, 5);
        assert_eq!(state.detector.snapshot().cumulative_lost, 2);
    }

    /// Loopback participant that logs teardown calls and can refuse a type
    struct Recording {
        inner: LoopbackTransport,
        calls: Mutex<Vec<String>>,
        refused_type: Mutex<Option<String>>,
    }

    impl Recording {
        fn new(inner: LoopbackTransport) -> Self {
            Self {
                inner,
                calls: Mutex::new(Vec::new()),
                refused_type: Mutex::new(None),
            }
        }

        fn log(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn position(&self, call: &str) -> Option<usize> {
            self.calls.lock().iter().position(|c| c == call)
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl Transport for Recording {
        fn open_participant(&self, options: &ParticipantOptions) -> Result<(), TransportError> {
            self.inner.open_participant(options)
        }
        fn register_schema(
            &self,
            descriptor: &SchemaDescriptor,
        ) -> Result<SchemaHandle, TransportError> {
            if self.refused_type.lock().as_deref() == Some(descriptor.type_name.as_str()) {
                return Err(TransportError::InUse(descriptor.type_name.clone()));
            }
            self.inner.register_schema(descriptor)
        }
        fn unregister_schema(&self, schema: SchemaHandle) -> Result<(), TransportError> {
            self.log(format!("unregister_schema {}", schema));
            self.inner.unregister_schema(schema)
        }
        fn create_channel(
            &self,
            name: &str,
            schema: SchemaHandle,
        ) -> Result<ChannelHandle, TransportError> {
            self.inner.create_channel(name, schema)
        }
        fn destroy_channel(&self, channel: ChannelHandle) -> Result<(), TransportError> {
            self.log(format!("destroy_channel {}", channel));
            self.inner.destroy_channel(channel)
        }
        fn create_endpoint(
            &self,
            spec: &EndpointSpec,
            listener: Arc<dyn EndpointListener>,
        ) -> Result<EndpointId, TransportError> {
            self.inner.create_endpoint(spec, listener)
        }
        fn destroy_endpoint(&self, endpoint: EndpointId) -> Result<(), TransportError> {
            self.log(format!("destroy_endpoint {}", endpoint));
            self.inner.destroy_endpoint(endpoint)
        }
        fn try_take_next(&self, endpoint: EndpointId) -> Option<Delivery> {
            self.inner.try_take_next(endpoint)
        }
        fn send(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), TransportError> {
            self.inner.send(endpoint, payload)
        }
        fn wait_for_unread(&self, endpoint: EndpointId, timeout: Duration) -> bool {
            self.inner.wait_for_unread(endpoint, timeout)
        }
        fn await_quiescence(&self, endpoint: EndpointId) -> Result<(), TransportError> {
            let outcome = self.inner.await_quiescence(endpoint);
            self.log(format!("await_quiescence {}", endpoint));
            outcome
        }
    }

    struct Quiet;

    impl EndpointListener for Quiet {
        fn on_match_changed(&self, _endpoint: EndpointId, _status: MatchStatus) {}
    }

    #[test]
    fn test_failed_dynamic_schema_releases_command_entities() {
        let bus = LoopbackBus::new();
        let config = SubscriberConfig {
            dynamic_types: true,
            max_payload_size: 1024,
            ..config(6)
        };
        let transport = Arc::new(Recording::new(bus.participant()));
        let dynamic_type = PayloadSchema::Dynamic(DynamicSchema::throughput(1024))
            .descriptor()
            .type_name;
        *transport.refused_type.lock() = Some(dynamic_type);
        let mut subscriber = ThroughputSubscriber::new(config, transport.clone());

        assert!(matches!(
            subscriber.init(),
            Err(BenchError::TransportCreateFailed {
                stage: Stage::SchemaRegistration,
                ..
            })
        ));
        assert_eq!(subscriber.phase(), RunPhase::Idle);
        assert_eq!(transport.count("destroy_endpoint"), 2);
        assert_eq!(transport.count("destroy_channel"), 2);
        assert_eq!(transport.count("unregister_schema"), 1);

        *transport.refused_type.lock() = None;
        subscriber.init().unwrap();
        assert_eq!(subscriber.phase(), RunPhase::AwaitingControlDiscovery);
    }

    #[test]
    fn test_partial_command_setup_is_rolled_back() {
        let bus = LoopbackBus::new();
        let config = config(7);
        let transport = Arc::new(Recording::new(bus.participant()));
        transport
            .open_participant(&ParticipantOptions {
                name: "occupant".to_string(),
                domain_id: config.domain_id(),
                profile_path: None,
            })
            .unwrap();
        let schema = transport
            .register_schema(&ThroughputCommand::schema_descriptor())
            .unwrap();
        let occupied = transport
            .create_channel(&config.topic_names().sub2pub, schema)
            .unwrap();

        let mut subscriber = ThroughputSubscriber::new(config, transport.clone());
        assert!(matches!(
            subscriber.init(),
            Err(BenchError::TransportCreateFailed {
                stage: Stage::Channel,
                ..
            })
        ));
        assert_eq!(transport.count("destroy_channel"), 1);
        assert_eq!(transport.count("unregister_schema"), 1);

        transport.destroy_channel(occupied).unwrap();
        transport.unregister_schema(schema).unwrap();
        subscriber.init().unwrap();
        assert_eq!(subscriber.phase(), RunPhase::AwaitingControlDiscovery);
    }

    #[test]
    fn test_window_closes_while_samples_are_in_flight() {
        let bus = LoopbackBus::new();
        let config = SubscriberConfig {
            reliable: true,
            ..config(8)
        };
        let transport = Arc::new(Recording::new(bus.participant()));
        let mut subscriber = ThroughputSubscriber::new(config.clone(), transport.clone());
        subscriber.init().unwrap();
        subscriber.transition(RunPhase::AwaitingCommand);

        let schema = PayloadSchema::Static(StaticSchema::new(64));
        let publisher = bus.participant();
        publisher
            .open_participant(&ParticipantOptions {
                name: "publisher".to_string(),
                domain_id: config.domain_id(),
                profile_path: None,
            })
            .unwrap();
        let handle = publisher.register_schema(&schema.descriptor()).unwrap();
        let channel = publisher
            .create_channel(&config.topic_names().data, handle)
            .unwrap();
        let writer = publisher
            .create_endpoint(
                &EndpointSpec {
                    channel,
                    direction: Direction::Writer,
                    reliability: Reliability::Reliable,
                    history: HistoryPolicy::KeepAll,
                },
                Arc::new(Quiet),
            )
            .unwrap();

        subscriber.handle_command(ThroughputCommand::ready_to_start(64, 100));
        assert_eq!(subscriber.phase(), RunPhase::RunningTest);
        let reader = subscriber.schemas.data_endpoint().unwrap();
        subscriber.handle_command(ThroughputCommand::new(CommandKind::TestStarts));

        // Keeps sending without flushing until 200 samples went out after the
        // window closed, then unmatches.
        let data = Arc::clone(&subscriber.data);
        let (streaming_tx, streaming_rx) = crossbeam::channel::bounded(1);
        let feeder = thread::spawn(move || {
            let field = schema.seqnum_field();
            let mut payload = schema.create_instance(64).unwrap();
            let mut sent = 0u32;
            let mut after_close = 0;
            while after_close < 200 {
                sent += 1;
                field.write(&mut payload, sent);
                publisher.send(writer, &payload).unwrap();
                if sent == 1000 {
                    streaming_tx.send(()).unwrap();
                }
                if !data.lock().collecting {
                    after_close += 1;
                }
            }
            publisher.destroy_endpoint(writer).unwrap();
            sent
        });

        streaming_rx.recv().unwrap();
        subscriber.handle_command(ThroughputCommand::new(CommandKind::TestEnds));
        let sent = feeder.join().unwrap();
        assert_eq!(subscriber.phase(), RunPhase::AwaitingCommand);

        let result = subscriber.results()[0].clone();
        let state = subscriber.data.lock();
        assert_eq!(
            state.detector.snapshot(),
            LossSnapshot {
                last_sequence_seen: result.last_received,
                cumulative_lost: result.lost_samples,
            }
        );
        assert_eq!(result.lost_samples, 0);
        assert_eq!(u64::from(result.last_received), state.received);
        assert_eq!(result.delivered_samples, state.received);
        assert!(state.discarded >= 200);
        assert_eq!(state.received + state.discarded, u64::from(sent));
        drop(state);

        let quiesced = transport
            .position(&format!("await_quiescence {}", reader))
            .unwrap();
        let destroyed = transport
            .position(&format!("destroy_endpoint {}", reader))
            .unwrap();
        assert!(quiesced < destroyed);
    }
}
