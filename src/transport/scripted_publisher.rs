//! # Scripted Publisher
//!
//! A publisher peer that speaks the command protocol over a
//! [`LoopbackTransport`]. Each [`IterationPlan`] describes one payload size:
//! how many samples to send, which sequence numbers never leave the
//! publisher, and which are published as not-alive notices.
//!
//! The publisher waits for a data writer barrier, flushes the bus after
//! every `demand` samples and again before TEST_ENDS, so a run against the
//! subscriber is deterministic: every sent sample has been consumed before
//! the collection window closes.

use super::loopback::LoopbackTransport;
use super::{
    ChannelHandle, Direction, EndpointId, EndpointSpec, HistoryPolicy, ParticipantOptions,
    Reliability, SchemaHandle, Transport,
};
use crate::command::{CommandKind, ThroughputCommand};
use crate::matching::{EndpointRole, MatchListener, MatchTracker};
use crate::schema::{DataEndpointQos, PayloadSchemaManager};
use crate::subscriber::SubscriberConfig;
use anyhow::{anyhow, bail, Context, Result};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default bound on every wait for a subscriber reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One payload-size iteration as the publisher will play it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationPlan {
    pub payload_size: u32,
    pub demand: u32,
    /// Sequence numbers `1..=samples` are candidates for sending
    pub samples: u32,
    /// Never delivered
    pub dropped: Vec<RangeInclusive<u32>>,
    /// Delivered as not-alive notices
    pub not_alive: Vec<RangeInclusive<u32>>,
}

impl IterationPlan {
    pub fn new(payload_size: u32, demand: u32, samples: u32) -> Self {
        Self {
            payload_size,
            demand,
            samples,
            dropped: Vec::new(),
            not_alive: Vec::new(),
        }
    }

    pub fn with_dropped(mut self, range: RangeInclusive<u32>) -> Self {
        self.dropped.push(range);
        self
    }

    pub fn with_not_alive(mut self, range: RangeInclusive<u32>) -> Self {
        self.not_alive.push(range);
        self
    }

    fn is_dropped(&self, seqnum: u32) -> bool {
        self.dropped.iter().any(|r| r.contains(&seqnum))
    }

    fn is_not_alive(&self, seqnum: u32) -> bool {
        self.not_alive.iter().any(|r| r.contains(&seqnum))
    }
}

struct CommandChannels {
    schema: SchemaHandle,
    pub2sub: ChannelHandle,
    sub2pub: ChannelHandle,
    writer: EndpointId,
    reader: EndpointId,
}

/// Publisher side of the benchmark for in-process runs
pub struct ScriptedPublisher {
    transport: LoopbackTransport,
    config: SubscriberConfig,
    plans: Vec<IterationPlan>,
    reply_timeout: Duration,
}

impl ScriptedPublisher {
    /// `config` must be the subscriber's, so that domain and topics line up
    pub fn new(
        transport: LoopbackTransport,
        config: SubscriberConfig,
        plans: Vec<IterationPlan>,
    ) -> Self {
        Self {
            transport,
            config,
            plans,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Run the script on its own thread
    pub fn spawn(self) -> JoinHandle<Result<Vec<ThroughputCommand>>> {
        thread::spawn(move || self.run())
    }

    /// Play every plan, then send ALL_STOPS
    ///
    /// Returns the TEST_RESULTS commands received, one per plan.
    pub fn run(self) -> Result<Vec<ThroughputCommand>> {
        let topics = self.config.topic_names();
        self.transport
            .open_participant(&ParticipantOptions {
                name: format!("throughput-publisher-{}", self.config.pid),
                domain_id: self.config.domain_id(),
                profile_path: None,
            })
            .context("Failed to open publisher participant")?;

        let command_matches = Arc::new(MatchTracker::new("publisher command"));
        let channels = self.create_command_channels(&command_matches, &topics.pub2sub, &topics.sub2pub)?;

        if !command_matches.wait_until(|c| c.command_total() >= 2, Some(self.reply_timeout)) {
            bail!(
                "Subscriber control endpoints not discovered within {:?}",
                self.reply_timeout
            );
        }
        debug!("Publisher discovered the subscriber");

        let shared: Arc<dyn Transport> = Arc::new(self.transport.clone());
        let mut schemas = PayloadSchemaManager::new(shared, topics.data.clone());
        if self.config.dynamic_types {
            schemas
                .create_dynamic_schema(self.config.max_payload_size)
                .context("Failed to register dynamic payload type")?;
        }

        let mut reports = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            let report = self
                .run_iteration(plan, &mut schemas, &channels)
                .with_context(|| format!("Iteration with {} byte payload failed", plan.payload_size))?;
            reports.push(report);
        }

        self.send_command(channels.writer, ThroughputCommand::new(CommandKind::AllStops))?;
        self.transport.flush();
        schemas.shutdown();
        self.destroy_command_channels(channels);
        Ok(reports)
    }

    fn create_command_channels(
        &self,
        tracker: &Arc<MatchTracker>,
        pub2sub_topic: &str,
        sub2pub_topic: &str,
    ) -> Result<CommandChannels> {
        let schema = self
            .transport
            .register_schema(&ThroughputCommand::schema_descriptor())?;
        let pub2sub = self.transport.create_channel(pub2sub_topic, schema)?;
        let sub2pub = self.transport.create_channel(sub2pub_topic, schema)?;
        let writer = self.transport.create_endpoint(
            &EndpointSpec {
                channel: pub2sub,
                direction: Direction::Writer,
                reliability: Reliability::Reliable,
                history: HistoryPolicy::KeepAll,
            },
            Arc::new(MatchListener::new(EndpointRole::CommandSend, Arc::clone(tracker))),
        )?;
        let reader = self.transport.create_endpoint(
            &EndpointSpec {
                channel: sub2pub,
                direction: Direction::Reader,
                reliability: Reliability::Reliable,
                history: HistoryPolicy::KeepAll,
            },
            Arc::new(MatchListener::new(EndpointRole::CommandReceive, Arc::clone(tracker))),
        )?;
        Ok(CommandChannels {
            schema,
            pub2sub,
            sub2pub,
            writer,
            reader,
        })
    }

    fn destroy_command_channels(&self, channels: CommandChannels) {
        for endpoint in [channels.writer, channels.reader] {
            if let Err(e) = self.transport.destroy_endpoint(endpoint) {
                warn!("Publisher failed to destroy {}: {}", endpoint, e);
            }
        }
        for channel in [channels.pub2sub, channels.sub2pub] {
            if let Err(e) = self.transport.destroy_channel(channel) {
                warn!("Publisher failed to destroy {}: {}", channel, e);
            }
        }
        if let Err(e) = self.transport.unregister_schema(channels.schema) {
            warn!("Publisher failed to unregister command type: {}", e);
        }
    }

    fn run_iteration(
        &self,
        plan: &IterationPlan,
        schemas: &mut PayloadSchemaManager,
        channels: &CommandChannels,
    ) -> Result<ThroughputCommand> {
        if !self.config.dynamic_types {
            schemas.create_static_schema(plan.payload_size)?;
        }
        let schema = schemas
            .schema()
            .cloned()
            .ok_or_else(|| anyhow!("No payload type registered"))?;

        let data_matches = Arc::new(MatchTracker::new("publisher data"));
        let writer = schemas.create_data_endpoints(
            DataEndpointQos {
                direction: Direction::Writer,
                reliability: self.config.reliability(),
                history: HistoryPolicy::KeepAll,
            },
            Arc::new(MatchListener::new(EndpointRole::Data, Arc::clone(&data_matches))),
        )?;

        self.send_command(
            channels.writer,
            ThroughputCommand::ready_to_start(plan.payload_size, plan.demand),
        )?;
        self.expect(channels.reader, CommandKind::Begin)?;
        if !data_matches.wait_until(|c| c.get(EndpointRole::Data) >= 1, Some(self.reply_timeout)) {
            bail!("Data reader not matched within {:?}", self.reply_timeout);
        }

        self.send_command(channels.writer, ThroughputCommand::new(CommandKind::TestStarts))?;

        let field = schema.seqnum_field();
        let mut instance = schema.create_instance(plan.payload_size)?;
        let batch = plan.demand.max(1);
        let mut sent = 0u64;
        for seqnum in 1..=plan.samples {
            if plan.is_dropped(seqnum) {
                continue;
            }
            field.write(&mut instance, seqnum);
            if plan.is_not_alive(seqnum) {
                self.transport.send_not_alive(writer, &instance)?;
            } else {
                self.transport.send(writer, &instance)?;
            }
            sent += 1;
            if seqnum % batch == 0 {
                self.transport.flush();
            }
        }
        self.transport.flush();

        self.send_command(channels.writer, ThroughputCommand::new(CommandKind::TestEnds))?;
        schemas.destroy_data_endpoints()?;

        let report = self.expect(channels.reader, CommandKind::TestResults)?;
        info!(
            "Publisher sent {} sample(s) of {} bytes; subscriber reported last={} lost={}",
            sent, plan.payload_size, report.last_received, report.lost_samples
        );
        Ok(report)
    }

    fn send_command(&self, writer: EndpointId, command: ThroughputCommand) -> Result<()> {
        self.transport
            .send(writer, &command.to_bytes()?)
            .with_context(|| format!("Failed to send {}", command.kind))?;
        debug!("Publisher sent {}", command);
        Ok(())
    }

    /// Wait for a command of the given kind, skipping any other
    fn expect(&self, reader: EndpointId, kind: CommandKind) -> Result<ThroughputCommand> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            while let Some(delivery) = self.transport.try_take_next(reader) {
                if !delivery.is_alive() {
                    continue;
                }
                let command = ThroughputCommand::from_bytes(&delivery.payload)?;
                if command.kind == kind {
                    return Ok(command);
                }
                debug!("Publisher skipping {} while waiting for {}", command, kind);
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("Timed out waiting for {} from the subscriber", kind);
            }
            self.transport.wait_for_unread(reader, deadline - now);
        }
    }
}
