//! # Loopback Transport
//!
//! An in-process pub-sub bus implementing [`Transport`]. Every participant
//! handle created from one [`LoopbackBus`] sees the same registry of schemas,
//! channels and endpoints.
//!
//! ## Matching
//!
//! A reader and a writer match when they live in the same domain, sit on
//! channels with the same name and type name, and have compatible
//! reliability (a reliable reader needs a reliable writer; a best-effort
//! reader accepts either).
//!
//! ## Callbacks
//!
//! Matching and data-available notifications are queued to a single
//! dispatcher thread, so listeners never run on the caller's thread and are
//! serialized per endpoint. Callbacks queued for an endpoint that has since
//! been destroyed are dropped. [`Transport::await_quiescence`] blocks until
//! nothing is queued or running for an endpoint; it must not be called from
//! inside a listener.

use super::{
    ChannelHandle, Delivery, Direction, EndpointId, EndpointListener, EndpointSpec,
    HistoryPolicy, MatchStatus, ParticipantOptions, Reliability, SchemaDescriptor, SchemaHandle,
    Transport, TransportError,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

type ParticipantId = u64;

struct ParticipantEntry {
    name: String,
    domain_id: Option<u32>,
}

struct SchemaEntry {
    participant: ParticipantId,
    descriptor: SchemaDescriptor,
}

struct ChannelEntry {
    participant: ParticipantId,
    name: String,
    schema: SchemaHandle,
}

struct EndpointEntry {
    participant: ParticipantId,
    domain_id: u32,
    channel: ChannelHandle,
    topic: String,
    type_name: String,
    direction: Direction,
    reliability: Reliability,
    history: HistoryPolicy,
    listener: Arc<dyn EndpointListener>,
    matched: BTreeSet<EndpointId>,
    queue: VecDeque<Delivery>,
}

impl EndpointEntry {
    fn matches(&self, other: &EndpointEntry) -> bool {
        if self.domain_id != other.domain_id
            || self.topic != other.topic
            || self.type_name != other.type_name
            || self.direction == other.direction
        {
            return false;
        }
        let (reader, writer) = match self.direction {
            Direction::Reader => (self, other),
            Direction::Writer => (other, self),
        };
        reader.reliability == Reliability::BestEffort
            || writer.reliability == Reliability::Reliable
    }
}

#[derive(Default)]
struct Registry {
    next_handle: u64,
    participants: HashMap<ParticipantId, ParticipantEntry>,
    schemas: HashMap<SchemaHandle, SchemaEntry>,
    channels: HashMap<ChannelHandle, ChannelEntry>,
    endpoints: HashMap<EndpointId, EndpointEntry>,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

enum Callback {
    Matched(MatchStatus),
    DataAvailable,
}

struct Job {
    endpoint: EndpointId,
    participant: ParticipantId,
    listener: Arc<dyn EndpointListener>,
    callback: Callback,
}

/// Outstanding callbacks per endpoint
#[derive(Default)]
struct DispatchState {
    pending: Mutex<HashMap<EndpointId, usize>>,
    idle: Condvar,
}

impl DispatchState {
    fn begin(&self, endpoint: EndpointId) {
        *self.pending.lock().entry(endpoint).or_insert(0) += 1;
    }

    fn complete(&self, endpoint: EndpointId) {
        let mut pending = self.pending.lock();
        if let Some(count) = pending.get_mut(&endpoint) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&endpoint);
            }
        }
        self.idle.notify_all();
    }

    fn wait_idle(&self, endpoint: Option<EndpointId>) {
        let mut pending = self.pending.lock();
        self.idle.wait_while(&mut pending, |pending| match endpoint {
            Some(id) => pending.contains_key(&id),
            None => !pending.is_empty(),
        });
    }
}

struct BusInner {
    registry: Mutex<Registry>,
    unread: Condvar,
    jobs: Sender<Job>,
    dispatch: Arc<DispatchState>,
}

impl BusInner {
    fn queue(&self, job: Job) {
        self.dispatch.begin(job.endpoint);
        let endpoint = job.endpoint;
        if self.jobs.send(job).is_err() {
            warn!("Loopback dispatcher is gone; dropping callback for {}", endpoint);
            self.dispatch.complete(endpoint);
        }
    }

    fn queue_match(&self, endpoint: EndpointId, entry: &EndpointEntry, change: i32) {
        self.queue(Job {
            endpoint,
            participant: entry.participant,
            listener: Arc::clone(&entry.listener),
            callback: Callback::Matched(MatchStatus {
                current_count: entry.matched.len(),
                current_count_change: change,
            }),
        });
    }
}

fn dispatch_loop(bus: Weak<BusInner>, jobs: Receiver<Job>, state: Arc<DispatchState>) {
    while let Ok(job) = jobs.recv() {
        if let Some(inner) = bus.upgrade() {
            let live = inner.registry.lock().endpoints.contains_key(&job.endpoint);
            if live {
                match job.callback {
                    Callback::Matched(status) => {
                        job.listener.on_match_changed(job.endpoint, status)
                    }
                    Callback::DataAvailable => {
                        let transport = LoopbackTransport {
                            bus: Arc::clone(&inner),
                            participant: job.participant,
                        };
                        job.listener.on_data_available(job.endpoint, &transport);
                    }
                }
            } else {
                trace!("Dropping callback for destroyed {}", job.endpoint);
            }
        }
        state.complete(job.endpoint);
    }
    debug!("Loopback dispatcher exiting");
}

/// Shared in-process bus; hands out participant handles
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    /// Create a bus and start its dispatcher thread
    pub fn new() -> Self {
        let (jobs, receiver) = channel::unbounded();
        let dispatch = Arc::new(DispatchState::default());
        let inner = Arc::new(BusInner {
            registry: Mutex::new(Registry::default()),
            unread: Condvar::new(),
            jobs,
            dispatch: Arc::clone(&dispatch),
        });
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || dispatch_loop(weak, receiver, dispatch));
        Self { inner }
    }

    /// A new, not yet opened participant on this bus
    pub fn participant(&self) -> LoopbackTransport {
        let mut registry = self.inner.registry.lock();
        let id = registry.allocate();
        registry.participants.insert(
            id,
            ParticipantEntry {
                name: format!("participant-{}", id),
                domain_id: None,
            },
        );
        LoopbackTransport {
            bus: Arc::clone(&self.inner),
            participant: id,
        }
    }

    /// Block until every queued callback on the bus has run
    pub fn flush(&self) {
        self.inner.dispatch.wait_idle(None);
    }
}

/// One participant's view of a [`LoopbackBus`]
#[derive(Clone)]
pub struct LoopbackTransport {
    bus: Arc<BusInner>,
    participant: ParticipantId,
}

impl LoopbackTransport {
    fn domain(&self, registry: &Registry) -> Result<u32, TransportError> {
        registry
            .participants
            .get(&self.participant)
            .and_then(|p| p.domain_id)
            .ok_or(TransportError::NotOpen)
    }

    /// Publish a disposal notice; readers see it as a not-alive delivery
    pub fn send_not_alive(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), TransportError> {
        self.publish(endpoint, Delivery::not_alive(payload.to_vec()))
    }

    /// Block until every queued callback on the bus has run
    pub fn flush(&self) {
        self.bus.dispatch.wait_idle(None);
    }

    /// Number of remote endpoints matched to `endpoint`
    pub fn matched_count(&self, endpoint: EndpointId) -> Option<usize> {
        self.bus
            .registry
            .lock()
            .endpoints
            .get(&endpoint)
            .map(|e| e.matched.len())
    }

    fn publish(&self, endpoint: EndpointId, delivery: Delivery) -> Result<(), TransportError> {
        let mut registry = self.bus.registry.lock();
        let writer = registry
            .endpoints
            .get(&endpoint)
            .filter(|e| e.participant == self.participant)
            .ok_or(TransportError::UnknownEndpoint(endpoint))?;
        if writer.direction != Direction::Writer {
            return Err(TransportError::WrongDirection {
                endpoint,
                expected: Direction::Writer,
            });
        }

        let readers: Vec<EndpointId> = writer.matched.iter().copied().collect();
        for reader_id in readers {
            if let Some(reader) = registry.endpoints.get_mut(&reader_id) {
                reader.queue.push_back(delivery.clone());
                if let HistoryPolicy::KeepLast(depth) = reader.history {
                    while reader.queue.len() > depth.max(1) {
                        reader.queue.pop_front();
                        trace!("{} history full, evicted oldest sample", reader_id);
                    }
                }
                let job = Job {
                    endpoint: reader_id,
                    participant: reader.participant,
                    listener: Arc::clone(&reader.listener),
                    callback: Callback::DataAvailable,
                };
                self.bus.queue(job);
            }
        }
        drop(registry);
        self.bus.unread.notify_all();
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn open_participant(&self, options: &ParticipantOptions) -> Result<(), TransportError> {
        if let Some(path) = &options.profile_path {
            if !path.exists() {
                return Err(TransportError::ProfileNotFound(path.clone()));
            }
        }
        let mut registry = self.bus.registry.lock();
        let entry = registry
            .participants
            .get_mut(&self.participant)
            .ok_or(TransportError::Closed)?;
        if entry.domain_id.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        entry.name = options.name.clone();
        entry.domain_id = Some(options.domain_id);
        debug!(
            "Participant {} joined domain {}",
            options.name, options.domain_id
        );
        Ok(())
    }

    fn register_schema(
        &self,
        descriptor: &SchemaDescriptor,
    ) -> Result<SchemaHandle, TransportError> {
        let mut registry = self.bus.registry.lock();
        self.domain(&registry)?;
        let handle = SchemaHandle(registry.allocate());
        registry.schemas.insert(
            handle,
            SchemaEntry {
                participant: self.participant,
                descriptor: descriptor.clone(),
            },
        );
        Ok(handle)
    }

    fn unregister_schema(&self, schema: SchemaHandle) -> Result<(), TransportError> {
        let mut registry = self.bus.registry.lock();
        match registry.schemas.get(&schema) {
            Some(entry) if entry.participant == self.participant => {}
            _ => return Err(TransportError::UnknownSchema(schema)),
        }
        if registry.channels.values().any(|c| c.schema == schema) {
            return Err(TransportError::InUse(schema.to_string()));
        }
        registry.schemas.remove(&schema);
        Ok(())
    }

    fn create_channel(
        &self,
        name: &str,
        schema: SchemaHandle,
    ) -> Result<ChannelHandle, TransportError> {
        let mut registry = self.bus.registry.lock();
        self.domain(&registry)?;
        match registry.schemas.get(&schema) {
            Some(entry) if entry.participant == self.participant => {}
            _ => return Err(TransportError::UnknownSchema(schema)),
        }
        let duplicate = registry
            .channels
            .values()
            .any(|c| c.participant == self.participant && c.name == name);
        if duplicate {
            return Err(TransportError::InUse(name.to_string()));
        }
        let handle = ChannelHandle(registry.allocate());
        registry.channels.insert(
            handle,
            ChannelEntry {
                participant: self.participant,
                name: name.to_string(),
                schema,
            },
        );
        Ok(handle)
    }

    fn destroy_channel(&self, channel: ChannelHandle) -> Result<(), TransportError> {
        let mut registry = self.bus.registry.lock();
        match registry.channels.get(&channel) {
            Some(entry) if entry.participant == self.participant => {}
            _ => return Err(TransportError::UnknownChannel(channel)),
        }
        if registry.endpoints.values().any(|e| e.channel == channel) {
            return Err(TransportError::InUse(channel.to_string()));
        }
        registry.channels.remove(&channel);
        Ok(())
    }

    fn create_endpoint(
        &self,
        spec: &EndpointSpec,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<EndpointId, TransportError> {
        let mut registry = self.bus.registry.lock();
        let domain_id = self.domain(&registry)?;
        let (topic, schema) = match registry.channels.get(&spec.channel) {
            Some(c) if c.participant == self.participant => (c.name.clone(), c.schema),
            _ => return Err(TransportError::UnknownChannel(spec.channel)),
        };
        let type_name = registry
            .schemas
            .get(&schema)
            .map(|s| s.descriptor.type_name.clone())
            .ok_or(TransportError::UnknownSchema(schema))?;

        let id = EndpointId(registry.allocate());
        let mut entry = EndpointEntry {
            participant: self.participant,
            domain_id,
            channel: spec.channel,
            topic,
            type_name,
            direction: spec.direction,
            reliability: spec.reliability,
            history: spec.history,
            listener,
            matched: BTreeSet::new(),
            queue: VecDeque::new(),
        };

        let peers: Vec<EndpointId> = registry
            .endpoints
            .iter()
            .filter(|(_, other)| entry.matches(other))
            .map(|(peer, _)| *peer)
            .collect();

        for peer_id in &peers {
            if let Some(peer) = registry.endpoints.get_mut(peer_id) {
                peer.matched.insert(id);
                self.bus.queue_match(*peer_id, peer, 1);
            }
            entry.matched.insert(*peer_id);
            let status = MatchStatus {
                current_count: entry.matched.len(),
                current_count_change: 1,
            };
            self.bus.queue(Job {
                endpoint: id,
                participant: self.participant,
                listener: Arc::clone(&entry.listener),
                callback: Callback::Matched(status),
            });
        }

        let owner = registry
            .participants
            .get(&self.participant)
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        debug!(
            "{} created {:?} {} on {} ({} peers)",
            owner,
            entry.direction,
            id,
            entry.topic,
            peers.len()
        );
        registry.endpoints.insert(id, entry);
        Ok(id)
    }

    fn destroy_endpoint(&self, endpoint: EndpointId) -> Result<(), TransportError> {
        let mut registry = self.bus.registry.lock();
        let owned = registry
            .endpoints
            .get(&endpoint)
            .map_or(false, |e| e.participant == self.participant);
        if !owned {
            return Err(TransportError::UnknownEndpoint(endpoint));
        }
        let entry = registry
            .endpoints
            .remove(&endpoint)
            .ok_or(TransportError::UnknownEndpoint(endpoint))?;

        for peer_id in &entry.matched {
            if let Some(peer) = registry.endpoints.get_mut(peer_id) {
                peer.matched.remove(&endpoint);
                self.bus.queue_match(*peer_id, peer, -1);
            }
        }
        debug!("Destroyed {} on {}", endpoint, entry.topic);
        drop(registry);
        self.bus.unread.notify_all();
        Ok(())
    }

    fn try_take_next(&self, endpoint: EndpointId) -> Option<Delivery> {
        let mut registry = self.bus.registry.lock();
        registry
            .endpoints
            .get_mut(&endpoint)
            .filter(|e| e.direction == Direction::Reader)
            .and_then(|e| e.queue.pop_front())
    }

    fn send(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), TransportError> {
        self.publish(endpoint, Delivery::alive(payload.to_vec()))
    }

    fn wait_for_unread(&self, endpoint: EndpointId, timeout: Duration) -> bool {
        let empty = |registry: &Registry| {
            registry
                .endpoints
                .get(&endpoint)
                .map_or(true, |e| e.queue.is_empty())
        };
        let mut registry = self.bus.registry.lock();
        if empty(&*registry) {
            self.bus.unread.wait_while_for(
                &mut registry,
                |registry| {
                    registry
                        .endpoints
                        .get(&endpoint)
                        .map_or(false, |e| e.queue.is_empty())
                },
                timeout,
            );
        }
        !empty(&*registry)
    }

    fn await_quiescence(&self, endpoint: EndpointId) -> Result<(), TransportError> {
        self.bus.dispatch.wait_idle(Some(endpoint));
        Ok(())
    }
}
