//! # Payload Schema Manager
//!
//! Owns the data-channel payload type and the per-iteration data endpoint.
//!
//! Two schema representations are supported and exactly one is active per
//! process:
//!
//! - **Static**: a compiled layout with a fixed payload size. It is registered
//!   when an iteration starts and unregistered at the end of that iteration,
//!   because a different payload size is a different type.
//! - **Dynamic**: a self-describing type built from named members with a
//!   bounded byte sequence. One registration spans the whole run; changing the
//!   payload size only changes the sequence length inside each instance.
//!
//! Both sit behind [`PayloadSchema`], so callers only pick the variant once at
//! construction time.
//!
//! ## Instance Layout
//!
//! ```text
//! static:  | seqnum u32 LE | data [payload_size]             |
//! dynamic: | seqnum u32 LE | len u32 LE | data [len <= max]  |
//! ```

use crate::error::{BenchError, Stage};
use crate::loss::SequenceSample;
use crate::transport::{
    ChannelHandle, Delivery, Direction, EndpointId, EndpointListener, EndpointSpec,
    HistoryPolicy, Liveness, Reliability, SchemaDescriptor, SchemaHandle, SchemaKind,
    Transport,
};
use std::sync::Arc;
use tracing::{debug, error, info};

const SEQNUM_WIDTH: usize = 4;
const SEQUENCE_LENGTH_WIDTH: usize = 4;

/// Accessor for the `seqnum` member of an encoded instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnumField {
    offset: usize,
}

impl SeqnumField {
    pub fn read(&self, payload: &[u8]) -> Option<u32> {
        let bytes = payload.get(self.offset..self.offset + SEQNUM_WIDTH)?;
        let mut raw = [0u8; SEQNUM_WIDTH];
        raw.copy_from_slice(bytes);
        Some(u32::from_le_bytes(raw))
    }

    /// Turn a delivery into the sample the loss detector consumes
    ///
    /// Not-alive deliveries carry no valid payload and report sequence 0, as
    /// do alive payloads too short to hold the member.
    pub fn sample_of(&self, delivery: &Delivery) -> SequenceSample {
        match delivery.liveness {
            Liveness::Alive => match self.read(&delivery.payload) {
                Some(seqnum) => SequenceSample::alive(seqnum),
                None => SequenceSample::not_alive(0),
            },
            Liveness::NotAlive => SequenceSample::not_alive(0),
        }
    }

    /// Returns false when `payload` is too short to hold the member
    pub fn write(&self, payload: &mut [u8], seqnum: u32) -> bool {
        match payload.get_mut(self.offset..self.offset + SEQNUM_WIDTH) {
            Some(slot) => {
                slot.copy_from_slice(&seqnum.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

/// Compiled fixed-size payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSchema {
    payload_size: u32,
}

impl StaticSchema {
    const SEQNUM: SeqnumField = SeqnumField { offset: 0 };

    pub fn new(payload_size: u32) -> Self {
        Self { payload_size }
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }
}

/// Member types understood by the dynamic builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    UInt32,
    /// Length-prefixed byte sequence with an upper bound
    Bytes { bound: u32 },
}

impl MemberKind {
    fn fixed_width(&self) -> Option<usize> {
        match self {
            MemberKind::UInt32 => Some(4),
            MemberKind::Bytes { .. } => None,
        }
    }

    fn max_width(&self) -> usize {
        match self {
            MemberKind::UInt32 => 4,
            MemberKind::Bytes { bound } => SEQUENCE_LENGTH_WIDTH + *bound as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    name: String,
    kind: MemberKind,
}

/// Builder for a runtime-described payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTypeBuilder {
    type_name: String,
    members: Vec<Member>,
}

impl DynamicTypeBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            members: Vec::new(),
        }
    }

    pub fn member(mut self, name: impl Into<String>, kind: MemberKind) -> Self {
        self.members.push(Member {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn build(self) -> DynamicSchema {
        DynamicSchema {
            type_name: self.type_name,
            members: self.members,
        }
    }
}

/// Runtime-introspectable payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSchema {
    type_name: String,
    members: Vec<Member>,
}

impl DynamicSchema {
    /// The benchmark payload: `seqnum: u32` followed by `data: bytes<max>`
    pub fn throughput(max_payload_size: u32) -> Self {
        DynamicTypeBuilder::new("ThroughputTypeDynamic")
            .member("seqnum", MemberKind::UInt32)
            .member(
                "data",
                MemberKind::Bytes {
                    bound: max_payload_size,
                },
            )
            .build()
    }

    /// Byte offset of a fixed-width member, if every member before it is fixed too
    pub fn member_offset(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for member in &self.members {
            if member.name == name {
                return Some(offset);
            }
            offset += member.kind.fixed_width()?;
        }
        None
    }

    pub fn max_payload_size(&self) -> u32 {
        self.members
            .iter()
            .find_map(|m| match m.kind {
                MemberKind::Bytes { bound } => Some(bound),
                MemberKind::UInt32 => None,
            })
            .unwrap_or(0)
    }

    fn max_serialized_size(&self) -> usize {
        self.members.iter().map(|m| m.kind.max_width()).sum()
    }
}

/// The active payload type representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSchema {
    Static(StaticSchema),
    Dynamic(DynamicSchema),
}

impl PayloadSchema {
    pub fn descriptor(&self) -> SchemaDescriptor {
        match self {
            PayloadSchema::Static(schema) => SchemaDescriptor {
                type_name: format!("ThroughputType_{}", schema.payload_size),
                kind: SchemaKind::Static,
                max_serialized_size: SEQNUM_WIDTH + schema.payload_size as usize,
            },
            PayloadSchema::Dynamic(schema) => SchemaDescriptor {
                type_name: schema.type_name.clone(),
                kind: SchemaKind::Dynamic,
                max_serialized_size: schema.max_serialized_size(),
            },
        }
    }

    /// Allocate a zeroed instance carrying `payload_size` data bytes
    pub fn create_instance(&self, payload_size: u32) -> Result<Vec<u8>, BenchError> {
        match self {
            PayloadSchema::Static(schema) => {
                if payload_size != schema.payload_size {
                    return Err(BenchError::PayloadSizeMismatch {
                        requested: payload_size,
                        supported: schema.payload_size,
                    });
                }
                Ok(vec![0u8; SEQNUM_WIDTH + payload_size as usize])
            }
            PayloadSchema::Dynamic(schema) => {
                let max = schema.max_payload_size();
                if payload_size > max {
                    return Err(BenchError::PayloadSizeMismatch {
                        requested: payload_size,
                        supported: max,
                    });
                }
                let mut instance =
                    vec![0u8; SEQNUM_WIDTH + SEQUENCE_LENGTH_WIDTH + payload_size as usize];
                instance[SEQNUM_WIDTH..SEQNUM_WIDTH + SEQUENCE_LENGTH_WIDTH]
                    .copy_from_slice(&payload_size.to_le_bytes());
                Ok(instance)
            }
        }
    }

    /// Resolve the `seqnum` member accessor
    pub fn seqnum_field(&self) -> SeqnumField {
        match self {
            PayloadSchema::Static(_) => StaticSchema::SEQNUM,
            PayloadSchema::Dynamic(schema) => SeqnumField {
                offset: schema.member_offset("seqnum").unwrap_or(0),
            },
        }
    }

    pub fn kind(&self) -> SchemaKind {
        match self {
            PayloadSchema::Static(_) => SchemaKind::Static,
            PayloadSchema::Dynamic(_) => SchemaKind::Dynamic,
        }
    }
}

struct RegisteredSchema {
    schema: PayloadSchema,
    handle: SchemaHandle,
}

#[derive(Debug, Clone, Copy)]
struct DataEndpoint {
    channel: ChannelHandle,
    endpoint: EndpointId,
}

/// QoS of the data endpoint for one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEndpointQos {
    pub direction: Direction,
    pub reliability: Reliability,
    pub history: HistoryPolicy,
}

/// Creates and destroys the data schema and endpoint through the transport
pub struct PayloadSchemaManager {
    transport: Arc<dyn Transport>,
    topic: String,
    registered: Option<RegisteredSchema>,
    data: Option<DataEndpoint>,
}

impl PayloadSchemaManager {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
            registered: None,
            data: None,
        }
    }

    pub fn create_static_schema(&mut self, payload_size: u32) -> Result<(), BenchError> {
        self.register(PayloadSchema::Static(StaticSchema::new(payload_size)))
    }

    pub fn create_dynamic_schema(&mut self, max_payload_size: u32) -> Result<(), BenchError> {
        self.register(PayloadSchema::Dynamic(DynamicSchema::throughput(
            max_payload_size,
        )))
    }

    fn register(&mut self, schema: PayloadSchema) -> Result<(), BenchError> {
        if self.registered.is_some() {
            return Err(BenchError::AlreadyInitialized);
        }
        let descriptor = schema.descriptor();
        let handle = self
            .transport
            .register_schema(&descriptor)
            .map_err(BenchError::create(Stage::SchemaRegistration))?;
        debug!("Registered {} as {}", descriptor.type_name, handle);
        self.registered = Some(RegisteredSchema { schema, handle });
        Ok(())
    }

    /// The active schema, if one is registered
    pub fn schema(&self) -> Option<&PayloadSchema> {
        self.registered.as_ref().map(|r| &r.schema)
    }

    /// The live data endpoint, if one exists
    pub fn data_endpoint(&self) -> Option<EndpointId> {
        self.data.map(|d| d.endpoint)
    }

    /// Create the data channel and its endpoint for the registered schema
    pub fn create_data_endpoints(
        &mut self,
        qos: DataEndpointQos,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<EndpointId, BenchError> {
        if self.data.is_some() {
            return Err(BenchError::AlreadyInitialized);
        }
        let schema = self
            .registered
            .as_ref()
            .ok_or(BenchError::NotInitialized)?
            .handle;

        let channel = self
            .transport
            .create_channel(&self.topic, schema)
            .map_err(BenchError::create(Stage::Channel))?;

        let spec = EndpointSpec {
            channel,
            direction: qos.direction,
            reliability: qos.reliability,
            history: qos.history,
        };
        let endpoint = match self.transport.create_endpoint(&spec, listener) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(cleanup) = self.transport.destroy_channel(channel) {
                    error!("Failed to remove channel {} after endpoint failure: {}", channel, cleanup);
                }
                return Err(BenchError::create(Stage::Endpoint)(e));
            }
        };

        info!(
            "Created {:?} data endpoint {} on {} ({})",
            qos.direction, endpoint, self.topic, qos.reliability
        );
        self.data = Some(DataEndpoint { channel, endpoint });
        Ok(endpoint)
    }

    /// Tear down endpoint, channel and (static) schema registration in that order
    ///
    /// Every step is attempted even if an earlier one fails; the first failure
    /// is returned. A dynamic schema stays registered for the next iteration.
    pub fn destroy_data_endpoints(&mut self) -> Result<(), BenchError> {
        let data = self.data.take().ok_or(BenchError::NotInitialized)?;
        let mut first_failure = None;

        if let Err(e) = self.transport.destroy_endpoint(data.endpoint) {
            error!("Failed to destroy data endpoint {}: {}", data.endpoint, e);
            first_failure.get_or_insert(BenchError::teardown(Stage::Endpoint)(e));
        }
        if let Err(e) = self.transport.destroy_channel(data.channel) {
            error!("Failed to destroy data channel {}: {}", data.channel, e);
            first_failure.get_or_insert(BenchError::teardown(Stage::Channel)(e));
        }
        if matches!(self.schema(), Some(PayloadSchema::Static(_))) {
            if let Err(e) = self.release_schema() {
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unregister the active schema, whatever its representation
    pub fn release_schema(&mut self) -> Result<(), BenchError> {
        let handle = self
            .registered
            .as_ref()
            .map(|registered| registered.handle)
            .ok_or(BenchError::NotInitialized)?;
        self.transport.unregister_schema(handle).map_err(|e| {
            error!("Failed to unregister schema {}: {}", handle, e);
            BenchError::teardown(Stage::SchemaRegistration)(e)
        })?;
        self.registered = None;
        Ok(())
    }

    /// Destroy whatever is still alive; used on process exit
    pub fn shutdown(&mut self) {
        if self.data.is_some() {
            let _ = self.destroy_data_endpoints();
        }
        if self.registered.is_some() {
            let _ = self.release_schema();
        }
    }
}
