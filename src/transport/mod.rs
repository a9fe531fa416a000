//! # Transport Collaborator Interface
//!
//! The subscriber core never talks to a concrete pub-sub stack. It consumes
//! one through the [`Transport`] trait (entity lifecycle, blocking send and
//! take) and receives asynchronous notifications through [`EndpointListener`]
//! callbacks fired from transport-owned threads.
//!
//! ## Callback Threads
//!
//! Listener methods may run concurrently with the controller thread and with
//! each other when they belong to different endpoints. Implementations must
//! serialize callbacks per endpoint. A listener must never call back into the
//! controller; it only updates shared state and signals condition variables.
//!
//! The [`loopback`] module provides an in-process implementation used by the
//! integration tests and the self-test binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod loopback;
pub mod scripted_publisher;

pub use loopback::{LoopbackBus, LoopbackTransport};
pub use scripted_publisher::{IterationPlan, ScriptedPublisher};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Identifier of a reader or writer endpoint
    EndpointId,
    "endpoint"
);
handle_type!(
    /// Handle of a registered data schema
    SchemaHandle,
    "schema"
);
handle_type!(
    /// Handle of a logical channel (topic)
    ChannelHandle,
    "channel"
);

/// Data flow direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Reader,
    Writer,
}

/// Delivery guarantee requested for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

impl Reliability {
    pub fn from_flag(reliable: bool) -> Self {
        if reliable {
            Reliability::Reliable
        } else {
            Reliability::BestEffort
        }
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reliability::Reliable => write!(f, "reliable"),
            Reliability::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// How many undelivered samples an endpoint keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    KeepAll,
    /// Oldest samples are evicted beyond this depth
    KeepLast(usize),
}

/// Whether a delivered sample carries valid data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Alive,
    /// Disposal or unregistration notice; payload is not meaningful
    NotAlive,
}

/// One message taken from a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub liveness: Liveness,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn alive(payload: Vec<u8>) -> Self {
        Self {
            liveness: Liveness::Alive,
            payload,
        }
    }

    pub fn not_alive(payload: Vec<u8>) -> Self {
        Self {
            liveness: Liveness::NotAlive,
            payload,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }
}

/// Matching notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStatus {
    /// Number of remote endpoints currently matched
    pub current_count: usize,
    /// +1 on a new match, -1 on an unmatch
    pub current_count_change: i32,
}

/// Representation of a registered schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaKind {
    Static,
    Dynamic,
}

/// What the transport needs to know about a payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub type_name: String,
    pub kind: SchemaKind,
    pub max_serialized_size: usize,
}

/// Parameters for opening the participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantOptions {
    pub name: String,
    pub domain_id: u32,
    pub profile_path: Option<PathBuf>,
}

/// Parameters for creating a reader or writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSpec {
    pub channel: ChannelHandle,
    pub direction: Direction,
    pub reliability: Reliability,
    pub history: HistoryPolicy,
}

/// Failures reported by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("participant is not open")]
    NotOpen,
    #[error("participant is already open")]
    AlreadyOpen,
    #[error("profile {0:?} not found")]
    ProfileNotFound(PathBuf),
    #[error("unknown {0}")]
    UnknownSchema(SchemaHandle),
    #[error("unknown {0}")]
    UnknownChannel(ChannelHandle),
    #[error("unknown {0}")]
    UnknownEndpoint(EndpointId),
    #[error("{0} is still in use")]
    InUse(String),
    #[error("{endpoint} is not a {expected:?}")]
    WrongDirection {
        endpoint: EndpointId,
        expected: Direction,
    },
    #[error("transport closed")]
    Closed,
}

/// Notifications fired by the transport on its own threads
pub trait EndpointListener: Send + Sync {
    /// Remote matched-peer count of `endpoint` changed
    fn on_match_changed(&self, endpoint: EndpointId, status: MatchStatus);

    /// New data is available on reader `endpoint`
    ///
    /// Implementations drain it with [`Transport::try_take_next`].
    fn on_data_available(&self, _endpoint: EndpointId, _transport: &dyn Transport) {}
}

/// Pub-sub stack consumed by the subscriber core
///
/// Every call is attempted once; there is no retry policy.
pub trait Transport: Send + Sync {
    /// Join the domain described by `options`
    fn open_participant(&self, options: &ParticipantOptions) -> Result<(), TransportError>;

    fn register_schema(&self, descriptor: &SchemaDescriptor)
        -> Result<SchemaHandle, TransportError>;

    fn unregister_schema(&self, schema: SchemaHandle) -> Result<(), TransportError>;

    fn create_channel(&self, name: &str, schema: SchemaHandle)
        -> Result<ChannelHandle, TransportError>;

    fn destroy_channel(&self, channel: ChannelHandle) -> Result<(), TransportError>;

    fn create_endpoint(
        &self,
        spec: &EndpointSpec,
        listener: Arc<dyn EndpointListener>,
    ) -> Result<EndpointId, TransportError>;

    fn destroy_endpoint(&self, endpoint: EndpointId) -> Result<(), TransportError>;

    /// Take the oldest unread message of a reader, if any
    fn try_take_next(&self, endpoint: EndpointId) -> Option<Delivery>;

    /// Publish `payload` on a writer; returns once the message is handed off
    fn send(&self, endpoint: EndpointId, payload: &[u8]) -> Result<(), TransportError>;

    /// Block up to `timeout` for an unread message on a reader
    ///
    /// Returns true when a message is waiting.
    fn wait_for_unread(&self, endpoint: EndpointId, timeout: Duration) -> bool;

    /// Block until no callback for `endpoint` is queued or running
    fn await_quiescence(&self, endpoint: EndpointId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(EndpointId(7).to_string(), "endpoint#7");
        assert_eq!(SchemaHandle(1).to_string(), "schema#1");
        assert_eq!(ChannelHandle(3).to_string(), "channel#3");
    }

    #[test]
    fn test_reliability_from_flag() {
        assert_eq!(Reliability::from_flag(true), Reliability::Reliable);
        assert_eq!(Reliability::from_flag(false), Reliability::BestEffort);
        assert_eq!(Reliability::BestEffort.to_string(), "best-effort");
    }

    #[test]
    fn test_delivery_liveness() {
        assert!(Delivery::alive(vec![1]).is_alive());
        assert!(!Delivery::not_alive(Vec::new()).is_alive());
    }

    #[test]
    fn test_transport_error_messages() {
        let err = TransportError::WrongDirection {
            endpoint: EndpointId(2),
            expected: Direction::Writer,
        };
        assert_eq!(err.to_string(), "endpoint#2 is not a Writer");
        assert_eq!(
            TransportError::UnknownChannel(ChannelHandle(9)).to_string(),
            "unknown channel#9"
        );
    }
}
