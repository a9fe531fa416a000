use crate::error::BenchError;
use crate::transport::{SchemaDescriptor, SchemaKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type name of the control-channel schema
pub const COMMAND_TYPE_NAME: &str = "ThroughputCommand";

/// Encoded size of one command: tag plus five numeric fields
pub const COMMAND_WIRE_SIZE: usize = 32;

/// Command tags exchanged over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Placeholder value; carries nothing
    None,
    /// Subscriber acknowledgement of READY_TO_START
    Begin,
    /// Publisher announces the next iteration's payload size and demand
    ReadyToStart,
    TestStarts,
    TestEnds,
    /// Publisher is done; honored only between iterations
    AllStops,
    /// Subscriber report for the iteration that just ended
    TestResults,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::None => "NONE",
            CommandKind::Begin => "BEGIN",
            CommandKind::ReadyToStart => "READY_TO_START",
            CommandKind::TestStarts => "TEST_STARTS",
            CommandKind::TestEnds => "TEST_ENDS",
            CommandKind::AllStops => "ALL_STOPS",
            CommandKind::TestResults => "TEST_RESULTS",
        };
        f.write_str(name)
    }
}

/// One control-channel message
///
/// Exactly one command travels per transport message; it is never mutated
/// after being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputCommand {
    pub kind: CommandKind,
    /// Payload size in bytes of the iteration
    pub size: u32,
    /// Target number of in-flight messages
    pub demand: u32,
    pub last_received: u32,
    pub lost_samples: u64,
    pub total_time_us: u64,
}

impl ThroughputCommand {
    /// Create a command with all numeric fields zeroed
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            size: 0,
            demand: 0,
            last_received: 0,
            lost_samples: 0,
            total_time_us: 0,
        }
    }

    pub fn ready_to_start(size: u32, demand: u32) -> Self {
        Self {
            size,
            demand,
            ..Self::new(CommandKind::ReadyToStart)
        }
    }

    pub fn begin(size: u32, demand: u32) -> Self {
        Self {
            size,
            demand,
            ..Self::new(CommandKind::Begin)
        }
    }

    pub fn test_results(
        size: u32,
        demand: u32,
        last_received: u32,
        lost_samples: u64,
        total_time_us: u64,
    ) -> Self {
        Self {
            kind: CommandKind::TestResults,
            size,
            demand,
            last_received,
            lost_samples,
            total_time_us,
        }
    }

    /// Schema registered for both control channels
    pub fn schema_descriptor() -> SchemaDescriptor {
        SchemaDescriptor {
            type_name: COMMAND_TYPE_NAME.to_string(),
            kind: SchemaKind::Static,
            max_serialized_size: COMMAND_WIRE_SIZE,
        }
    }

    /// Serialize the command to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, BenchError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize bytes to a command
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BenchError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for ThroughputCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CommandKind::ReadyToStart | CommandKind::Begin => {
                write!(f, "{} size={} demand={}", self.kind, self.size, self.demand)
            }
            CommandKind::TestResults => write!(
                f,
                "{} size={} demand={} last={} lost={} time={}us",
                self.kind,
                self.size,
                self.demand,
                self.last_received,
                self.lost_samples,
                self.total_time_us
            ),
            _ => write!(f, "{}", self.kind),
        }
    }
}
