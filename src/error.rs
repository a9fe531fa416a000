//! # Error Taxonomy
//!
//! Typed errors surfaced by the subscriber core. Initialization failures are
//! fatal and returned to the caller of [`crate::subscriber::ThroughputSubscriber::init`];
//! failures inside an iteration are logged and the command loop carries on.
//!
//! Transport failures keep their [`TransportError`] source together with the
//! [`Stage`] at which they happened, so a log line reads like
//! `transport create failed at channel stage: channel "X" already exists`.

use crate::transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Entity lifecycle step at which a transport call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Opening the participant (domain join, profile load)
    Participant,
    /// Registering or unregistering a data schema
    SchemaRegistration,
    /// Creating or destroying a logical channel (topic)
    Channel,
    /// Creating or destroying an endpoint (reader/writer)
    Endpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Participant => write!(f, "participant"),
            Stage::SchemaRegistration => write!(f, "schema registration"),
            Stage::Channel => write!(f, "channel"),
            Stage::Endpoint => write!(f, "endpoint"),
        }
    }
}

/// Errors produced by the subscriber core
#[derive(Debug, Error)]
pub enum BenchError {
    /// The entity (schema, endpoint set, participant) already exists
    #[error("already initialized")]
    AlreadyInitialized,

    /// An operation needed an entity that was never created
    #[error("not initialized")]
    NotInitialized,

    #[error("transport create failed at {stage} stage: {source}")]
    TransportCreateFailed {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("transport teardown failed at {stage} stage: {source}")]
    TransportTeardownFailed {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    /// A control-channel command could not be handed to the transport
    #[error("command send failed: {0}")]
    Send(#[source] TransportError),

    /// A time value did not fit the unsigned 64-bit microsecond range.
    ///
    /// Not a failure: callers use `clamped` and log the event.
    #[error("elapsed time {raw_micros}us saturated to {clamped}us")]
    ArithmeticSaturation { raw_micros: f64, clamped: u64 },

    /// The active schema cannot carry a payload of this size
    #[error("payload size {requested} not supported by schema (limit {supported})")]
    PayloadSizeMismatch { requested: u32, supported: u32 },

    /// A control-channel message could not be encoded or decoded
    #[error("command codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl BenchError {
    pub(crate) fn create(stage: Stage) -> impl FnOnce(TransportError) -> BenchError {
        move |source| BenchError::TransportCreateFailed { stage, source }
    }

    pub(crate) fn teardown(stage: Stage) -> impl FnOnce(TransportError) -> BenchError {
        move |source| BenchError::TransportTeardownFailed { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Participant.to_string(), "participant");
        assert_eq!(Stage::SchemaRegistration.to_string(), "schema registration");
        assert_eq!(Stage::Channel.to_string(), "channel");
        assert_eq!(Stage::Endpoint.to_string(), "endpoint");
    }

    #[test]
    fn test_create_failure_message_carries_stage() {
        let err = BenchError::create(Stage::Channel)(TransportError::NotOpen);
        let text = err.to_string();
        assert!(text.contains("channel stage"), "{}", text);
        assert!(matches!(
            err,
            BenchError::TransportCreateFailed {
                stage: Stage::Channel,
                ..
            }
        ));
    }

    #[test]
    fn test_saturation_message() {
        let err = BenchError::ArithmeticSaturation {
            raw_micros: -3.5,
            clamped: 0,
        };
        assert_eq!(err.to_string(), "elapsed time -3.5us saturated to 0us");
    }
}
