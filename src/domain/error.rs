//! Link error taxonomy
//!
//! Connection-phase errors are absorbed by `connect()` and leave the session
//! idle; per-read errors go back to the caller of that read only.

use crate::domain::models::{FrameProfile, Slot};
use crate::infrastructure::radio::RadioError;
use crate::infrastructure::sensor::SensorError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = LinkError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IMU sensor not found: {reason}")]
    DeviceNotFound { reason: String },

    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed {
        peer: String,
        reason: String,
        #[source]
        source: Option<RadioError>,
    },

    #[error("Service discovery did not complete within {waited:?}")]
    ServiceDiscoveryTimeout { waited: Duration },

    #[error("Characteristics not found: {}", format_slots(.missing))]
    CharacteristicNotFound { missing: Vec<Slot> },

    #[error("Malformed {profile:?} frame: expected {expected} bytes, got {actual}")]
    MalformedFrame {
        profile: FrameProfile,
        expected: usize,
        actual: usize,
    },

    #[error("Transport read on {slot} failed")]
    TransportReadFailed {
        slot: Slot,
        #[source]
        source: RadioError,
    },

    #[error("Invalid characteristic set: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("Advertisement registration failed")]
    AdvertiseFailed {
        #[source]
        source: RadioError,
    },

    #[error("Sensor read failed")]
    Sensor {
        #[from]
        source: SensorError,
    },

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Classification of a `LinkError`, independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    ConnectionFailed,
    ServiceDiscoveryTimeout,
    CharacteristicNotFound,
    MalformedFrame,
    TransportReadFailed,
    InvalidDescriptor,
    AdvertiseFailed,
    Sensor,
    InvalidState,
    Worker,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ServiceDiscoveryTimeout { .. } => ErrorKind::ServiceDiscoveryTimeout,
            Self::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
            Self::MalformedFrame { .. } => ErrorKind::MalformedFrame,
            Self::TransportReadFailed { .. } => ErrorKind::TransportReadFailed,
            Self::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            Self::AdvertiseFailed { .. } => ErrorKind::AdvertiseFailed,
            Self::Sensor { .. } => ErrorKind::Sensor,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Worker(_) => ErrorKind::Worker,
        }
    }

    /// Errors that `connect()` recovers from locally.
    pub fn is_connection_phase(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailed
                | ErrorKind::ServiceDiscoveryTimeout
                | ErrorKind::CharacteristicNotFound
        )
    }

    pub fn connection_failed(peer: impl Into<String>, source: RadioError) -> Self {
        Self::ConnectionFailed {
            peer: peer.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    pub fn malformed(profile: FrameProfile, expected: usize, actual: usize) -> Self {
        Self::MalformedFrame {
            profile,
            expected,
            actual,
        }
    }

    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}

fn format_slots(slots: &[Slot]) -> String {
    slots
        .iter()
        .map(|slot| slot.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SensorChannel;

    #[test]
    fn test_connection_phase_classification() {
        let timeout = LinkError::ServiceDiscoveryTimeout {
            waited: Duration::from_secs(15),
        };
        assert!(timeout.is_connection_phase());

        let missing = LinkError::CharacteristicNotFound {
            missing: vec![Slot::Channel(SensorChannel::Mag)],
        };
        assert!(missing.is_connection_phase());
        assert_eq!(missing.to_string(), "Characteristics not found: mag");

        let malformed = LinkError::malformed(FrameProfile::PerChannelInt16, 6, 5);
        assert!(!malformed.is_connection_phase());
        assert_eq!(malformed.kind(), ErrorKind::MalformedFrame);
    }
}
