//! Error taxonomy for the fader control layer
//!
//! Every variant carries enough context (indices, positions, timings) for a
//! caller to retry, disable a feature, or tell the user what happened.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the fader controller and its components
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FaderError {
    #[error("serial connection to '{port}' failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed {
        port: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("movement error on fader(s) {indexes:?}: {reason}")]
    MovementError { indexes: Vec<u8>, reason: String },

    #[error("calibration failed for fader(s) {indexes:?}: {reason}")]
    CalibrationFailed { indexes: Vec<u8>, reason: String },

    #[error("device did not signal readiness after {attempts} poll(s)")]
    DeviceNotReady { attempts: u32 },

    #[error("queue for channel {channel} exceeded {limit} entries, dropped {dropped} oldest")]
    QueueOverflow {
        channel: u8,
        dropped: usize,
        limit: usize,
    },

    #[error("send lock not acquired within {waited:?}")]
    QueueLockError { waited: Duration },

    #[error(
        "no position echo for channel {channel} (target {target}, last seen {last_position:?}) within {window:?}"
    )]
    MidiFeedbackError {
        channel: u8,
        target: u16,
        last_position: Option<u16>,
        window: Duration,
    },

    #[error("fader {index} not found")]
    FaderNotFound { index: u8 },
}

impl FaderError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FaderError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            FaderError::InvalidConfig(_) => "INVALID_CONFIG",
            FaderError::MovementError { .. } => "MOVEMENT_ERROR",
            FaderError::CalibrationFailed { .. } => "CALIBRATION_FAILED",
            FaderError::DeviceNotReady { .. } => "DEVICE_NOT_READY",
            FaderError::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            FaderError::QueueLockError { .. } => "QUEUE_LOCK_ERROR",
            FaderError::MidiFeedbackError { .. } => "MIDI_FEEDBACK_ERROR",
            FaderError::FaderNotFound { .. } => "FADER_NOT_FOUND",
        }
    }

    /// Fader indices affected by this error, if any
    pub fn indexes(&self) -> Vec<u8> {
        match self {
            FaderError::MovementError { indexes, .. }
            | FaderError::CalibrationFailed { indexes, .. } => indexes.clone(),
            FaderError::QueueOverflow { channel, .. }
            | FaderError::MidiFeedbackError { channel, .. } => vec![*channel],
            FaderError::FaderNotFound { index } => vec![*index],
            _ => Vec::new(),
        }
    }

    /// Whether the controller can keep running after this error.
    ///
    /// Only link loss is fatal; everything else is reported as a
    /// non-fatal error event or returned to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaderError::ConnectionFailed { .. })
    }

    pub(crate) fn movement(indexes: &[u8], reason: impl Into<String>) -> Self {
        FaderError::MovementError {
            indexes: indexes.to_vec(),
            reason: reason.into(),
        }
    }

    pub(crate) fn calibration(indexes: &[u8], reason: impl Into<String>) -> Self {
        FaderError::CalibrationFailed {
            indexes: indexes.to_vec(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FaderError::FaderNotFound { index: 2 }.code(), "FADER_NOT_FOUND");
        assert_eq!(
            FaderError::QueueLockError {
                waited: Duration::from_millis(5)
            }
            .code(),
            "QUEUE_LOCK_ERROR"
        );
    }

    #[test]
    fn test_context_indexes() {
        let err = FaderError::MidiFeedbackError {
            channel: 3,
            target: 16383,
            last_position: None,
            window: Duration::from_millis(200),
        };
        assert_eq!(err.indexes(), vec![3]);
        assert!(!err.is_fatal());

        let err = FaderError::ConnectionFailed {
            port: "/dev/ttyACM0".into(),
            attempts: 3,
            reason: "busy".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
