use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::Channel;

/// One payload rule that was broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn on_channel(channel: &Option<Channel>) -> String {
    channel.map_or_else(String::new, |c| format!(" on channel {c}"))
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("invalid payload for action '{action}': {}", join_violations(.violations))]
    Validation {
        action: String,
        violations: Vec<Violation>,
    },
    #[error("action not found: {0}")]
    ActionNotFound(String),
    #[error("calibration procedure has not been started")]
    ProcedureNotStarted,
    #[error("calibration procedure is already complete")]
    ProcedureComplete,
    #[error("no saved calibration procedure at {}", .0.display())]
    ProcedureNotFound(PathBuf),
    #[error("insufficient data{}: need {needed} samples, got {got}", on_channel(.channel))]
    InsufficientData {
        channel: Option<Channel>,
        needed: usize,
        got: usize,
    },
    #[error("fit failed{} with {samples} samples: {reason}", on_channel(.channel))]
    Fit {
        channel: Option<Channel>,
        samples: usize,
        reason: String,
    },
    #[error("no real solution for y = {0}")]
    NoRealRoot(f64),
    #[error("transformer has no fitted parameters")]
    NotFitted,
    #[error("invalid transformer parameters: {0}")]
    InvalidParameters(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("timeout waiting for hardware")]
    Timeout,
    #[error("action '{action}' failed: {source}")]
    ActionExecution {
        action: String,
        #[source]
        source: Box<CalibrationError>,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("nothing to undo")]
    NothingToUndo,
    #[error("unknown hardware: {0}")]
    UnknownHardware(String),
    #[error("invalid state: {0}")]
    State(String),
}

impl CalibrationError {
    /// Attach a channel to data and fit errors that do not carry one yet.
    #[must_use]
    pub fn on_channel(self, ch: Channel) -> Self {
        match self {
            Self::InsufficientData {
                channel: None,
                needed,
                got,
            } => Self::InsufficientData {
                channel: Some(ch),
                needed,
                got,
            },
            Self::Fit {
                channel: None,
                samples,
                reason,
            } => Self::Fit {
                channel: Some(ch),
                samples,
                reason,
            },
            other => other,
        }
    }

    /// The innermost error, looking through `ActionExecution` wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::ActionExecution { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors caused by the request rather than by the system
    /// (bad payload, unknown names, calls in the wrong phase).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            Self::Validation { .. }
                | Self::ActionNotFound(_)
                | Self::ProcedureNotStarted
                | Self::ProcedureComplete
                | Self::ProcedureNotFound(_)
                | Self::NothingToUndo
                | Self::UnknownHardware(_)
                | Self::InsufficientData { .. }
                | Self::NoRealRoot(_)
        )
    }

    pub(crate) fn storage(context: impl fmt::Display, e: impl fmt::Display) -> Self {
        Self::Storage(format!("{context}: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_violation() {
        let e = CalibrationError::Validation {
            action: "measure_vial_0_temperature".into(),
            violations: vec![
                Violation::new("temperature", "required field is missing"),
                Violation::new("extra", "unknown field"),
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("temperature: required field is missing"));
        assert!(msg.contains("extra: unknown field"));
    }

    #[test]
    fn channel_is_attached_once() {
        let e = CalibrationError::InsufficientData {
            channel: None,
            needed: 2,
            got: 1,
        }
        .on_channel(3)
        .on_channel(7);
        assert_eq!(
            e,
            CalibrationError::InsufficientData {
                channel: Some(3),
                needed: 2,
                got: 1
            }
        );
        assert_eq!(e.to_string(), "insufficient data on channel 3: need 2 samples, got 1");
    }

    #[test]
    fn execution_wrapper_keeps_root_classification() {
        let e = CalibrationError::ActionExecution {
            action: "read_vial_0_raw_output".into(),
            source: Box::new(CalibrationError::Timeout),
        };
        assert_eq!(e.root(), &CalibrationError::Timeout);
        assert!(!e.is_client_error());
        assert!(std::error::Error::source(&e).is_some());
    }
}
