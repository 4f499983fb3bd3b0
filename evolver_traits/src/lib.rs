pub mod clock;

pub use clock::{Clock, SystemClock};

/// Error type used at every collaborator boundary. Callers map it to their own
/// typed errors (see `evolver_core::hw_error`).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A device that reports one raw value per channel.
pub trait Sensor {
    /// Read every channel. Index `i` of the result is channel `i`.
    fn read(&mut self) -> Result<Vec<f64>, BoxError>;
}

/// A device that accepts proposals per channel and applies them on `commit`.
pub trait Effector {
    fn set(&mut self, channel: usize, value: f64) -> Result<(), BoxError>;
    fn commit(&mut self) -> Result<(), BoxError>;
}

/// A named piece of hardware that may be a sensor, an effector, or both.
pub trait Hardware {
    fn name(&self) -> &str;

    /// Channels this device addresses, in ascending order.
    fn channels(&self) -> Vec<usize>;

    fn as_sensor(&mut self) -> Option<&mut dyn Sensor> {
        None
    }

    fn as_effector(&mut self) -> Option<&mut dyn Effector> {
        None
    }
}

/// Sink for history records (`put(name, kind, data)`).
pub trait HistorySink: Send + Sync {
    fn put(&self, name: &str, kind: &str, data: serde_json::Value) -> Result<(), BoxError>;
}

/// History sink that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistory;

impl HistorySink for NullHistory {
    fn put(&self, _name: &str, _kind: &str, _data: serde_json::Value) -> Result<(), BoxError> {
        Ok(())
    }
}
