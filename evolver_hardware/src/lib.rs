//! Simulated evolver hardware.
//!
//! The serial protocol drivers live outside this workspace; these devices
//! implement the same `evolver_traits` contracts so calibration procedures can
//! run end to end on a workstation.
pub mod error;
pub mod util;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evolver_traits::{BoxError, Effector, Hardware, Sensor};

use crate::error::HwError;

const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Linear response of a simulated sensor: raw = offset + gain * physical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    pub offset: f64,
    pub gain: f64,
}

impl Response {
    /// Thermistor-like response: raw counts fall as temperature rises.
    pub const TEMPERATURE: Self = Self {
        offset: 2500.0,
        gain: -50.0,
    };
    /// Photodiode-like response for optical density.
    pub const OPTICAL_DENSITY: Self = Self {
        offset: 62_000.0,
        gain: -30_000.0,
    };

    #[inline]
    pub fn raw(&self, physical: f64) -> f64 {
        self.offset + self.gain * physical
    }
}

#[derive(Debug)]
struct SensorShared {
    physical: Mutex<Vec<f64>>,
    data_ready: AtomicBool,
    reads: AtomicUsize,
    fault: Mutex<Option<String>>,
}

/// Shared control over a `SimulatedSensor` after it has been handed off.
#[derive(Debug, Clone)]
pub struct SensorHandle {
    shared: Arc<SensorShared>,
}

impl SensorHandle {
    pub fn set_physical(&self, channel: usize, value: f64) {
        if let Ok(mut p) = self.shared.physical.lock()
            && let Some(slot) = p.get_mut(channel)
        {
            *slot = value;
        }
    }

    /// Hold the data-ready line low; reads time out until released.
    pub fn set_data_ready(&self, ready: bool) {
        self.shared.data_ready.store(ready, Ordering::Relaxed);
    }

    /// Make the next read fail with a device fault.
    pub fn inject_fault(&self, message: impl Into<String>) {
        if let Ok(mut f) = self.shared.fault.lock() {
            *f = Some(message.into());
        }
    }

    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::Relaxed)
    }
}

/// Simulated per-vial sensor with an optional heater/LED effector side.
pub struct SimulatedSensor {
    name: String,
    response: Response,
    read_timeout: Duration,
    shared: Arc<SensorShared>,
    proposal: BTreeMap<usize, f64>,
    committed: BTreeMap<usize, f64>,
}

impl SimulatedSensor {
    pub fn new(name: impl Into<String>, channels: usize, response: Response) -> Self {
        Self {
            name: name.into(),
            response,
            read_timeout: Duration::from_millis(150),
            shared: Arc::new(SensorShared {
                physical: Mutex::new(vec![0.0; channels]),
                data_ready: AtomicBool::new(true),
                reads: AtomicUsize::new(0),
                fault: Mutex::new(None),
            }),
            proposal: BTreeMap::new(),
            committed: BTreeMap::new(),
        }
    }

    pub fn temperature(name: impl Into<String>, channels: usize) -> Self {
        let s = Self::new(name, channels, Response::TEMPERATURE);
        s.fill(25.0);
        s
    }

    pub fn optical_density(name: impl Into<String>, channels: usize) -> Self {
        let s = Self::new(name, channels, Response::OPTICAL_DENSITY);
        s.fill(0.1);
        s
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn handle(&self) -> SensorHandle {
        SensorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Last committed effector values (e.g. heater set points in raw units).
    pub fn committed(&self) -> &BTreeMap<usize, f64> {
        &self.committed
    }

    fn fill(&self, value: f64) {
        if let Ok(mut p) = self.shared.physical.lock() {
            p.iter_mut().for_each(|v| *v = value);
        }
    }

    fn channel_count(&self) -> usize {
        self.shared.physical.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> Result<Vec<f64>, BoxError> {
        let shared = Arc::clone(&self.shared);
        if let Err(e) = util::wait_until_ready_with_timeout(
            || shared.data_ready.load(Ordering::Relaxed),
            self.read_timeout,
            POLL_INTERVAL,
        ) {
            tracing::warn!(device = %self.name, "sensor read timed out");
            return Err(Box::new(e));
        }
        if let Some(msg) = self.shared.fault.lock().ok().and_then(|mut f| f.take()) {
            tracing::error!(device = %self.name, fault = %msg, "sensor fault");
            return Err(Box::new(HwError::Fault(msg)));
        }
        let physical = self
            .shared
            .physical
            .lock()
            .map_err(|_| HwError::Fault("sensor state poisoned".into()))?
            .clone();
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        let raw: Vec<f64> = physical.iter().map(|p| self.response.raw(*p)).collect();
        tracing::debug!(device = %self.name, channels = raw.len(), "sensor read");
        Ok(raw)
    }
}

impl Effector for SimulatedSensor {
    fn set(&mut self, channel: usize, value: f64) -> Result<(), BoxError> {
        let channels = self.channel_count();
        if channel >= channels {
            return Err(Box::new(HwError::ChannelOutOfRange { channel, channels }));
        }
        self.proposal.insert(channel, value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        self.committed.append(&mut self.proposal);
        tracing::debug!(device = %self.name, committed = self.committed.len(), "effector commit");
        Ok(())
    }
}

impl Hardware for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<usize> {
        (0..self.channel_count()).collect()
    }

    fn as_sensor(&mut self) -> Option<&mut dyn Sensor> {
        Some(self)
    }

    fn as_effector(&mut self) -> Option<&mut dyn Effector> {
        Some(self)
    }
}

/// Shared view of what a `SimulatedPump` has dispensed.
#[derive(Debug, Clone, Default)]
pub struct PumpHandle {
    dispensed: Arc<Mutex<BTreeMap<usize, f64>>>,
    runs: Arc<Mutex<Vec<BTreeMap<usize, f64>>>>,
}

impl PumpHandle {
    /// Total volume (mL) dispensed per pump since construction.
    pub fn dispensed(&self) -> BTreeMap<usize, f64> {
        self.dispensed.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Committed runs, each mapping pump id to run time in seconds.
    pub fn runs(&self) -> Vec<BTreeMap<usize, f64>> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// Simulated peristaltic pump array. `set(pump, seconds)` proposes a run time.
pub struct SimulatedPump {
    name: String,
    flow_ml_per_s: Vec<f64>,
    active: Option<Vec<usize>>,
    proposal: BTreeMap<usize, f64>,
    handle: PumpHandle,
}

impl SimulatedPump {
    pub fn new(name: impl Into<String>, flow_ml_per_s: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            flow_ml_per_s,
            active: None,
            proposal: BTreeMap::new(),
            handle: PumpHandle::default(),
        }
    }

    /// Restrict the addressable pumps to a subset.
    pub fn with_active(mut self, active: Vec<usize>) -> Self {
        self.active = Some(active);
        self
    }

    pub fn handle(&self) -> PumpHandle {
        self.handle.clone()
    }
}

impl Effector for SimulatedPump {
    fn set(&mut self, channel: usize, value: f64) -> Result<(), BoxError> {
        if !self.channels().contains(&channel) {
            return Err(Box::new(HwError::ChannelOutOfRange {
                channel,
                channels: self.flow_ml_per_s.len(),
            }));
        }
        self.proposal.insert(channel, value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        let run = std::mem::take(&mut self.proposal);
        {
            let mut dispensed = self
                .handle
                .dispensed
                .lock()
                .map_err(|_| HwError::Fault("pump state poisoned".into()))?;
            for (pump, seconds) in &run {
                let rate = self.flow_ml_per_s.get(*pump).copied().unwrap_or(0.0);
                *dispensed.entry(*pump).or_insert(0.0) += rate * seconds;
            }
        }
        tracing::info!(device = %self.name, pumps = run.len(), "pump run committed");
        if let Ok(mut runs) = self.handle.runs.lock() {
            runs.push(run);
        }
        Ok(())
    }
}

impl Hardware for SimulatedPump {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<usize> {
        match &self.active {
            Some(active) => active
                .iter()
                .copied()
                .filter(|p| *p < self.flow_ml_per_s.len())
                .collect(),
            None => (0..self.flow_ml_per_s.len()).collect(),
        }
    }

    fn as_effector(&mut self) -> Option<&mut dyn Effector> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_temperature_follows_response() {
        let mut sensor = SimulatedSensor::temperature("temp", 3);
        let handle = sensor.handle();
        handle.set_physical(1, 30.0);
        let raw = sensor.read().unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0], Response::TEMPERATURE.raw(25.0));
        assert_eq!(raw[1], Response::TEMPERATURE.raw(30.0));
        assert_eq!(handle.reads(), 1);
    }

    #[test]
    fn held_data_ready_times_out() {
        let mut sensor =
            SimulatedSensor::temperature("temp", 1).with_read_timeout(Duration::from_millis(2));
        sensor.handle().set_data_ready(false);
        let err = sensor.read().expect_err("expected timeout");
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn injected_fault_is_reported_once() {
        let mut sensor = SimulatedSensor::optical_density("od", 2);
        sensor.handle().inject_fault("bus error");
        assert!(sensor.read().is_err());
        assert!(sensor.read().is_ok());
    }

    #[test]
    fn pump_commit_accumulates_volume() {
        let mut pump = SimulatedPump::new("pump", vec![0.1, 0.5]);
        let handle = pump.handle();
        pump.set(0, 10.0).unwrap();
        pump.set(1, 10.0).unwrap();
        pump.commit().unwrap();
        let dispensed = handle.dispensed();
        assert!((dispensed[&0] - 1.0).abs() < 1e-12);
        assert!((dispensed[&1] - 5.0).abs() < 1e-12);
        assert_eq!(handle.runs().len(), 1);
    }

    #[test]
    fn inactive_pump_rejects_set() {
        let mut pump = SimulatedPump::new("pump", vec![0.1, 0.1, 0.1]).with_active(vec![0, 2]);
        assert_eq!(pump.channels(), vec![0, 2]);
        assert!(pump.set(1, 5.0).is_err());
    }
}
