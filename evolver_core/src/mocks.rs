//! Test and helper mocks for evolver_core

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use evolver_traits::{BoxError, Effector, Hardware, HistorySink, Sensor};

/// Sensor that returns the same readings on every read and records every
/// effector proposal it is given.
#[derive(Debug, Clone)]
pub struct FixedSensor {
    name: String,
    readings: Vec<f64>,
    proposal: BTreeMap<usize, f64>,
    committed: Arc<Mutex<Vec<BTreeMap<usize, f64>>>>,
}

impl FixedSensor {
    pub fn new(name: impl Into<String>, readings: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            readings,
            proposal: BTreeMap::new(),
            committed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every committed batch of set points, oldest first.
    pub fn commits(&self) -> Vec<BTreeMap<usize, f64>> {
        self.committed.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Sensor for FixedSensor {
    fn read(&mut self) -> Result<Vec<f64>, BoxError> {
        Ok(self.readings.clone())
    }
}

impl Effector for FixedSensor {
    fn set(&mut self, channel: usize, value: f64) -> Result<(), BoxError> {
        self.proposal.insert(channel, value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        let batch = std::mem::take(&mut self.proposal);
        if let Ok(mut c) = self.committed.lock() {
            c.push(batch);
        }
        Ok(())
    }
}

impl Hardware for FixedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<usize> {
        (0..self.readings.len()).collect()
    }

    fn as_sensor(&mut self) -> Option<&mut dyn Sensor> {
        Some(self)
    }

    fn as_effector(&mut self) -> Option<&mut dyn Effector> {
        Some(self)
    }
}

/// A history record as passed to `HistorySink::put`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub name: String,
    pub kind: String,
    pub data: serde_json::Value,
}

/// History sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingHistory {
    records: Arc<Mutex<Vec<HistoryRecord>>>,
}

impl RecordingHistory {
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl HistorySink for RecordingHistory {
    fn put(&self, name: &str, kind: &str, data: serde_json::Value) -> Result<(), BoxError> {
        self.records
            .lock()
            .map_err(|_| std::io::Error::other("history poisoned"))?
            .push(HistoryRecord {
                name: name.to_owned(),
                kind: kind.to_owned(),
                data,
            });
        Ok(())
    }
}
