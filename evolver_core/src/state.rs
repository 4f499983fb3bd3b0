//! Procedure state and its persisted form.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Channel;
use crate::error::{CalibrationError, Result};
use crate::transformer::TransformerParameters;
use crate::util::{de_channel_map, de_one_or_many, load_yaml, save_yaml};

/// Paired samples collected for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Values from an external reference instrument (thermometer, scale...).
    #[serde(default, deserialize_with = "de_one_or_many")]
    pub reference: Vec<f64>,
    /// Values reported by the device.
    #[serde(default, deserialize_with = "de_one_or_many")]
    pub raw: Vec<f64>,
}

/// Everything a procedure has collected so far.
///
/// Entries of `history` are snapshots of earlier states with an empty
/// `history` of their own; `history.len()` equals the number of dispatches
/// since the procedure was started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureState {
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub completed_actions: Vec<String>,
    #[serde(default, deserialize_with = "de_channel_map")]
    pub measured: BTreeMap<Channel, Measurement>,
    #[serde(default, deserialize_with = "de_channel_map")]
    pub fitted: BTreeMap<Channel, TransformerParameters>,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
    #[serde(default)]
    pub history: Vec<ProcedureState>,
}

impl ProcedureState {
    /// Fresh state of a started procedure.
    pub fn started() -> Self {
        Self {
            started: true,
            ..Self::default()
        }
    }

    pub fn measurement_mut(&mut self, channel: Channel) -> &mut Measurement {
        self.measured.entry(channel).or_default()
    }
}

/// On-disk form of an in-progress procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureFile {
    pub procedure: String,
    pub hardware: String,
    pub channels: Vec<Channel>,
    /// Registered action names in order; must match on resume.
    pub actions: Vec<String>,
    pub state: ProcedureState,
}

impl ProcedureFile {
    /// Load a saved procedure; `ProcedureNotFound` if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        load_yaml(path)?.ok_or_else(|| CalibrationError::ProcedureNotFound(path.to_path_buf()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_yaml(path, self)
    }
}
