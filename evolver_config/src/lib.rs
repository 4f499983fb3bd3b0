#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and measurement import for the evolver calibration stack.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Measurement CSV loader enforces headers and groups rows per channel so a
//!   calibration file can be seeded from bench data.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default calibration lifetime: 24 weeks.
pub const DEFAULT_EXPIRE_S: u64 = 24 * 7 * 24 * 60 * 60;

/// Measurement CSV schema.
///
/// Expected headers:
/// channel,reference,raw
///
/// Example:
/// channel,reference,raw
/// 0,25.0,1250.0
/// 0,37.0,650.0
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MeasurementRow {
    pub channel: usize,
    pub reference: f64,
    pub raw: f64,
}

/// Paired samples for one channel, in file order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MeasuredPairs {
    pub reference: Vec<f64>,
    pub raw: Vec<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Storage {
    /// Base directory for relative calibration and procedure file paths.
    pub dir: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("calibration_files"),
        }
    }
}

impl Storage {
    /// Resolve `path` against the storage directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Temperature,
    Od,
    Pump,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CalibratorKind {
    Temperature,
    Od,
    Pump,
    Linear,
    Noop,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FitKind {
    Linear,
    Poly,
    Sigmoid,
    Rate,
    Noop,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformerCfg {
    pub kind: FitKind,
    /// Polynomial degree; required for `poly`, implied for `linear`.
    #[serde(default)]
    pub degree: Option<usize>,
    /// Seconds until a fit is considered stale. Absent: default lifetime.
    /// Set to 0 to disable expiry.
    #[serde(default)]
    pub expire_s: Option<u64>,
    /// Optional initial coefficients, ascending power order.
    #[serde(default)]
    pub coefficients: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibratorCfg {
    pub kind: CalibratorKind,
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
    #[serde(default)]
    pub procedure_file: Option<PathBuf>,
    /// Raw readings per raw-value action; the median is recorded.
    #[serde(default = "default_num_readings")]
    pub num_readings: usize,
    /// Pump run time in seconds for the fast and slow modes.
    #[serde(default = "default_time_fast")]
    pub time_to_pump_fast: f64,
    #[serde(default = "default_time_slow")]
    pub time_to_pump_slow: f64,
    #[serde(default)]
    pub input_transformer: Option<TransformerCfg>,
    #[serde(default)]
    pub output_transformer: Option<TransformerCfg>,
}

fn default_num_readings() -> usize {
    3
}

fn default_time_fast() -> f64 {
    10.0
}

fn default_time_slow() -> f64 {
    100.0
}

fn default_channels() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct HardwareCfg {
    pub kind: DeviceKind,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Subset of channels to operate on; all channels when absent.
    #[serde(default)]
    pub vials: Option<Vec<usize>>,
    /// Simulated pump flow per channel (mL/s); defaults to 0.1 mL/s each.
    #[serde(default)]
    pub flow_ml_per_s: Vec<f64>,
    #[serde(default)]
    pub calibrator: Option<CalibratorCfg>,
}

impl HardwareCfg {
    pub fn selected_vials(&self) -> Vec<usize> {
        match &self.vials {
            Some(v) => v.clone(),
            None => (0..self.channels).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub hardware: BTreeMap<String, HardwareCfg>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

pub fn load_measurements_csv(path: &Path) -> eyre::Result<BTreeMap<usize, MeasuredPairs>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open measurement CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["channel", "reference", "raw"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "measurement CSV must have headers 'channel,reference,raw', got: {}",
            actual.join(",")
        );
    }

    let mut out: BTreeMap<usize, MeasuredPairs> = BTreeMap::new();
    for (idx, rec) in rdr.deserialize::<MeasurementRow>().enumerate() {
        match rec {
            Ok(row) => {
                if !(row.reference.is_finite() && row.raw.is_finite()) {
                    eyre::bail!("invalid CSV row {}: non-finite value", idx + 2);
                }
                let pairs = out.entry(row.channel).or_default();
                pairs.reference.push(row.reference);
                pairs.raw.push(row.raw);
            }
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    if out.is_empty() {
        eyre::bail!("measurement CSV {:?} has no rows", path);
    }
    Ok(out)
}

impl TransformerCfg {
    fn validate(&self, at: &str) -> eyre::Result<()> {
        match self.kind {
            FitKind::Poly if self.degree.is_none() => {
                eyre::bail!("{at}.degree is required for poly transformers");
            }
            FitKind::Linear if self.degree.is_some_and(|d| d != 1) => {
                eyre::bail!("{at}.degree must be 1 for linear transformers");
            }
            _ => {}
        }
        if let Some(c) = &self.coefficients {
            let expected = match self.kind {
                FitKind::Linear => Some(2),
                FitKind::Poly => self.degree.map(|d| d + 1),
                FitKind::Sigmoid => Some(4),
                FitKind::Rate => Some(1),
                FitKind::Noop => Some(0),
            };
            if let Some(n) = expected
                && c.len() != n
            {
                eyre::bail!("{at}.coefficients must have {n} entries, got {}", c.len());
            }
            if c.iter().any(|v| !v.is_finite()) {
                eyre::bail!("{at}.coefficients must be finite");
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        for (name, hw) in &self.hardware {
            if name.trim().is_empty() {
                eyre::bail!("hardware names must be non-empty");
            }
            if hw.channels == 0 {
                eyre::bail!("hardware.{name}.channels must be >= 1");
            }
            if let Some(vials) = &hw.vials {
                if vials.is_empty() {
                    eyre::bail!("hardware.{name}.vials must not be empty when set");
                }
                if let Some(bad) = vials.iter().find(|v| **v >= hw.channels) {
                    eyre::bail!(
                        "hardware.{name}.vials contains {bad}, but the device has {} channels",
                        hw.channels
                    );
                }
            }
            if hw.flow_ml_per_s.iter().any(|f| !(f.is_finite() && *f > 0.0)) {
                eyre::bail!("hardware.{name}.flow_ml_per_s entries must be > 0");
            }

            let Some(cal) = &hw.calibrator else {
                continue;
            };
            if cal.num_readings == 0 {
                eyre::bail!("hardware.{name}.calibrator.num_readings must be >= 1");
            }
            if !(cal.time_to_pump_fast > 0.0 && cal.time_to_pump_slow > 0.0) {
                eyre::bail!("hardware.{name}.calibrator pump times must be > 0");
            }
            if matches!(cal.kind, CalibratorKind::Pump) && hw.kind != DeviceKind::Pump {
                eyre::bail!("hardware.{name}: pump calibrator requires pump hardware");
            }
            if let Some(t) = &cal.input_transformer {
                t.validate(&format!("hardware.{name}.calibrator.input_transformer"))?;
            }
            if let Some(t) = &cal.output_transformer {
                t.validate(&format!("hardware.{name}.calibrator.output_transformer"))?;
            }
        }

        Ok(())
    }
}
