//! `From` implementations bridging `evolver_config` types to `evolver_core` types.

use std::collections::BTreeMap;

use crate::Channel;
use crate::config::{CalibratorConfig, CalibratorKind};
use crate::state::Measurement;
use crate::transformer::{FitKind, TransformerSpec};

// ── Kinds ────────────────────────────────────────────────────────────────────

impl From<evolver_config::FitKind> for FitKind {
    fn from(k: evolver_config::FitKind) -> Self {
        match k {
            evolver_config::FitKind::Linear => Self::Linear,
            evolver_config::FitKind::Poly => Self::Poly,
            evolver_config::FitKind::Sigmoid => Self::Sigmoid,
            evolver_config::FitKind::Rate => Self::Rate,
            evolver_config::FitKind::Noop => Self::NoOp,
        }
    }
}

impl From<evolver_config::CalibratorKind> for CalibratorKind {
    fn from(k: evolver_config::CalibratorKind) -> Self {
        match k {
            evolver_config::CalibratorKind::Temperature => Self::Temperature,
            evolver_config::CalibratorKind::Od => Self::OpticalDensity,
            evolver_config::CalibratorKind::Pump => Self::Pump,
            evolver_config::CalibratorKind::Linear => Self::Linear,
            evolver_config::CalibratorKind::Noop => Self::NoOp,
        }
    }
}

// ── TransformerSpec ──────────────────────────────────────────────────────────

impl From<&evolver_config::TransformerCfg> for TransformerSpec {
    fn from(c: &evolver_config::TransformerCfg) -> Self {
        // absent: default lifetime; 0: never expires
        let expire = match c.expire_s {
            None => Some(evolver_config::DEFAULT_EXPIRE_S),
            Some(0) => None,
            Some(s) => Some(s),
        };
        Self {
            kind: c.kind.into(),
            degree: c.degree,
            expire,
            coefficients: c.coefficients.clone(),
        }
    }
}

// ── CalibratorConfig ─────────────────────────────────────────────────────────

impl CalibratorConfig {
    /// Runtime settings for the calibrator of one hardware entry, with file
    /// paths resolved against the storage directory.
    pub fn from_hardware(
        hw: &evolver_config::HardwareCfg,
        cal: &evolver_config::CalibratorCfg,
        storage: &evolver_config::Storage,
    ) -> Self {
        Self {
            calibration_file: cal.calibration_file.as_deref().map(|p| storage.resolve(p)),
            procedure_file: cal.procedure_file.as_deref().map(|p| storage.resolve(p)),
            vials: hw.selected_vials(),
            num_readings: cal.num_readings,
            time_to_pump_fast: cal.time_to_pump_fast,
            time_to_pump_slow: cal.time_to_pump_slow,
            input_transformer: cal.input_transformer.as_ref().map(TransformerSpec::from),
            output_transformer: cal.output_transformer.as_ref().map(TransformerSpec::from),
        }
    }
}

// ── Measurements ─────────────────────────────────────────────────────────────

impl From<evolver_config::MeasuredPairs> for Measurement {
    fn from(p: evolver_config::MeasuredPairs) -> Self {
        Self {
            reference: p.reference,
            raw: p.raw,
        }
    }
}

/// Convert CSV-imported pairs into calibration measurements.
pub fn measurements_from_pairs(
    pairs: BTreeMap<Channel, evolver_config::MeasuredPairs>,
) -> BTreeMap<Channel, Measurement> {
    pairs.into_iter().map(|(ch, p)| (ch, p.into())).collect()
}
