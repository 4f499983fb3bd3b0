//! Runtime configuration of a calibrator and the registry of calibrator kinds.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Channel;
use crate::action::{CalibrationAction, DisplayInstructionAction};
use crate::actions::{
    CalculateFitAction, CalculatePooledFitAction, Orientation, PumpAction, RawValueAction,
    RecordVolumeAction, ReferenceValueAction,
};
use crate::slot::SlotSide;
use crate::transformer::{FitKind, TransformerSpec};

/// Default lifetime of fitted parameters: 24 weeks.
pub const DEFAULT_EXPIRE_S: u64 = 24 * 7 * 24 * 60 * 60;

/// Calibrator settings. Transformer specs left as `None` use the kind's default.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratorConfig {
    pub calibration_file: Option<PathBuf>,
    pub procedure_file: Option<PathBuf>,
    /// Channels a procedure covers when the caller does not pick any.
    pub vials: Vec<Channel>,
    /// Raw readings per raw-value action; the median is recorded.
    pub num_readings: usize,
    pub time_to_pump_fast: f64,
    pub time_to_pump_slow: f64,
    pub input_transformer: Option<TransformerSpec>,
    pub output_transformer: Option<TransformerSpec>,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            calibration_file: None,
            procedure_file: None,
            vials: Vec::new(),
            num_readings: 3,
            time_to_pump_fast: 10.0,
            time_to_pump_slow: 100.0,
            input_transformer: None,
            output_transformer: None,
        }
    }
}

/// How a calibrator arranges its transformers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One transformer shared by every channel.
    Single,
    /// One transformer per channel, created on demand.
    PerChannel,
}

/// Registry of calibrator kinds: transformer defaults, fit orientation and
/// the action catalog each kind runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibratorKind {
    Temperature,
    OpticalDensity,
    Pump,
    Linear,
    #[serde(rename = "noop")]
    NoOp,
}

impl fmt::Display for CalibratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Temperature => "temperature",
            Self::OpticalDensity => "optical_density",
            Self::Pump => "pump",
            Self::Linear => "linear",
            Self::NoOp => "noop",
        };
        f.write_str(s)
    }
}

impl CalibratorKind {
    pub fn procedure_name(self) -> String {
        format!("{self}_calibration")
    }

    pub fn layout(self) -> Layout {
        match self {
            Self::Temperature | Self::OpticalDensity | Self::Pump => Layout::PerChannel,
            Self::Linear | Self::NoOp => Layout::Single,
        }
    }

    /// Transformer used for `side` when the config does not name one.
    pub fn default_transformer(self, side: SlotSide) -> Option<TransformerSpec> {
        let expire = Some(DEFAULT_EXPIRE_S);
        let spec = |kind| Some(TransformerSpec::new(kind).with_expire(expire));
        match (self, side) {
            (Self::Temperature | Self::Linear, SlotSide::Output) => spec(FitKind::Linear),
            (Self::OpticalDensity, SlotSide::Output) => spec(FitKind::Sigmoid),
            (Self::Pump, SlotSide::Input) => spec(FitKind::Rate),
            (Self::NoOp, _) => Some(TransformerSpec::new(FitKind::NoOp)),
            _ => None,
        }
    }

    /// Slot refitted from the procedure's measurements, and how pairs map to x/y.
    pub fn fit_target(self) -> Option<(SlotSide, Orientation)> {
        match self {
            Self::Temperature | Self::OpticalDensity | Self::Linear => {
                Some((SlotSide::Output, Orientation::ReferenceToRaw))
            }
            Self::Pump => Some((SlotSide::Input, Orientation::RawToReference)),
            Self::NoOp => None,
        }
    }

    /// Action catalog for a procedure over `channels`, in dispatch order.
    pub fn actions(
        self,
        config: &CalibratorConfig,
        channels: &[Channel],
    ) -> Vec<Box<dyn CalibrationAction>> {
        let mut out: Vec<Box<dyn CalibrationAction>> = Vec::new();
        let per_vial_fit = |out: &mut Vec<Box<dyn CalibrationAction>>| {
            if let Some((side, orientation)) = self.fit_target() {
                for ch in channels {
                    out.push(Box::new(CalculateFitAction::new(*ch, side, orientation)));
                }
            }
        };
        let measure = |out: &mut Vec<Box<dyn CalibrationAction>>, field: &str| {
            for ch in channels {
                out.push(Box::new(ReferenceValueAction::new(*ch, field)));
                out.push(Box::new(RawValueAction::new(*ch, config.num_readings)));
            }
        };

        match self {
            Self::Temperature => {
                out.push(Box::new(DisplayInstructionAction::new(
                    "fill_vials_instruction",
                    "Fill each vial with 15 mL of water",
                )));
                out.push(Box::new(DisplayInstructionAction::new(
                    "wait_for_equilibrium_instruction",
                    "Wait until the vial temperatures have settled",
                )));
                measure(&mut out, "temperature");
                per_vial_fit(&mut out);
            }
            Self::OpticalDensity => {
                out.push(Box::new(DisplayInstructionAction::new(
                    "insert_calibration_vials_instruction",
                    "Insert the vials of the OD standard series",
                )));
                measure(&mut out, "od");
                per_vial_fit(&mut out);
            }
            Self::Pump => {
                out.push(Box::new(DisplayInstructionAction::new(
                    "place_vials_instruction",
                    "Place an empty, pre-weighed vial under each pump outlet",
                )));
                out.push(Box::new(PumpAction::new(
                    channels.to_vec(),
                    config.time_to_pump_fast,
                    config.time_to_pump_slow,
                )));
                for ch in channels {
                    out.push(Box::new(RecordVolumeAction::new(*ch)));
                }
            }
            Self::Linear => {
                measure(&mut out, "reference");
                if let Some((side, orientation)) = self.fit_target() {
                    out.push(Box::new(CalculatePooledFitAction::new(side, orientation)));
                }
            }
            Self::NoOp => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(kind: CalibratorKind, channels: &[Channel]) -> Vec<String> {
        kind.actions(&CalibratorConfig::default(), channels)
            .iter()
            .map(|a| a.name().to_owned())
            .collect()
    }

    #[test]
    fn temperature_catalog_order() {
        assert_eq!(
            names(CalibratorKind::Temperature, &[0, 1]),
            vec![
                "fill_vials_instruction",
                "wait_for_equilibrium_instruction",
                "measure_vial_0_temperature",
                "read_vial_0_raw_output",
                "measure_vial_1_temperature",
                "read_vial_1_raw_output",
                "calculate_vial_0_fit",
                "calculate_vial_1_fit",
            ]
        );
    }

    #[test]
    fn pump_catalog() {
        assert_eq!(
            names(CalibratorKind::Pump, &[2]),
            vec!["place_vials_instruction", "run_pumps", "record_pump_2_volume"]
        );
    }

    #[test]
    fn linear_catalog_ends_with_pooled_fit() {
        assert_eq!(
            names(CalibratorKind::Linear, &[0]),
            vec!["measure_vial_0_reference", "read_vial_0_raw_output", "calculate_fit"]
        );
    }

    #[test]
    fn noop_has_no_actions_or_fit() {
        assert!(names(CalibratorKind::NoOp, &[0, 1]).is_empty());
        assert_eq!(CalibratorKind::NoOp.fit_target(), None);
    }

    #[test]
    fn defaults_expire_after_24_weeks() {
        let spec = CalibratorKind::Temperature
            .default_transformer(SlotSide::Output)
            .unwrap();
        assert_eq!(spec.expire, Some(14_515_200));
        assert!(CalibratorKind::Temperature.default_transformer(SlotSide::Input).is_none());
    }
}
