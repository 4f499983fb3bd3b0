//! Concrete calibration actions.

mod measure;
mod pump;

pub use crate::action::DisplayInstructionAction;
pub use measure::{
    CalculateFitAction, CalculatePooledFitAction, Orientation, Pooled, RawValueAction,
    ReferenceValueAction,
};
pub use pump::{PumpAction, RecordVolumeAction, TIME_PUMPED};
