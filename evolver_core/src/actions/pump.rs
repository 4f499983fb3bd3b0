//! Pump calibration: run every pump for a fixed time, then record the
//! volume each one delivered.

use crate::Channel;
use crate::action::{ActionContext, CalibrationAction};
use crate::error::{CalibrationError, Result};
use crate::hw_error::map_hw_error;
use crate::payload::{Payload, PayloadSchema};
use crate::state::ProcedureState;

/// Key in `ProcedureState::extra` holding the last run time in seconds.
pub const TIME_PUMPED: &str = "time_pumped";

#[derive(Debug, Clone)]
pub struct PumpAction {
    channels: Vec<Channel>,
    time_fast: f64,
    time_slow: f64,
}

impl PumpAction {
    pub const NAME: &'static str = "run_pumps";

    pub fn new(channels: Vec<Channel>, time_fast: f64, time_slow: f64) -> Self {
        Self {
            channels,
            time_fast,
            time_slow,
        }
    }
}

impl CalibrationAction for PumpAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Run every selected pump for the calibration time"
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema::empty().optional_bool(
            "use_fast_mode",
            "Use the short fast-mode run time instead of the slow one",
        )
    }

    fn execute(
        &self,
        state: &ProcedureState,
        payload: &Payload,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let seconds = if payload.flag("use_fast_mode").unwrap_or(false) {
            self.time_fast
        } else {
            self.time_slow
        };
        let device = ctx.hardware.name().to_owned();
        let effector = ctx
            .hardware
            .as_effector()
            .ok_or_else(|| CalibrationError::Hardware(format!("{device} is not an effector")))?;
        for ch in &self.channels {
            effector
                .set(*ch, seconds)
                .map_err(|e| map_hw_error(e.as_ref()))?;
        }
        effector.commit().map_err(|e| map_hw_error(e.as_ref()))?;
        tracing::info!(device = %device, pumps = self.channels.len(), seconds, "pumps run");

        let mut next = state.clone();
        next.extra.insert(TIME_PUMPED.to_owned(), seconds);
        Ok(next)
    }
}

/// Records the volume one pump delivered during the last run.
#[derive(Debug, Clone)]
pub struct RecordVolumeAction {
    name: String,
    description: String,
    channel: Channel,
}

impl RecordVolumeAction {
    pub fn new(channel: Channel) -> Self {
        Self {
            name: format!("record_pump_{channel}_volume"),
            description: format!("Enter the volume (mL) pump {channel} delivered"),
            channel,
        }
    }
}

impl CalibrationAction for RecordVolumeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema::empty().required_number("volume", &self.description)
    }

    fn execute(
        &self,
        state: &ProcedureState,
        payload: &Payload,
        _ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let volume = payload.require_number("volume")?;
        let seconds = state.extra.get(TIME_PUMPED).copied().ok_or_else(|| {
            CalibrationError::State(format!(
                "no pump run recorded; dispatch {} first",
                PumpAction::NAME
            ))
        })?;
        let mut next = state.clone();
        let m = next.measurement_mut(self.channel);
        m.raw.push(seconds);
        m.reference.push(volume);
        Ok(next)
    }
}
