//! Per-vial measurement and fitting actions.

use std::collections::BTreeMap;

use crate::Channel;
use crate::action::{ActionContext, CalibrationAction, vial_action};
use crate::error::{CalibrationError, Result};
use crate::hw_error::map_hw_error;
use crate::payload::{Payload, PayloadSchema};
use crate::slot::{SlotSide, TransformerSlot};
use crate::state::{Measurement, ProcedureState};
use crate::util::median;

/// Records an operator-entered reference value (thermometer, spectrophotometer).
#[derive(Debug, Clone)]
pub struct ReferenceValueAction {
    name: String,
    description: String,
    channel: Channel,
    field: String,
}

impl ReferenceValueAction {
    /// `field` is both the payload key and the quantity measured, e.g. `temperature`.
    pub fn new(channel: Channel, field: &str) -> Self {
        Self {
            name: vial_action("measure", channel, field),
            description: format!("Enter the measured {field} of vial {channel}"),
            channel,
            field: field.to_owned(),
        }
    }
}

impl CalibrationAction for ReferenceValueAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> PayloadSchema {
        PayloadSchema::empty().required_number(&self.field, &self.description)
    }

    fn execute(
        &self,
        state: &ProcedureState,
        payload: &Payload,
        _ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let value = payload.require_number(&self.field)?;
        let mut next = state.clone();
        next.measurement_mut(self.channel).reference.push(value);
        Ok(next)
    }
}

/// Reads the device `num_readings` times and records the median for one vial.
#[derive(Debug, Clone)]
pub struct RawValueAction {
    name: String,
    description: String,
    channel: Channel,
    num_readings: usize,
}

impl RawValueAction {
    pub fn new(channel: Channel, num_readings: usize) -> Self {
        Self {
            name: vial_action("read", channel, "raw_output"),
            description: format!("Read the raw sensor output of vial {channel}"),
            channel,
            num_readings: num_readings.max(1),
        }
    }
}

impl CalibrationAction for RawValueAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute(
        &self,
        state: &ProcedureState,
        _payload: &Payload,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let device = ctx.hardware.name().to_owned();
        let sensor = ctx
            .hardware
            .as_sensor()
            .ok_or_else(|| CalibrationError::Hardware(format!("{device} is not a sensor")))?;

        let mut readings = Vec::with_capacity(self.num_readings);
        for _ in 0..self.num_readings {
            let frame = sensor.read().map_err(|e| map_hw_error(e.as_ref()))?;
            let value = frame.get(self.channel).copied().ok_or_else(|| {
                CalibrationError::Hardware(format!(
                    "{device} returned {} channels, vial {} missing",
                    frame.len(),
                    self.channel
                ))
            })?;
            readings.push(value);
        }
        let value = median(&readings).ok_or_else(|| CalibrationError::Hardware("no readings".into()))?;
        tracing::debug!(device = %device, channel = self.channel, value, "raw value recorded");

        let mut next = state.clone();
        next.measurement_mut(self.channel).raw.push(value);
        Ok(next)
    }
}

/// How measured pairs map onto a transformer's x and y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// x = reference, y = raw (sensor outputs: physical value to counts).
    ReferenceToRaw,
    /// x = raw, y = reference (pumps: run time to volume).
    RawToReference,
}

impl Orientation {
    pub fn pairs(self, m: &Measurement) -> (&[f64], &[f64]) {
        match self {
            Self::ReferenceToRaw => (&m.reference, &m.raw),
            Self::RawToReference => (&m.raw, &m.reference),
        }
    }

    /// Concatenate the pairs of every channel for one shared transformer.
    ///
    /// Channels with different reference and raw counts are left out and
    /// reported in `misaligned`.
    pub fn pool(self, measured: &BTreeMap<Channel, Measurement>) -> Pooled {
        let mut pooled = Pooled::default();
        for (ch, m) in measured {
            let (x, y) = self.pairs(m);
            if x.len() != y.len() {
                pooled.misaligned.push((
                    *ch,
                    CalibrationError::Fit {
                        channel: Some(*ch),
                        samples: x.len().min(y.len()),
                        reason: format!(
                            "{} reference values but {} raw readings",
                            m.reference.len(),
                            m.raw.len()
                        ),
                    },
                ));
                continue;
            }
            pooled.x.extend_from_slice(x);
            pooled.y.extend_from_slice(y);
            pooled.channels.push(*ch);
        }
        pooled
    }
}

/// Pairs of several channels pooled by [`Orientation::pool`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pooled {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Channels whose pairs are in `x` and `y`.
    pub channels: Vec<Channel>,
    pub misaligned: Vec<(Channel, CalibrationError)>,
}

/// Refits the calibrator's transformer for one vial from the collected pairs
/// and records the new parameters in `fitted`.
#[derive(Debug, Clone)]
pub struct CalculateFitAction {
    name: String,
    description: String,
    channel: Channel,
    side: SlotSide,
    orientation: Orientation,
}

impl CalculateFitAction {
    pub fn new(channel: Channel, side: SlotSide, orientation: Orientation) -> Self {
        Self {
            name: vial_action("calculate", channel, "fit"),
            description: format!("Fit the calibration curve of vial {channel}"),
            channel,
            side,
            orientation,
        }
    }
}

impl CalibrationAction for CalculateFitAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute(
        &self,
        state: &ProcedureState,
        _payload: &Payload,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let transformer = ctx
            .transformers
            .slot_mut(self.side)
            .get_or_create(self.channel)
            .ok_or_else(|| {
                CalibrationError::Config(format!("calibrator has no {:?} transformer", self.side))
            })?;
        let empty = Measurement::default();
        let m = state.measured.get(&self.channel).unwrap_or(&empty);
        let (x, y) = self.orientation.pairs(m);
        let params = transformer
            .refit(x, y)
            .map_err(|e| e.on_channel(self.channel))?;

        let mut next = state.clone();
        next.fitted.insert(self.channel, params);
        Ok(next)
    }
}

/// Refits the single transformer shared by all vials from every vial's pairs.
#[derive(Debug, Clone)]
pub struct CalculatePooledFitAction {
    side: SlotSide,
    orientation: Orientation,
}

impl CalculatePooledFitAction {
    pub fn new(side: SlotSide, orientation: Orientation) -> Self {
        Self { side, orientation }
    }
}

impl CalibrationAction for CalculatePooledFitAction {
    fn name(&self) -> &str {
        "calculate_fit"
    }

    fn description(&self) -> &str {
        "Fit one calibration curve to the pairs of every vial"
    }

    fn execute(
        &self,
        state: &ProcedureState,
        _payload: &Payload,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        let TransformerSlot::Single(transformer) = ctx.transformers.slot_mut(self.side) else {
            return Err(CalibrationError::Config(format!(
                "pooled fit needs a single {:?} transformer",
                self.side
            )));
        };
        let pooled = self.orientation.pool(&state.measured);
        if let Some((_, e)) = pooled.misaligned.into_iter().next() {
            return Err(e);
        }
        let params = transformer.refit(&pooled.x, &pooled.y)?;

        let mut next = state.clone();
        for ch in pooled.channels {
            next.fitted.insert(ch, params.clone());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(reference: &[f64], raw: &[f64]) -> Measurement {
        Measurement {
            reference: reference.to_vec(),
            raw: raw.to_vec(),
        }
    }

    #[test]
    fn pool_skips_channels_that_cannot_be_paired() {
        let measured = BTreeMap::from([
            (0, measurement(&[10.0, 20.0], &[100.0])),
            (1, measurement(&[30.0], &[300.0])),
            (2, measurement(&[40.0], &[400.0, 200.0])),
        ]);
        let pooled = Orientation::ReferenceToRaw.pool(&measured);
        assert_eq!(pooled.x, vec![30.0]);
        assert_eq!(pooled.y, vec![300.0]);
        assert_eq!(pooled.channels, vec![1]);
        let bad: Vec<Channel> = pooled.misaligned.iter().map(|(ch, _)| *ch).collect();
        assert_eq!(bad, vec![0, 2]);
        assert!(matches!(
            pooled.misaligned[0].1,
            CalibrationError::Fit { channel: Some(0), .. }
        ));
    }

    #[test]
    fn raw_to_reference_swaps_axes() {
        let measured = BTreeMap::from([(3, measurement(&[5.0], &[50.0]))]);
        let pooled = Orientation::RawToReference.pool(&measured);
        assert_eq!((pooled.x, pooled.y), (vec![50.0], vec![5.0]));
    }
}
