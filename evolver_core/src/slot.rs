//! Transformer slots owned by a calibrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Channel;
use crate::error::{CalibrationError, Result};
use crate::status::SlotStatus;
use crate::transformer::{Transformer, TransformerFactory, TransformerParameters};
use crate::util::de_channel_map;

/// Which side of the device a transformer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotSide {
    /// Physical value to device command (e.g. volume to pump seconds).
    Input,
    /// Device reading to physical value (e.g. raw counts to degrees).
    Output,
}

/// Zero, one, or one-per-channel transformers.
pub enum TransformerSlot {
    Empty,
    Single(Box<dyn Transformer>),
    PerChannel {
        factory: TransformerFactory,
        by_channel: BTreeMap<Channel, Box<dyn Transformer>>,
    },
}

impl fmt::Debug for TransformerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Single(t) => f.debug_tuple("Single").field(t).finish(),
            Self::PerChannel { by_channel, .. } => {
                f.debug_struct("PerChannel").field("by_channel", by_channel).finish()
            }
        }
    }
}

impl TransformerSlot {
    pub fn per_channel(factory: TransformerFactory) -> Self {
        Self::PerChannel {
            factory,
            by_channel: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Transformer serving `channel`, if one exists.
    pub fn get(&self, channel: Channel) -> Option<&dyn Transformer> {
        match self {
            Self::Empty => None,
            Self::Single(t) => Some(t.as_ref()),
            Self::PerChannel { by_channel, .. } => by_channel.get(&channel).map(AsRef::as_ref),
        }
    }

    /// Transformer serving `channel`, created from the factory on first use.
    pub fn get_or_create(&mut self, channel: Channel) -> Option<&mut dyn Transformer> {
        match self {
            Self::Empty => None,
            Self::Single(t) => Some(t.as_mut()),
            Self::PerChannel {
                factory,
                by_channel,
            } => Some(by_channel.entry(channel).or_insert_with(|| factory()).as_mut()),
        }
    }

    /// Install persisted parameters.
    pub fn restore(&mut self, params: SlotParameters) -> Result<()> {
        match (self, params) {
            (Self::Single(t), SlotParameters::Single(p)) => t.set_parameters(p),
            (
                Self::PerChannel {
                    factory,
                    by_channel,
                },
                SlotParameters::PerChannel(map),
            ) => {
                for (ch, p) in map {
                    let mut t = factory();
                    t.set_parameters(p)?;
                    by_channel.insert(ch, t);
                }
                Ok(())
            }
            _ => Err(CalibrationError::InvalidParameters(
                "stored parameters do not match the transformer layout".into(),
            )),
        }
    }

    /// Current parameters in persistable form; `None` if nothing is fitted.
    pub fn snapshot(&self) -> Option<SlotParameters> {
        match self {
            Self::Empty => None,
            Self::Single(t) => t.parameters().cloned().map(SlotParameters::Single),
            Self::PerChannel { by_channel, .. } => {
                let map: BTreeMap<Channel, TransformerParameters> = by_channel
                    .iter()
                    .filter_map(|(ch, t)| t.parameters().cloned().map(|p| (*ch, p)))
                    .collect();
                (!map.is_empty()).then_some(SlotParameters::PerChannel(map))
            }
        }
    }

    /// `None` for an empty slot.
    pub fn status_at(&self, now: DateTime<Utc>) -> Option<SlotStatus> {
        match self {
            Self::Empty => None,
            Self::Single(t) => Some(SlotStatus::Single(t.status_at(now))),
            Self::PerChannel { by_channel, .. } => Some(SlotStatus::PerChannel(
                by_channel
                    .iter()
                    .map(|(ch, t)| (*ch, t.status_at(now)))
                    .collect(),
            )),
        }
    }

    /// Every present transformer has parameters.
    pub fn is_fitted(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Single(t) => t.parameters().is_some(),
            Self::PerChannel { by_channel, .. } => {
                by_channel.values().all(|t| t.parameters().is_some())
            }
        }
    }
}

/// Persisted parameters of one slot: a parameter set, or a map of them
/// keyed by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotParameters {
    Single(TransformerParameters),
    PerChannel(
        #[serde(deserialize_with = "de_channel_map")] BTreeMap<Channel, TransformerParameters>,
    ),
}

/// The input and output slots of a calibrator.
#[derive(Debug)]
pub struct Transformers {
    pub input: TransformerSlot,
    pub output: TransformerSlot,
}

impl Transformers {
    pub fn slot(&self, side: SlotSide) -> &TransformerSlot {
        match side {
            SlotSide::Input => &self.input,
            SlotSide::Output => &self.output,
        }
    }

    pub fn slot_mut(&mut self, side: SlotSide) -> &mut TransformerSlot {
        match side {
            SlotSide::Input => &mut self.input,
            SlotSide::Output => &mut self.output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::{FitKind, LinearTransformer, TransformerSpec};

    fn linear_slot() -> TransformerSlot {
        TransformerSlot::per_channel(TransformerSpec::new(FitKind::Linear).factory().unwrap())
    }

    #[test]
    fn per_channel_creates_on_demand() {
        let mut slot = linear_slot();
        assert!(slot.get(4).is_none());
        slot.get_or_create(4)
            .unwrap()
            .refit(&[0.0, 1.0], &[1.0, 3.0])
            .unwrap();
        assert!((slot.get(4).unwrap().convert_to(2.0).unwrap() - 5.0).abs() < 1e-9);
        assert!(slot.is_fitted());
    }

    #[test]
    fn snapshot_then_restore() {
        let mut slot = linear_slot();
        slot.get_or_create(1)
            .unwrap()
            .refit(&[0.0, 2.0], &[0.0, 4.0])
            .unwrap();
        let saved = slot.snapshot().unwrap();

        let mut fresh = linear_slot();
        fresh.restore(saved.clone()).unwrap();
        assert_eq!(fresh.snapshot(), Some(saved));
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let mut single = TransformerSlot::Single(Box::new(LinearTransformer::new()));
        let err = single.restore(SlotParameters::PerChannel(BTreeMap::new()));
        assert!(err.is_err());
        assert!(TransformerSlot::Empty.snapshot().is_none());
        assert!(TransformerSlot::Empty.status_at(Utc::now()).is_none());
    }

    #[test]
    fn unfitted_single_slot_reports_not_fitted() {
        let slot = TransformerSlot::Single(Box::new(LinearTransformer::new()));
        assert!(!slot.is_fitted());
        assert_eq!(slot.status_at(Utc::now()), Some(SlotStatus::Single(None)));
    }
}
