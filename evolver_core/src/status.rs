//! Freshness of fitted parameters, derived on every access.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::Channel;

/// Age and expiry of one set of transformer parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub created: DateTime<Utc>,
    /// Lifetime in seconds; `None` never expires.
    pub expire: Option<u64>,
    /// Seconds since `created` at the time of the query.
    pub age: f64,
    pub ok: bool,
}

impl Status {
    pub fn compute(created: DateTime<Utc>, expire: Option<u64>, now: DateTime<Utc>) -> Self {
        let age = now.signed_duration_since(created).max(Duration::zero());
        let age_s = age.num_milliseconds() as f64 / 1000.0;
        let ok = match expire {
            None => true,
            Some(limit) => age.num_seconds() <= i64::try_from(limit).unwrap_or(i64::MAX),
        };
        Self {
            created,
            expire,
            age: age_s,
            ok,
        }
    }
}

/// Status of one transformer slot of a calibrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SlotStatus {
    /// `None` when the transformer has never been fitted.
    Single(Option<Status>),
    PerChannel(BTreeMap<Channel, Option<Status>>),
}

impl SlotStatus {
    /// Every transformer in the slot is fitted and fresh.
    pub fn ok(&self) -> bool {
        match self {
            Self::Single(s) => s.as_ref().is_some_and(|s| s.ok),
            Self::PerChannel(map) => map.values().all(|s| s.as_ref().is_some_and(|s| s.ok)),
        }
    }
}

/// Aggregate status reported by `Calibrator::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibratorStatus {
    pub input_transformer: Option<SlotStatus>,
    pub output_transformer: Option<SlotStatus>,
    pub ok: bool,
}

impl CalibratorStatus {
    pub fn new(input: Option<SlotStatus>, output: Option<SlotStatus>) -> Self {
        let ok = input.as_ref().is_none_or(SlotStatus::ok)
            && output.as_ref().is_none_or(SlotStatus::ok);
        Self {
            input_transformer: input,
            output_transformer: output,
            ok,
        }
    }
}
