//! Calibrator: owns the transformers of one piece of hardware, runs its
//! calibration procedure, and persists fitted parameters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use evolver_traits::{Clock, Hardware, HistorySink, NullHistory, SystemClock};

use crate::Channel;
use crate::action::{ActionContext, ActionInfo};
use crate::actions::Orientation;
use crate::config::{CalibratorConfig, CalibratorKind, Layout};
use crate::error::{CalibrationError, Result};
use crate::procedure::{CalibrationProcedure, Phase};
use crate::slot::{SlotParameters, SlotSide, TransformerSlot, Transformers};
use crate::state::{Measurement, ProcedureFile, ProcedureState};
use crate::status::CalibratorStatus;
use crate::transformer::{TransformerFactory, TransformerParameters};
use crate::util::{de_channel_map, load_yaml, save_yaml};

/// Contents of a calibration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    #[serde(default, deserialize_with = "de_channel_map")]
    pub measured: BTreeMap<Channel, Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<SlotParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<SlotParameters>,
}

/// Result of a query that needs an active procedure.
///
/// `NotStarted` serializes as `{"started": false}` so clients can poll
/// without handling an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    NotStarted,
    Done(T),
}

impl<T> Outcome<T> {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::NotStarted => None,
            Self::Done(v) => Some(v),
        }
    }
}

impl<T: Serialize> Serialize for Outcome<T> {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::NotStarted => {
                let mut m = s.serialize_map(Some(1))?;
                m.serialize_entry("started", &false)?;
                m.end()
            }
            Self::Done(v) => v.serialize(s),
        }
    }
}

/// Client-facing view of the active procedure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureView {
    pub procedure: String,
    pub hardware: String,
    pub phase: Phase,
    pub selected_channels: Vec<Channel>,
    #[serde(flatten)]
    pub state: ProcedureState,
}

impl ProcedureView {
    fn of(p: &CalibrationProcedure) -> Self {
        Self {
            procedure: p.name().to_owned(),
            hardware: p.hardware().to_owned(),
            phase: p.phase(),
            selected_channels: p.channels().to_vec(),
            state: p.state().clone(),
        }
    }
}

/// Per-channel result of `apply`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub fitted: BTreeMap<Channel, TransformerParameters>,
    #[serde(serialize_with = "errors_as_strings")]
    pub failed: BTreeMap<Channel, CalibrationError>,
    /// Calibration file written, if any channel was fitted.
    pub calibration_file: Option<PathBuf>,
}

fn errors_as_strings<S: Serializer>(
    failed: &BTreeMap<Channel, CalibrationError>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut m = s.serialize_map(Some(failed.len()))?;
    for (ch, e) in failed {
        m.serialize_entry(ch, &e.to_string())?;
    }
    m.end()
}

pub struct Calibrator {
    name: String,
    kind: CalibratorKind,
    config: CalibratorConfig,
    transformers: Transformers,
    data: CalibrationData,
    procedure: Option<CalibrationProcedure>,
    history: Arc<dyn HistorySink>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for Calibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calibrator")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("transformers", &self.transformers)
            .field("procedure", &self.procedure)
            .finish_non_exhaustive()
    }
}

/// Builder for `Calibrator`. Factories override the kind's default
/// transformers; useful for injecting custom `Transformer` implementations.
pub struct CalibratorBuilder {
    name: String,
    kind: CalibratorKind,
    config: CalibratorConfig,
    input_factory: Option<TransformerFactory>,
    output_factory: Option<TransformerFactory>,
    history: Option<Arc<dyn HistorySink>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
}

impl CalibratorBuilder {
    #[must_use]
    pub fn config(mut self, config: CalibratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn input_factory(mut self, factory: TransformerFactory) -> Self {
        self.input_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn output_factory(mut self, factory: TransformerFactory) -> Self {
        self.output_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn slot(&self, side: SlotSide) -> Result<TransformerSlot> {
        let (override_factory, configured) = match side {
            SlotSide::Input => (&self.input_factory, &self.config.input_transformer),
            SlotSide::Output => (&self.output_factory, &self.config.output_transformer),
        };
        let factory = match (override_factory, configured) {
            (Some(f), _) => Arc::clone(f),
            (None, Some(spec)) => spec.factory()?,
            (None, None) => match self.kind.default_transformer(side) {
                Some(spec) => spec.factory()?,
                None => return Ok(TransformerSlot::Empty),
            },
        };
        Ok(match self.kind.layout() {
            Layout::Single => TransformerSlot::Single(factory()),
            Layout::PerChannel => TransformerSlot::per_channel(factory),
        })
    }

    /// Build the calibrator and load its calibration file if one exists.
    pub fn build(self) -> Result<Calibrator> {
        if self.config.num_readings == 0 {
            return Err(CalibrationError::Config("num_readings must be >= 1".into()));
        }
        let transformers = Transformers {
            input: self.slot(SlotSide::Input)?,
            output: self.slot(SlotSide::Output)?,
        };
        let mut cal = Calibrator {
            name: self.name,
            kind: self.kind,
            config: self.config,
            transformers,
            data: CalibrationData::default(),
            procedure: None,
            history: self.history.unwrap_or_else(|| Arc::new(NullHistory)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        if let Some(path) = cal.config.calibration_file.clone()
            && let Some(data) = load_yaml::<CalibrationData>(&path)?
        {
            cal.load_calibration(data)?;
            tracing::info!(calibrator = %cal.name, path = %path.display(), "calibration loaded");
        }
        Ok(cal)
    }
}

impl Calibrator {
    pub fn builder(name: impl Into<String>, kind: CalibratorKind) -> CalibratorBuilder {
        CalibratorBuilder {
            name: name.into(),
            kind,
            config: CalibratorConfig::default(),
            input_factory: None,
            output_factory: None,
            history: None,
            clock: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CalibratorKind {
        self.kind
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    pub fn transformers(&self) -> &Transformers {
        &self.transformers
    }

    pub fn calibration_data(&self) -> &CalibrationData {
        &self.data
    }

    pub fn procedure(&self) -> Option<&CalibrationProcedure> {
        self.procedure.as_ref()
    }

    /// Install calibration data. Stored parameters are used as-is; a slot
    /// without stored parameters is refitted from `measured` when this kind
    /// fits that slot. Refit failures leave the channel uncalibrated.
    pub fn load_calibration(&mut self, data: CalibrationData) -> Result<()> {
        for side in [SlotSide::Input, SlotSide::Output] {
            let stored = match side {
                SlotSide::Input => data.input.clone(),
                SlotSide::Output => data.output.clone(),
            };
            let slot = self.transformers.slot_mut(side);
            if slot.is_empty() {
                continue;
            }
            if let Some(params) = stored {
                slot.restore(params)?;
                continue;
            }
            if let Some((fit_side, orientation)) = self.kind.fit_target()
                && fit_side == side
                && !data.measured.is_empty()
            {
                let report = fit_slot(slot, &data.measured, orientation);
                for (ch, e) in &report.failed {
                    tracing::warn!(calibrator = %self.name, channel = ch, error = %e, "stored measurements do not fit");
                }
            }
        }
        self.data = data;
        Ok(())
    }

    /// Read `calibration_file` again. Returns false when it does not exist.
    pub fn reload(&mut self) -> Result<bool> {
        let path = self.calibration_path()?;
        match load_yaml::<CalibrationData>(&path)? {
            Some(data) => {
                self.load_calibration(data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn calibration_path(&self) -> Result<PathBuf> {
        self.config
            .calibration_file
            .clone()
            .ok_or_else(|| CalibrationError::Config(format!("{}: calibration_file is not set", self.name)))
    }

    fn procedure_path(&self) -> Result<PathBuf> {
        self.config
            .procedure_file
            .clone()
            .ok_or_else(|| CalibrationError::Config(format!("{}: procedure_file is not set", self.name)))
    }

    fn new_procedure(&self, channels: Vec<Channel>) -> Result<CalibrationProcedure> {
        let mut p = CalibrationProcedure::new(self.kind.procedure_name(), &self.name, channels);
        for action in self.kind.actions(&self.config, p.channels()) {
            p.add_action(action)?;
        }
        Ok(p)
    }

    /// Create the procedure for `channels` (default: configured vials).
    ///
    /// With `resume`, the saved state in `procedure_file` is loaded instead of
    /// starting fresh; its channels are used when none are given.
    pub fn initialize_calibration_procedure(
        &mut self,
        channels: Option<Vec<Channel>>,
        resume: bool,
    ) -> Result<ProcedureView> {
        let procedure = if resume {
            let path = self.procedure_path()?;
            let file = ProcedureFile::load(&path)?;
            let channels = channels.unwrap_or_else(|| file.channels.clone());
            let mut p = self.new_procedure(channels)?;
            p.restore(file, &path)?;
            p
        } else {
            let channels = channels.unwrap_or_else(|| self.config.vials.clone());
            if channels.is_empty() {
                return Err(CalibrationError::Config(format!(
                    "{}: no vials selected for calibration",
                    self.name
                )));
            }
            let mut p = self.new_procedure(channels)?;
            p.start();
            p
        };
        let view = ProcedureView::of(&procedure);
        self.procedure = Some(procedure);
        Ok(view)
    }

    pub fn state(&self) -> Outcome<ProcedureView> {
        match &self.procedure {
            Some(p) => Outcome::Done(ProcedureView::of(p)),
            None => Outcome::NotStarted,
        }
    }

    pub fn actions(&self) -> Outcome<Vec<ActionInfo>> {
        match &self.procedure {
            Some(p) => Outcome::Done(p.catalog()),
            None => Outcome::NotStarted,
        }
    }

    pub fn dispatch(
        &mut self,
        action: &str,
        payload: &Value,
        hardware: &mut dyn Hardware,
    ) -> Result<Outcome<ProcedureView>> {
        let Some(procedure) = self.procedure.as_mut() else {
            return Ok(Outcome::NotStarted);
        };
        let mut ctx = ActionContext {
            hardware,
            transformers: &mut self.transformers,
        };
        procedure.dispatch(action, payload, &mut ctx)?;
        Ok(Outcome::Done(ProcedureView::of(procedure)))
    }

    pub fn undo(&mut self) -> Result<Outcome<ProcedureView>> {
        let Some(procedure) = self.procedure.as_mut() else {
            return Ok(Outcome::NotStarted);
        };
        procedure.undo()?;
        Ok(Outcome::Done(ProcedureView::of(procedure)))
    }

    /// Persist the active procedure to `procedure_file`.
    pub fn save(&self) -> Result<Outcome<ProcedureView>> {
        let Some(procedure) = self.procedure.as_ref() else {
            return Ok(Outcome::NotStarted);
        };
        procedure.save(&self.procedure_path()?)?;
        Ok(Outcome::Done(ProcedureView::of(procedure)))
    }

    /// Fit the kind's transformers from the procedure's measurements.
    ///
    /// Channels are fitted independently; see [`Calibrator::calibrate_from`].
    /// The procedure is only discarded when every channel succeeded.
    pub fn apply(&mut self) -> Result<Outcome<ApplyReport>> {
        let Some(procedure) = self.procedure.as_ref() else {
            return Ok(Outcome::NotStarted);
        };
        if self.kind.fit_target().is_none() {
            self.finish_procedure();
            return Ok(Outcome::Done(ApplyReport::default()));
        }
        let measured = procedure.state().measured.clone();
        if measured.is_empty() {
            return Err(CalibrationError::InsufficientData {
                channel: None,
                needed: 1,
                got: 0,
            });
        }

        let report = self.calibrate_from(&measured)?;
        if report.failed.is_empty() {
            self.finish_procedure();
        }
        Ok(Outcome::Done(report))
    }

    /// Fit the kind's transformers from `measured`, outside of a procedure.
    ///
    /// If at least one channel fits, the calibration file is written and a
    /// history record emitted. Failed channels keep their previous fit.
    pub fn calibrate_from(
        &mut self,
        measured: &BTreeMap<Channel, Measurement>,
    ) -> Result<ApplyReport> {
        let Some((side, orientation)) = self.kind.fit_target() else {
            return Err(CalibrationError::Config(format!(
                "{}: {} calibrators do not fit transformers",
                self.name, self.kind
            )));
        };
        let path = self.calibration_path()?;

        let slot = self.transformers.slot_mut(side);
        if slot.is_empty() {
            return Err(CalibrationError::Config(format!(
                "{}: no {side:?} transformer to fit",
                self.name
            )));
        }
        let mut report = fit_slot(slot, measured, orientation);
        for (ch, e) in &report.failed {
            tracing::warn!(calibrator = %self.name, channel = ch, error = %e, "channel fit failed");
        }

        if !report.fitted.is_empty() {
            for ch in report.fitted.keys() {
                if let Some(m) = measured.get(ch) {
                    self.data.measured.insert(*ch, m.clone());
                }
            }
            let snapshot = self.transformers.slot(side).snapshot();
            match side {
                SlotSide::Input => self.data.input = snapshot,
                SlotSide::Output => self.data.output = snapshot,
            }
            save_yaml(&path, &self.data)?;
            report.calibration_file = Some(path.clone());
            self.record_history(&report);
            tracing::info!(
                calibrator = %self.name,
                fitted = report.fitted.len(),
                failed = report.failed.len(),
                path = %path.display(),
                "calibration applied"
            );
        }
        Ok(report)
    }

    fn record_history(&self, report: &ApplyReport) {
        let data = serde_json::json!({
            "kind": self.kind,
            "report": report,
            "calibration": &self.data,
        });
        if let Err(e) = self.history.put(&self.name, "calibration", data) {
            tracing::warn!(calibrator = %self.name, error = %e, "history record failed");
        }
    }

    /// Drop the active procedure and its saved file.
    fn finish_procedure(&mut self) {
        self.procedure = None;
        if let Some(path) = &self.config.procedure_file {
            remove_if_exists(path, &self.name);
        }
    }

    pub fn status(&self) -> CalibratorStatus {
        let now = self.clock.now();
        CalibratorStatus::new(
            self.transformers.input.status_at(now),
            self.transformers.output.status_at(now),
        )
    }

    /// Every present transformer is fitted.
    pub fn is_calibrated(&self) -> bool {
        self.transformers.input.is_fitted() && self.transformers.output.is_fitted()
    }

    /// Device reading to physical value. Uncalibrated channels pass through.
    pub fn convert_output(&self, channel: Channel, raw: f64) -> Result<f64> {
        convert_through(&self.transformers.output, channel, raw)
    }

    /// Physical value to device command. Uncalibrated channels pass through.
    pub fn convert_input(&self, channel: Channel, value: f64) -> Result<f64> {
        convert_through(&self.transformers.input, channel, value)
    }
}

fn convert_through(slot: &TransformerSlot, channel: Channel, value: f64) -> Result<f64> {
    match slot.get(channel) {
        Some(t) if t.parameters().is_some() => t.convert_from(value),
        _ => Ok(value),
    }
}

fn remove_if_exists(path: &Path, name: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(calibrator = %name, path = %path.display(), error = %e, "could not remove procedure file");
        }
    }
}

/// Refit a slot from measurements. Per-channel slots fit each channel on its
/// own; a single transformer is fitted once on the pooled pairs.
fn fit_slot(
    slot: &mut TransformerSlot,
    measured: &BTreeMap<Channel, Measurement>,
    orientation: Orientation,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    match slot {
        TransformerSlot::Empty => {}
        TransformerSlot::Single(t) => {
            let pooled = orientation.pool(measured);
            report.failed.extend(pooled.misaligned);
            if pooled.channels.is_empty() {
                return report;
            }
            match t.refit(&pooled.x, &pooled.y) {
                Ok(p) => {
                    for ch in pooled.channels {
                        report.fitted.insert(ch, p.clone());
                    }
                }
                Err(e) => {
                    for ch in pooled.channels {
                        report.failed.insert(ch, e.clone().on_channel(ch));
                    }
                }
            }
        }
        TransformerSlot::PerChannel {
            factory,
            by_channel,
        } => {
            for (ch, m) in measured {
                let t = by_channel.entry(*ch).or_insert_with(|| factory());
                let (x, y) = orientation.pairs(m);
                match t.refit(x, y) {
                    Ok(p) => {
                        report.fitted.insert(*ch, p);
                    }
                    Err(e) => {
                        report.failed.insert(*ch, e.on_channel(*ch));
                    }
                }
            }
        }
    }
    report
}
