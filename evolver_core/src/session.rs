//! Per-hardware calibration sessions.
//!
//! Each session pairs a calibrator with its hardware handle behind a mutex,
//! so every state transition of one procedure is serialized while sessions
//! of different hardware proceed independently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use evolver_traits::Hardware;

use crate::Channel;
use crate::calibrator::{ApplyReport, Calibrator, Outcome, ProcedureView};
use crate::error::{CalibrationError, Result};

pub struct CalibrationSession {
    calibrator: Calibrator,
    hardware: Box<dyn Hardware + Send>,
}

impl std::fmt::Debug for CalibrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationSession")
            .field("calibrator", &self.calibrator)
            .field("hardware", &self.hardware.name())
            .finish()
    }
}

impl CalibrationSession {
    pub fn new(calibrator: Calibrator, hardware: Box<dyn Hardware + Send>) -> Self {
        Self {
            calibrator,
            hardware,
        }
    }

    pub fn name(&self) -> &str {
        self.calibrator.name()
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn calibrator_mut(&mut self) -> &mut Calibrator {
        &mut self.calibrator
    }

    pub fn hardware_mut(&mut self) -> &mut dyn Hardware {
        self.hardware.as_mut()
    }

    /// Start (or resume) the procedure. Channels default to the configured
    /// vials; explicitly requested channels must exist on the hardware.
    pub fn start(&mut self, channels: Option<Vec<Channel>>, resume: bool) -> Result<ProcedureView> {
        if let Some(chs) = &channels {
            let available = self.hardware.channels();
            if let Some(bad) = chs.iter().find(|c| !available.contains(c)) {
                return Err(CalibrationError::Config(format!(
                    "{} has no channel {bad}",
                    self.hardware.name()
                )));
            }
        }
        self.calibrator.initialize_calibration_procedure(channels, resume)
    }

    pub fn dispatch(&mut self, action: &str, payload: &Value) -> Result<Outcome<ProcedureView>> {
        self.calibrator
            .dispatch(action, payload, self.hardware.as_mut())
    }

    pub fn undo(&mut self) -> Result<Outcome<ProcedureView>> {
        self.calibrator.undo()
    }

    pub fn save(&mut self) -> Result<Outcome<ProcedureView>> {
        self.calibrator.save()
    }

    pub fn apply(&mut self) -> Result<Outcome<ApplyReport>> {
        self.calibrator.apply()
    }
}

pub type SharedSession = Arc<Mutex<CalibrationSession>>;

/// Sessions keyed by hardware name.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<String, SharedSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: CalibrationSession) -> Result<SharedSession> {
        let name = session.name().to_owned();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| CalibrationError::State("session registry poisoned".into()))?;
        if sessions.contains_key(&name) {
            return Err(CalibrationError::Config(format!(
                "hardware '{name}' is already registered"
            )));
        }
        let shared = Arc::new(Mutex::new(session));
        sessions.insert(name, Arc::clone(&shared));
        Ok(shared)
    }

    pub fn get(&self, name: &str) -> Result<SharedSession> {
        self.sessions
            .read()
            .map_err(|_| CalibrationError::State("session registry poisoned".into()))?
            .get(name)
            .cloned()
            .ok_or_else(|| CalibrationError::UnknownHardware(name.to_owned()))
    }

    pub fn names(&self) -> Vec<String> {
        self.sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` with exclusive access to the named session.
    pub fn with_session<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut CalibrationSession) -> Result<R>,
    ) -> Result<R> {
        let shared = self.get(name)?;
        let mut session = shared
            .lock()
            .map_err(|_| CalibrationError::State(format!("session '{name}' poisoned")))?;
        f(&mut session)
    }
}
