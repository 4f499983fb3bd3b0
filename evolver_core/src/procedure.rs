//! Calibration procedure state machine.
//!
//! A procedure is an ordered catalog of actions plus the state they build up.
//! `dispatch` runs one action and pushes the previous state onto `history`;
//! `undo` pops it back. Phases:
//!
//! - `NotStarted`: before `start`/`resume`; dispatch is rejected.
//! - `InProgress`: at least one registered action has not been dispatched.
//! - `Complete`: every registered action has been dispatched at least once.
//!   Further dispatches are rejected; `undo` re-enters `InProgress`.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::Channel;
use crate::action::{ActionContext, ActionInfo, CalibrationAction};
use crate::error::{CalibrationError, Result};
use crate::state::{ProcedureFile, ProcedureState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    InProgress,
    Complete,
}

pub struct CalibrationProcedure {
    name: String,
    hardware: String,
    channels: Vec<Channel>,
    actions: Vec<Box<dyn CalibrationAction>>,
    state: ProcedureState,
}

impl std::fmt::Debug for CalibrationProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationProcedure")
            .field("name", &self.name)
            .field("hardware", &self.hardware)
            .field("channels", &self.channels)
            .field("actions", &self.action_names())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl CalibrationProcedure {
    pub fn new(name: impl Into<String>, hardware: impl Into<String>, channels: Vec<Channel>) -> Self {
        Self {
            name: name.into(),
            hardware: hardware.into(),
            channels,
            actions: Vec::new(),
            state: ProcedureState::default(),
        }
    }

    /// Register an action. Names must be unique within the procedure.
    pub fn add_action(&mut self, action: Box<dyn CalibrationAction>) -> Result<()> {
        if self.get_action(action.name()).is_some() {
            return Err(CalibrationError::Config(format!(
                "duplicate action name: {}",
                action.name()
            )));
        }
        self.actions.push(action);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware(&self) -> &str {
        &self.hardware
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn state(&self) -> &ProcedureState {
        &self.state
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name().to_owned()).collect()
    }

    /// Catalog in registration order.
    pub fn catalog(&self) -> Vec<ActionInfo> {
        self.actions.iter().map(|a| ActionInfo::of(a.as_ref())).collect()
    }

    pub fn get_action(&self, name: &str) -> Option<&dyn CalibrationAction> {
        self.actions
            .iter()
            .find(|a| a.name() == name)
            .map(AsRef::as_ref)
    }

    pub fn phase(&self) -> Phase {
        if !self.state.started {
            return Phase::NotStarted;
        }
        let done: BTreeSet<&str> = self
            .state
            .completed_actions
            .iter()
            .map(String::as_str)
            .collect();
        if self.actions.iter().all(|a| done.contains(a.name())) {
            Phase::Complete
        } else {
            Phase::InProgress
        }
    }

    /// Reset to a fresh started state.
    pub fn start(&mut self) -> &ProcedureState {
        self.state = ProcedureState::started();
        tracing::info!(procedure = %self.name, hardware = %self.hardware, "procedure started");
        &self.state
    }

    /// Replace the state with the one saved at `path`.
    ///
    /// The saved procedure must have the same name, hardware and action
    /// catalog; otherwise the file belongs to a different procedure.
    pub fn resume(&mut self, path: &Path) -> Result<&ProcedureState> {
        let file = ProcedureFile::load(path)?;
        self.restore(file, path)
    }

    /// Adopt an already loaded procedure file; `path` is only used in errors.
    pub fn restore(&mut self, file: ProcedureFile, path: &Path) -> Result<&ProcedureState> {
        if file.procedure != self.name || file.hardware != self.hardware {
            return Err(CalibrationError::Storage(format!(
                "{} holds procedure '{}' for '{}', expected '{}' for '{}'",
                path.display(),
                file.procedure,
                file.hardware,
                self.name,
                self.hardware
            )));
        }
        if file.actions != self.action_names() {
            return Err(CalibrationError::Storage(format!(
                "{} was saved with a different action catalog",
                path.display()
            )));
        }
        self.channels = file.channels;
        self.state = file.state;
        self.state.started = true;
        tracing::info!(
            procedure = %self.name,
            hardware = %self.hardware,
            dispatched = self.state.history.len(),
            "procedure resumed"
        );
        Ok(&self.state)
    }

    /// Validate `payload`, run the action, and record the previous state.
    ///
    /// On any error the state is left untouched.
    pub fn dispatch(
        &mut self,
        name: &str,
        payload: &Value,
        ctx: &mut ActionContext<'_>,
    ) -> Result<&ProcedureState> {
        if !self.state.started {
            return Err(CalibrationError::ProcedureNotStarted);
        }
        let action = self
            .actions
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| CalibrationError::ActionNotFound(name.to_owned()))?;
        if self.phase() == Phase::Complete {
            return Err(CalibrationError::ProcedureComplete);
        }
        let payload = action.schema().validate(name, payload)?;

        // Actions see the state without its history; snapshots never nest.
        let mut history = std::mem::take(&mut self.state.history);
        let mut next = match action.execute(&self.state, &payload, ctx) {
            Ok(next) => next,
            Err(e) => {
                self.state.history = history;
                return Err(CalibrationError::ActionExecution {
                    action: name.to_owned(),
                    source: Box::new(e),
                });
            }
        };

        let previous = std::mem::take(&mut self.state);
        next.started = true;
        next.completed_actions = previous.completed_actions.clone();
        next.completed_actions.push(name.to_owned());
        history.push(previous);
        next.history = history;
        self.state = next;

        tracing::debug!(
            procedure = %self.name,
            action = name,
            history = self.state.history.len(),
            "action dispatched"
        );
        Ok(&self.state)
    }

    /// Restore the state from before the last dispatch.
    pub fn undo(&mut self) -> Result<&ProcedureState> {
        if !self.state.started {
            return Err(CalibrationError::ProcedureNotStarted);
        }
        let mut history = std::mem::take(&mut self.state.history);
        let Some(mut previous) = history.pop() else {
            return Err(CalibrationError::NothingToUndo);
        };
        previous.history = history;
        self.state = previous;
        tracing::debug!(
            procedure = %self.name,
            history = self.state.history.len(),
            "action undone"
        );
        Ok(&self.state)
    }

    pub fn to_file(&self) -> ProcedureFile {
        ProcedureFile {
            procedure: self.name.clone(),
            hardware: self.hardware.clone(),
            channels: self.channels.clone(),
            actions: self.action_names(),
            state: self.state.clone(),
        }
    }

    /// Persist atomically. The in-memory state is kept on failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        if !self.state.started {
            return Err(CalibrationError::ProcedureNotStarted);
        }
        self.to_file().save(path)?;
        tracing::info!(procedure = %self.name, path = %path.display(), "procedure saved");
        Ok(())
    }
}
