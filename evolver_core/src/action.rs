//! The unit of work a calibration procedure is built from.

use serde::Serialize;

use evolver_traits::Hardware;

use crate::Channel;
use crate::error::Result;
use crate::payload::{Payload, PayloadSchema};
use crate::slot::Transformers;
use crate::state::ProcedureState;

/// What an action may touch while it runs.
pub struct ActionContext<'a> {
    pub hardware: &'a mut dyn Hardware,
    pub transformers: &'a mut Transformers,
}

/// A named, stateless step of a procedure.
///
/// `execute` receives the current state and returns the next one; it never
/// mutates the input. The procedure records history and completion.
pub trait CalibrationAction: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schema(&self) -> PayloadSchema {
        PayloadSchema::empty()
    }

    fn execute(
        &self,
        state: &ProcedureState,
        payload: &Payload,
        ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState>;
}

/// Catalog entry describing an action to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub description: String,
    pub payload: PayloadSchema,
}

impl ActionInfo {
    pub fn of(action: &dyn CalibrationAction) -> Self {
        Self {
            name: action.name().to_owned(),
            description: action.description().to_owned(),
            payload: action.schema(),
        }
    }
}

/// Shows an instruction to the operator; the state passes through unchanged.
#[derive(Debug, Clone)]
pub struct DisplayInstructionAction {
    name: String,
    description: String,
}

impl DisplayInstructionAction {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl CalibrationAction for DisplayInstructionAction {
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
        _ctx: &mut ActionContext<'_>,
    ) -> Result<ProcedureState> {
        Ok(state.clone())
    }
}

/// Name helper shared by the per-vial actions.
pub(crate) fn vial_action(verb: &str, channel: Channel, what: &str) -> String {
    format!("{verb}_vial_{channel}_{what}")
}
