#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Calibration core (hardware-agnostic).
//!
//! This crate turns raw device readings into physical quantities and back.
//! All hardware interactions go through the `evolver_traits::Hardware`,
//! `Sensor` and `Effector` traits.
//!
//! ## Architecture
//!
//! - **Transformers**: fittable bidirectional mappings (`transformer` module)
//!   with linear, polynomial, sigmoid, rate and identity variants
//! - **Actions**: named procedure steps with validated JSON payloads (`action`, `actions`)
//! - **Procedure**: dispatch/undo/save/resume state machine (`procedure`)
//! - **Calibrator**: owns the transformers of one device, applies fits and
//!   persists them (`calibrator`)
//! - **Sessions**: per-hardware locking for concurrent callers (`session`)
//!
//! ## Direction convention
//!
//! `fit(x, y)` always yields parameters with `convert_to(x) ≈ y`. Output
//! transformers are fitted from physical reference (x) to raw reading (y), so
//! `convert_from` turns a reading into a physical value.

// Module declarations
pub mod action;
pub mod actions;
pub mod atomic;
pub mod calibrator;
pub mod config;
pub mod conversions;
pub mod error;
pub mod hw_error;
pub mod mocks;
pub mod payload;
pub mod procedure;
pub mod session;
pub mod slot;
pub mod state;
pub mod status;
pub mod transformer;
pub mod util;

/// Addressable calibration target: a vial index, pump id or sensor line.
pub type Channel = usize;

pub use action::{ActionContext, ActionInfo, CalibrationAction};
pub use calibrator::{
    ApplyReport, CalibrationData, Calibrator, CalibratorBuilder, Outcome, ProcedureView,
};
pub use config::{CalibratorConfig, CalibratorKind, DEFAULT_EXPIRE_S, Layout};
pub use error::{CalibrationError, Result, Violation};
pub use payload::{FieldKind, FieldSpec, Payload, PayloadSchema};
pub use procedure::{CalibrationProcedure, Phase};
pub use session::{CalibrationSession, SessionRegistry, SharedSession};
pub use slot::{SlotParameters, SlotSide, TransformerSlot, Transformers};
pub use state::{Measurement, ProcedureFile, ProcedureState};
pub use status::{CalibratorStatus, SlotStatus, Status};
pub use transformer::{
    FitKind, Transformer, TransformerFactory, TransformerParameters, TransformerSpec,
    build_transformer, transformer_from_parameters,
};
