//! Human-readable error descriptions and structured JSON error formatting.

use evolver_core::CalibrationError;

/// Exit code for errors caused by the request (bad payload, wrong phase...).
pub const EXIT_CLIENT: i32 = 3;
/// Exit code for hardware faults and timeouts.
pub const EXIT_HARDWARE: i32 = 4;
/// Exit code for calibration/procedure file failures.
pub const EXIT_STORAGE: i32 = 5;

fn calibration_error(err: &eyre::Report) -> Option<&CalibrationError> {
    err.chain()
        .find_map(|e| e.downcast_ref::<CalibrationError>())
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(ce) = calibration_error(err) {
        return match ce.root() {
            CalibrationError::Validation { action, violations } => {
                let fields: Vec<String> = violations.iter().map(ToString::to_string).collect();
                format!(
                    "What happened: The payload for '{action}' was rejected ({}).\nLikely causes: A missing or misspelled field, or a value of the wrong type.\nHow to fix: Run `evolver actions <hardware>` to see the expected payload and pass it with --payload.",
                    fields.join("; ")
                )
            }
            CalibrationError::ActionNotFound(name) => format!(
                "What happened: The procedure has no action named '{name}'.\nLikely causes: A typo, or a vial that is not part of this procedure.\nHow to fix: Run `evolver actions <hardware>` to list the available actions."
            ),
            CalibrationError::ProcedureNotStarted => {
                "What happened: No calibration procedure is running.\nLikely causes: The procedure was never started or was already applied.\nHow to fix: Start one with `evolver start <hardware>`.".to_string()
            }
            CalibrationError::ProcedureComplete => {
                "What happened: Every action of the procedure has already been completed.\nLikely causes: The last measurement was recorded.\nHow to fix: Run `evolver apply <hardware>`, or `evolver undo <hardware>` to redo a step.".to_string()
            }
            CalibrationError::ProcedureNotFound(path) => format!(
                "What happened: No saved procedure at {}.\nLikely causes: It was never saved, or it was applied and removed.\nHow to fix: Start a new procedure without --resume.",
                path.display()
            ),
            CalibrationError::NothingToUndo => {
                "What happened: There is nothing to undo.\nLikely causes: No action has been dispatched since the procedure started.\nHow to fix: Dispatch an action first.".to_string()
            }
            CalibrationError::InsufficientData { .. } => format!(
                "What happened: {ce}.\nLikely causes: Too few measurements were recorded for the fit.\nHow to fix: Record more reference/raw pairs for the listed vials, then apply again."
            ),
            CalibrationError::Timeout => {
                "What happened: The hardware did not produce data in time.\nLikely causes: The device is disconnected, busy, or powered off.\nHow to fix: Check the connection and retry the action.".to_string()
            }
            CalibrationError::Hardware(msg) => format!(
                "What happened: Hardware error ({msg}).\nLikely causes: A device fault or a channel the device does not have.\nHow to fix: Check the device and the configured channels, then retry."
            ),
            CalibrationError::Storage(msg) => format!(
                "What happened: A calibration file could not be read or written ({msg}).\nLikely causes: Missing permissions, a full disk, or a corrupted file.\nHow to fix: Check [storage].dir and the calibration/procedure file paths in the config."
            ),
            CalibrationError::UnknownHardware(name) => format!(
                "What happened: No hardware named '{name}' is configured.\nLikely causes: A typo, or the [hardware.{name}] section is missing.\nHow to fix: Use one of the names under [hardware] in the config."
            ),
            CalibrationError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config or CSV import
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("measurement csv must have headers") {
        return "Invalid headers in measurement CSV. Expected 'channel,reference,raw'.".to_string();
    }

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass the path of an existing TOML file with --config. Original: {msg}"
        );
    }

    if lower.contains("invalid configuration") {
        let cause = err.source().map(|s| format!(" ({s})")).unwrap_or_default();
        return format!(
            "What happened: Configuration is invalid{cause}.\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: client errors 3, hardware 4, storage 5, anything else 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    let Some(ce) = calibration_error(err) else {
        return 1;
    };
    if ce.is_client_error() {
        return EXIT_CLIENT;
    }
    match ce.root() {
        CalibrationError::Hardware(_) | CalibrationError::Timeout => EXIT_HARDWARE,
        CalibrationError::Storage(_) => EXIT_STORAGE,
        _ => 1,
    }
}

/// Short machine-readable name of the error.
fn reason_name(err: &eyre::Report) -> &'static str {
    let Some(ce) = calibration_error(err) else {
        return "Error";
    };
    match ce.root() {
        CalibrationError::Validation { .. } => "Validation",
        CalibrationError::ActionNotFound(_) => "ActionNotFound",
        CalibrationError::ProcedureNotStarted => "ProcedureNotStarted",
        CalibrationError::ProcedureComplete => "ProcedureComplete",
        CalibrationError::ProcedureNotFound(_) => "ProcedureNotFound",
        CalibrationError::InsufficientData { .. } => "InsufficientData",
        CalibrationError::Fit { .. } => "Fit",
        CalibrationError::NoRealRoot(_) => "NoRealRoot",
        CalibrationError::NotFitted => "NotFitted",
        CalibrationError::InvalidParameters(_) => "InvalidParameters",
        CalibrationError::Hardware(_) => "Hardware",
        CalibrationError::Timeout => "Timeout",
        CalibrationError::ActionExecution { .. } => "ActionExecution",
        CalibrationError::Storage(_) => "Storage",
        CalibrationError::Config(_) => "Config",
        CalibrationError::NothingToUndo => "NothingToUndo",
        CalibrationError::UnknownHardware(_) => "UnknownHardware",
        CalibrationError::State(_) => "State",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({ "reason": reason_name(err), "message": humanize(err) });
    if let Some(CalibrationError::Validation { violations, .. }) = calibration_error(err).map(CalibrationError::root) {
        obj["violations"] = json!(violations
            .iter()
            .map(|v| json!({ "field": v.field, "message": v.message }))
            .collect::<Vec<_>>());
    }
    obj.to_string()
}
