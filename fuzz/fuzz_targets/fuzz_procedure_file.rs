#![no_main]
use libfuzzer_sys::fuzz_target;

use evolver_core::{CalibrationData, ProcedureFile};

fuzz_target!(|data: &str| {
    // Saved files are user-editable YAML; loading must fail cleanly.
    if let Ok(file) = serde_yaml::from_str::<ProcedureFile>(data) {
        let _ = serde_yaml::to_string(&file);
    }
    if let Ok(cal) = serde_yaml::from_str::<CalibrationData>(data) {
        let _ = serde_json::to_value(&cal);
    }
});
