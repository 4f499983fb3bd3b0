#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    let Ok(cfg) = evolver_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    // A valid hardware entry must always convert into runtime settings
    for hw in cfg.hardware.values() {
        if let Some(cal) = &hw.calibrator {
            let _ = evolver_core::CalibratorConfig::from_hardware(hw, cal, &cfg.storage);
        }
    }
});
