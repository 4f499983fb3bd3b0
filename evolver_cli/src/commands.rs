//! Command execution: builds sessions from the config and runs one command.
//!
//! Every invocation is a fresh process, so the active procedure lives in
//! `procedure_file` between calls: it is resumed on open and saved again after
//! each command that changes it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::{Value, json};

use evolver_config::{Config, DeviceKind, HardwareCfg};
use evolver_core::{
    CalibrationError, CalibrationSession, Calibrator, CalibratorConfig, CalibratorKind,
    SessionRegistry,
};
use evolver_hardware::{SimulatedPump, SimulatedSensor};
use evolver_traits::{BoxError, Hardware, HistorySink, Sensor};

use crate::cli::Commands;

/// Flow used for simulated pumps without `flow_ml_per_s`.
const DEFAULT_FLOW_ML_PER_S: f64 = 0.1;

/// Appends history records as JSON lines.
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl HistorySink for JsonlHistory {
    fn put(&self, name: &str, kind: &str, data: Value) -> std::result::Result<(), BoxError> {
        let _guard = self.lock.lock().map_err(|_| "history lock poisoned")?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = json!({ "name": name, "kind": kind, "data": data });
        writeln!(f, "{line}")?;
        Ok(())
    }
}

fn build_hardware(name: &str, hw: &HardwareCfg) -> Box<dyn Hardware + Send> {
    match hw.kind {
        DeviceKind::Temperature => Box::new(SimulatedSensor::temperature(name, hw.channels)),
        DeviceKind::Od => Box::new(SimulatedSensor::optical_density(name, hw.channels)),
        DeviceKind::Pump => {
            let flows = if hw.flow_ml_per_s.is_empty() {
                vec![DEFAULT_FLOW_ML_PER_S; hw.channels]
            } else {
                hw.flow_ml_per_s.clone()
            };
            Box::new(SimulatedPump::new(name, flows))
        }
    }
}

/// Build the session for hardware `name`, load its calibration file and resume
/// its saved procedure if there is one.
pub fn open_session(cfg: &Config, name: &str) -> Result<CalibrationSession> {
    let hw = cfg
        .hardware
        .get(name)
        .ok_or_else(|| CalibrationError::UnknownHardware(name.to_owned()))?;
    let cal_cfg = hw.calibrator.as_ref().ok_or_else(|| {
        CalibrationError::Config(format!("hardware.{name} has no [calibrator] section"))
    })?;

    let history: Arc<dyn HistorySink> =
        Arc::new(JsonlHistory::new(cfg.storage.dir.join("history.jsonl")));
    let config = CalibratorConfig::from_hardware(hw, cal_cfg, &cfg.storage);
    // build() loads calibration_file when it exists
    let calibrator = Calibrator::builder(name, CalibratorKind::from(cal_cfg.kind))
        .config(config)
        .history(history)
        .build()?;

    let resume = calibrator
        .config()
        .procedure_file
        .as_deref()
        .is_some_and(Path::exists);
    let mut session = CalibrationSession::new(calibrator, build_hardware(name, hw));
    if resume {
        session.start(None, true)?;
        tracing::debug!(hardware = name, "saved procedure resumed");
    }
    Ok(session)
}

/// Open every configured calibrator, skipping hardware without one.
pub fn open_registry(cfg: &Config) -> Result<SessionRegistry> {
    let registry = SessionRegistry::new();
    for (name, hw) in &cfg.hardware {
        if hw.calibrator.is_none() {
            tracing::debug!(hardware = %name, "no calibrator configured");
            continue;
        }
        let session = open_session(cfg, name).wrap_err_with(|| format!("open hardware '{name}'"))?;
        registry.register(session)?;
    }
    Ok(registry)
}

fn parse_payload(text: Option<&str>) -> Result<Value> {
    match text {
        None => Ok(Value::Null),
        Some(t) => serde_json::from_str(t).wrap_err("--payload is not valid JSON"),
    }
}

/// Run one command and return the value to print.
pub fn run(cfg: &Config, cmd: &Commands) -> Result<Value> {
    match cmd {
        Commands::Status { hardware: None } => {
            let registry = open_registry(cfg)?;
            let mut out = serde_json::Map::new();
            for name in registry.names() {
                let status = registry.with_session(&name, |s| Ok(s.calibrator().status()))?;
                out.insert(name, serde_json::to_value(status)?);
            }
            Ok(Value::Object(out))
        }
        Commands::Status {
            hardware: Some(name),
        } => to_json(&open_session(cfg, name)?.calibrator().status()),
        Commands::Actions { hardware } => to_json(&open_session(cfg, hardware)?.calibrator().actions()),
        Commands::State { hardware } => to_json(&open_session(cfg, hardware)?.calibrator().state()),
        Commands::Start {
            hardware,
            vials,
            resume,
        } => {
            let mut s = open_session(cfg, hardware)?;
            let view = s.start(vials.clone(), *resume)?;
            persist(&mut s, cmd)?;
            tracing::info!(hardware = %hardware, channels = ?view.selected_channels, "procedure started");
            to_json(&view)
        }
        Commands::Dispatch {
            hardware,
            action,
            payload,
        } => {
            let payload = parse_payload(payload.as_deref())?;
            let mut s = open_session(cfg, hardware)?;
            let out = s.dispatch(action, &payload)?;
            persist(&mut s, cmd)?;
            to_json(&out)
        }
        Commands::Undo { hardware } => {
            let mut s = open_session(cfg, hardware)?;
            let out = s.undo()?;
            persist(&mut s, cmd)?;
            to_json(&out)
        }
        Commands::Save { hardware } => to_json(&open_session(cfg, hardware)?.save()?),
        Commands::Apply { hardware } => {
            let mut s = open_session(cfg, hardware)?;
            let out = s.apply()?;
            persist(&mut s, cmd)?;
            to_json(&out)
        }
        Commands::Convert {
            hardware,
            channel,
            raw,
            value,
        } => {
            let s = open_session(cfg, hardware)?;
            let cal = s.calibrator();
            let converted = match (raw, value) {
                (Some(r), _) => json!({ "channel": channel, "raw": r, "value": cal.convert_output(*channel, *r)? }),
                (None, Some(v)) => json!({ "channel": channel, "value": v, "raw": cal.convert_input(*channel, *v)? }),
                (None, None) => eyre::bail!("convert needs --raw or --value"),
            };
            Ok(converted)
        }
        Commands::ImportCsv { hardware, file } => {
            let pairs = evolver_config::load_measurements_csv(file)?;
            let measured = evolver_core::conversions::measurements_from_pairs(pairs);
            let mut s = open_session(cfg, hardware)?;
            let report = s.calibrator_mut().calibrate_from(&measured)?;
            to_json(&report)
        }
        Commands::SelfCheck => self_check(cfg),
    }
}

/// Save the procedure after a command that changed it, if one is still active.
fn persist(s: &mut CalibrationSession, cmd: &Commands) -> Result<()> {
    if cmd.mutates_procedure() && s.calibrator().procedure().is_some() {
        s.save()?;
    }
    Ok(())
}

fn self_check(cfg: &Config) -> Result<Value> {
    let registry = open_registry(cfg)?;
    let mut out = serde_json::Map::new();
    for name in registry.names() {
        let entry = registry.with_session(&name, |s| {
            let readings = match s.hardware_mut().as_sensor() {
                Some(sensor) => Some(
                    sensor
                        .read()
                        .map_err(|e| CalibrationError::Hardware(e.to_string()))?
                        .len(),
                ),
                None => None,
            };
            let status = s.calibrator().status();
            Ok(json!({
                "kind": s.calibrator().kind(),
                "channels_read": readings,
                "calibrated": s.calibrator().is_calibrated(),
                "status_ok": status.ok,
            }))
        })?;
        out.insert(name, entry);
    }
    tracing::info!(calibrators = out.len(), "self-check ok");
    Ok(json!({ "ok": true, "calibrators": out }))
}

fn to_json<T: Serialize>(v: &T) -> Result<Value> {
    Ok(serde_json::to_value(v)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn jsonl_history_appends_one_line_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.jsonl");
        let sink = JsonlHistory::new(&path);
        sink.put("od", "calibration", json!({"a": 1})).unwrap();
        sink.put("od", "calibration", json!({"a": 2})).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["data"]["a"], 2);
        assert_eq!(lines[0]["kind"], "calibration");
    }

    #[test]
    fn simulated_pump_defaults_flow_per_channel() {
        let hw: HardwareCfg = toml::from_str("kind = \"pump\"\nchannels = 3").unwrap();
        let hardware = build_hardware("pump", &hw);
        assert_eq!(hardware.channels(), vec![0, 1, 2]);
    }

    #[test]
    fn payload_must_be_json() {
        assert_eq!(parse_payload(None).unwrap(), Value::Null);
        assert!(parse_payload(Some("{\"od\": 0.5}")).is_ok());
        assert!(parse_payload(Some("od=0.5")).is_err());
    }
}
