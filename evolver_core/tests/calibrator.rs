use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evolver_core::mocks::{FixedSensor, RecordingHistory};
use evolver_core::{
    CalibrationData, CalibrationError, Calibrator, CalibratorConfig, CalibratorKind, Channel,
    FitKind, Measurement, Outcome, Phase, SlotParameters, SlotStatus, Transformer, TransformerFactory,
    TransformerParameters, TransformerSpec,
};
use evolver_hardware::{SimulatedPump, SimulatedSensor};
use evolver_traits::clock::test_clock::TestClock;
use rstest::rstest;
use serde_json::json;
use tempfile::{TempDir, tempdir};

type Calls = Arc<Mutex<Vec<(Vec<f64>, Vec<f64>)>>>;

/// Proportional transformer that records every fit it is asked for.
#[derive(Debug, Default)]
struct RecordingTransformer {
    calls: Calls,
    parameters: Option<TransformerParameters>,
}

impl Transformer for RecordingTransformer {
    fn kind(&self) -> FitKind {
        FitKind::Rate
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        self.parameters.as_ref()
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> evolver_core::Result<()> {
        self.parameters = Some(parameters);
        Ok(())
    }

    fn convert_to(&self, x: f64) -> evolver_core::Result<f64> {
        let p = self.parameters.as_ref().ok_or(CalibrationError::NotFitted)?;
        Ok(p.coefficients()[0] * x)
    }

    fn convert_from(&self, y: f64) -> evolver_core::Result<f64> {
        let p = self.parameters.as_ref().ok_or(CalibrationError::NotFitted)?;
        Ok(y / p.coefficients()[0])
    }

    fn min_samples(&self) -> usize {
        1
    }

    fn fit(&self, x: &[f64], y: &[f64]) -> evolver_core::Result<TransformerParameters> {
        self.calls.lock().unwrap().push((x.to_vec(), y.to_vec()));
        TransformerParameters::new(FitKind::Rate, None, vec![y[0] / x[0]])
    }
}

fn recording_factory(calls: &Calls) -> TransformerFactory {
    let calls = Arc::clone(calls);
    Arc::new(move || {
        Box::new(RecordingTransformer {
            calls: Arc::clone(&calls),
            parameters: None,
        })
    })
}

fn files(dir: &TempDir, vials: Vec<Channel>) -> CalibratorConfig {
    CalibratorConfig {
        calibration_file: Some(dir.path().join("cal.yml")),
        procedure_file: Some(dir.path().join("proc.yml")),
        vials,
        ..CalibratorConfig::default()
    }
}

fn done<T>(o: Outcome<T>) -> T {
    o.into_option().expect("procedure should be active")
}

#[test]
fn temperature_scenario_with_fixed_readings() {
    let calls = Calls::default();
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(CalibratorConfig {
            vials: vec![0, 1, 2],
            ..CalibratorConfig::default()
        })
        .output_factory(recording_factory(&calls))
        .build()
        .unwrap();
    let mut hw = FixedSensor::new("temp", vec![1.23, 2.34, 3.45]);

    let view = cal.initialize_calibration_procedure(None, false).unwrap();
    assert_eq!(view.selected_channels, vec![0, 1, 2]);
    assert_eq!(view.phase, Phase::InProgress);

    let view = done(
        cal.dispatch("measure_vial_0_temperature", &json!({"temperature": 25.0}), &mut hw)
            .unwrap(),
    );
    assert_eq!(view.state.measured[&0].reference, vec![25.0]);

    let view = done(
        cal.dispatch("read_vial_0_raw_output", &json!(null), &mut hw)
            .unwrap(),
    );
    assert_eq!(view.state.measured[&0].raw, vec![1.23]);
    assert_eq!(
        view.state.completed_actions,
        vec!["measure_vial_0_temperature", "read_vial_0_raw_output"]
    );
    assert_eq!(view.state.history.len(), 2);

    let view = done(
        cal.dispatch("calculate_vial_0_fit", &json!(null), &mut hw)
            .unwrap(),
    );
    assert_eq!(*calls.lock().unwrap(), vec![(vec![25.0], vec![1.23])]);
    assert!(view.state.fitted.contains_key(&0));
    assert!(cal.transformers().output.get(0).unwrap().parameters().is_some());
}

#[test]
fn queries_without_procedure_report_not_started() {
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .build()
        .unwrap();
    let mut hw = FixedSensor::new("temp", vec![0.0]);

    assert_eq!(
        serde_json::to_value(cal.state()).unwrap(),
        json!({"started": false})
    );
    assert_eq!(
        serde_json::to_value(cal.actions()).unwrap(),
        json!({"started": false})
    );
    assert!(!cal.dispatch("anything", &json!(null), &mut hw).unwrap().is_started());
    assert!(!cal.undo().unwrap().is_started());
    assert!(!cal.save().unwrap().is_started());
    assert!(!cal.apply().unwrap().is_started());
}

#[test]
fn start_without_vials_is_a_config_error() {
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .build()
        .unwrap();
    assert!(matches!(
        cal.initialize_calibration_procedure(None, false),
        Err(CalibrationError::Config(_))
    ));
}

#[test]
fn apply_persists_fitted_channels_and_reports_failures() {
    let dir = tempdir().unwrap();
    let history = RecordingHistory::default();
    let config = files(&dir, vec![0, 1]);
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config.clone())
        .history(Arc::new(history.clone()))
        .build()
        .unwrap();
    let mut hw = SimulatedSensor::temperature("temp", 2);
    let sim = hw.handle();
    cal.initialize_calibration_procedure(None, false).unwrap();

    for t in [20.0, 30.0] {
        sim.set_physical(0, t);
        cal.dispatch("measure_vial_0_temperature", &json!({"temperature": t}), &mut hw)
            .unwrap();
        cal.dispatch("read_vial_0_raw_output", &json!({}), &mut hw)
            .unwrap();
    }
    cal.dispatch("measure_vial_1_temperature", &json!({"temperature": 25.0}), &mut hw)
        .unwrap();
    cal.dispatch("read_vial_1_raw_output", &json!({}), &mut hw)
        .unwrap();
    cal.save().unwrap();

    let report = done(cal.apply().unwrap());
    assert_eq!(report.fitted.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(
        report.failed[&1],
        CalibrationError::InsufficientData {
            channel: Some(1),
            needed: 2,
            got: 1
        }
    );
    let cal_file = config.calibration_file.clone().unwrap();
    assert_eq!(report.calibration_file.as_deref(), Some(cal_file.as_path()));
    // a failed channel keeps the procedure so it can be completed and reapplied
    assert!(cal.state().is_started());
    assert!(config.procedure_file.as_ref().unwrap().exists());

    let records = history.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "temp");
    assert_eq!(records[0].kind, "calibration");

    let reloaded = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .build()
        .unwrap();
    let raw_25 = 2500.0 - 50.0 * 25.0;
    assert!((reloaded.convert_output(0, raw_25).unwrap() - 25.0).abs() < 1e-9);
    // channel 1 was never fitted: readings pass through
    assert_eq!(reloaded.convert_output(1, raw_25).unwrap(), raw_25);
    assert!(reloaded.status().ok);
}

#[test]
fn successful_apply_discards_procedure() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0, 1]);
    let mut cal = Calibrator::builder("lin", CalibratorKind::Linear)
        .config(config.clone())
        .build()
        .unwrap();
    let mut hw = SimulatedSensor::temperature("lin", 2);
    let sim = hw.handle();
    cal.initialize_calibration_procedure(None, false).unwrap();
    for (ch, t) in [(0, 10.0), (1, 40.0)] {
        sim.set_physical(ch, t);
        cal.dispatch(&format!("measure_vial_{ch}_reference"), &json!({"reference": t}), &mut hw)
            .unwrap();
        cal.dispatch(&format!("read_vial_{ch}_raw_output"), &json!(null), &mut hw)
            .unwrap();
    }
    cal.dispatch("calculate_fit", &json!(null), &mut hw).unwrap();
    assert_eq!(done(cal.state()).phase, Phase::Complete);
    cal.save().unwrap();
    let proc_file = config.procedure_file.clone().unwrap();
    assert!(proc_file.exists());

    // one line pooled over both vials
    let report = done(cal.apply().unwrap());
    assert!(report.failed.is_empty());
    assert_eq!(report.fitted[&0], report.fitted[&1]);
    assert!(!cal.state().is_started());
    assert!(!proc_file.exists());
    assert!(config.calibration_file.unwrap().exists());
    assert!((cal.convert_output(1, 2500.0 - 50.0 * 40.0).unwrap() - 40.0).abs() < 1e-9);
}

#[test]
fn undone_measurements_are_not_applied() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(files(&dir, vec![0]))
        .build()
        .unwrap();
    let mut hw = FixedSensor::new("temp", vec![1500.0]);
    cal.initialize_calibration_procedure(None, false).unwrap();
    cal.dispatch("measure_vial_0_temperature", &json!({"temperature": 20.0}), &mut hw)
        .unwrap();
    cal.undo().unwrap();

    let err = cal.apply().unwrap_err();
    assert!(matches!(err, CalibrationError::InsufficientData { .. }), "{err:?}");
    assert!(cal.state().is_started());
}

#[test]
fn pump_procedure_fits_input_rate() {
    let dir = tempdir().unwrap();
    let config = CalibratorConfig {
        time_to_pump_fast: 5.0,
        time_to_pump_slow: 50.0,
        ..files(&dir, vec![0, 1])
    };
    let mut cal = Calibrator::builder("pump", CalibratorKind::Pump)
        .config(config)
        .build()
        .unwrap();
    let mut hw = SimulatedPump::new("pump", vec![0.1, 0.2]);
    let dispensed = hw.handle();
    cal.initialize_calibration_procedure(None, false).unwrap();

    let view = done(
        cal.dispatch("run_pumps", &json!({"use_fast_mode": false}), &mut hw)
            .unwrap(),
    );
    assert_eq!(view.state.extra["time_pumped"], 50.0);
    let volumes = dispensed.dispensed();
    for ch in [0, 1] {
        cal.dispatch(
            &format!("record_pump_{ch}_volume"),
            &json!({"volume": volumes[&ch]}),
            &mut hw,
        )
        .unwrap();
    }
    let report = done(cal.apply().unwrap());
    assert!(report.failed.is_empty());
    assert!(!cal.state().is_started());

    // 1 mL from pump 1 takes 5 s at 0.2 mL/s
    assert!((cal.convert_input(1, 1.0).unwrap() - 5.0).abs() < 1e-9);
    assert!((cal.convert_input(0, 1.0).unwrap() - 10.0).abs() < 1e-9);
}

#[test]
fn record_volume_needs_a_pump_run() {
    let mut cal = Calibrator::builder("pump", CalibratorKind::Pump)
        .config(CalibratorConfig {
            vials: vec![0],
            ..CalibratorConfig::default()
        })
        .build()
        .unwrap();
    let mut hw = SimulatedPump::new("pump", vec![0.1]);
    cal.initialize_calibration_procedure(None, false).unwrap();
    let err = cal
        .dispatch("record_pump_0_volume", &json!({"volume": 1.0}), &mut hw)
        .unwrap_err();
    let CalibrationError::ActionExecution { action, source } = err else {
        panic!("expected execution error");
    };
    assert_eq!(action, "record_pump_0_volume");
    assert!(matches!(*source, CalibrationError::State(_)));
    assert!(done(cal.state()).state.history.is_empty());
}

#[test]
fn sensor_timeout_fails_dispatch_without_mutation() {
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(CalibratorConfig {
            vials: vec![0],
            ..CalibratorConfig::default()
        })
        .build()
        .unwrap();
    let mut hw =
        SimulatedSensor::temperature("temp", 1).with_read_timeout(Duration::from_millis(5));
    hw.handle().set_data_ready(false);
    cal.initialize_calibration_procedure(None, false).unwrap();

    let err = cal
        .dispatch("read_vial_0_raw_output", &json!(null), &mut hw)
        .unwrap_err();
    assert_eq!(err.root(), &CalibrationError::Timeout);
    assert!(done(cal.state()).state.measured.is_empty());
}

#[test]
fn resume_continues_a_saved_procedure() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0, 1]);
    let mut hw = FixedSensor::new("temp", vec![1.0, 2.0]);

    let mut first = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config.clone())
        .build()
        .unwrap();
    first.initialize_calibration_procedure(Some(vec![1]), false).unwrap();
    first
        .dispatch("measure_vial_1_temperature", &json!({"temperature": 37.0}), &mut hw)
        .unwrap();
    first.save().unwrap();

    let mut second = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .build()
        .unwrap();
    let view = second.initialize_calibration_procedure(None, true).unwrap();
    assert_eq!(view.selected_channels, vec![1]);
    assert_eq!(view.state, done(first.state()).state);
    let names: Vec<String> = done(second.actions()).into_iter().map(|a| a.name).collect();
    assert!(names.contains(&"read_vial_1_raw_output".to_owned()));
    assert!(!names.contains(&"read_vial_0_raw_output".to_owned()));
}

#[test]
fn resume_without_saved_file_is_not_found() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(files(&dir, vec![0]))
        .build()
        .unwrap();
    assert!(matches!(
        cal.initialize_calibration_procedure(None, true),
        Err(CalibrationError::ProcedureNotFound(_))
    ));
}

fn write(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
}

#[rstest]
#[case::string_keys(r#"{"measured": {"0": {"reference": [20, 30], "raw": [1500, 1000]}}}"#)]
#[case::integer_keys("measured:\n  0:\n    reference: [20, 30]\n    raw: [1500, 1000]\n")]
fn stored_measurements_are_refitted_on_load(#[case] text: &str) {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0]);
    write(config.calibration_file.as_deref().unwrap(), text);

    let cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .build()
        .unwrap();
    assert!(cal.is_calibrated());
    assert!((cal.convert_output(0, 1250.0).unwrap() - 25.0).abs() < 1e-9);
    assert_eq!(cal.calibration_data().measured[&0].raw, vec![1500.0, 1000.0]);
}

#[test]
fn stored_parameters_win_over_measurements() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0]);
    let params = TransformerParameters::new(FitKind::Linear, None, vec![100.0, 2.0]).unwrap();
    let measurement = Measurement {
        reference: vec![1.0, 2.0],
        raw: vec![1.0, 2.0],
    };
    let data = CalibrationData {
        measured: [(0, measurement)].into(),
        input: None,
        output: Some(SlotParameters::PerChannel([(0, params)].into())),
    };
    write(
        config.calibration_file.as_deref().unwrap(),
        &serde_yaml::to_string(&data).unwrap(),
    );
    let cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .build()
        .unwrap();
    assert_eq!(cal.convert_output(0, 104.0).unwrap(), 2.0);
}

#[test]
fn status_goes_stale_after_expiry() {
    let clock = TestClock::new();
    let dir = tempdir().unwrap();
    let config = CalibratorConfig {
        output_transformer: Some(TransformerSpec::new(FitKind::Linear).with_expire(Some(50))),
        ..files(&dir, vec![0])
    };
    write(
        config.calibration_file.as_deref().unwrap(),
        "measured:\n  0:\n    reference: [20, 30]\n    raw: [1500, 1000]\n",
    );
    let cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    assert!(cal.status().ok);

    clock.advance(chrono::Duration::minutes(60));
    let status = cal.status();
    assert!(!status.ok);
    let Some(SlotStatus::PerChannel(channels)) = status.output_transformer else {
        panic!("expected per-channel output status");
    };
    let s = channels[&0].as_ref().unwrap();
    assert_eq!(s.expire, Some(50));
    assert!(s.age > 3500.0);
    assert!(status.input_transformer.is_none());
}

#[test]
fn noop_apply_finishes_without_fitting() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("noop", CalibratorKind::NoOp)
        .config(files(&dir, vec![0]))
        .build()
        .unwrap();
    assert!(cal.is_calibrated());
    cal.initialize_calibration_procedure(None, false).unwrap();
    assert_eq!(done(cal.state()).phase, Phase::Complete);
    let report = done(cal.apply().unwrap());
    assert!(report.fitted.is_empty());
    assert!(!cal.state().is_started());
    assert_eq!(cal.convert_output(0, 7.5).unwrap(), 7.5);
}

#[test]
fn imported_measurements_calibrate_without_procedure() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0, 1]);
    let history = RecordingHistory::default();
    let mut cal = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config.clone())
        .history(Arc::new(history.clone()))
        .build()
        .unwrap();
    let measured = [
        (
            0,
            Measurement {
                reference: vec![20.0, 30.0, 40.0],
                raw: vec![1500.0, 1000.0, 500.0],
            },
        ),
        (
            1,
            Measurement {
                reference: vec![20.0],
                raw: vec![1500.0],
            },
        ),
    ]
    .into_iter()
    .collect();

    let report = cal.calibrate_from(&measured).unwrap();
    assert_eq!(report.fitted.keys().copied().collect::<Vec<_>>(), vec![0]);
    assert!(matches!(
        report.failed[&1],
        CalibrationError::InsufficientData { channel: Some(1), .. }
    ));
    assert!(!cal.state().is_started());
    assert!(config.calibration_file.unwrap().exists());
    assert_eq!(history.records().len(), 1);
    assert!((cal.convert_output(0, 1250.0).unwrap() - 25.0).abs() < 1e-9);
}

#[test]
fn noop_calibrator_cannot_import_measurements() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("noop", CalibratorKind::NoOp)
        .config(files(&dir, vec![0]))
        .build()
        .unwrap();
    let err = cal.calibrate_from(&Default::default()).unwrap_err();
    assert!(matches!(err, CalibrationError::Config(_)));
}

fn measurement(reference: &[f64], raw: &[f64]) -> Measurement {
    Measurement {
        reference: reference.to_vec(),
        raw: raw.to_vec(),
    }
}

#[test]
fn pooled_fit_never_pairs_across_channels() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0, 1]);
    let mut cal = Calibrator::builder("lin", CalibratorKind::Linear)
        .config(config.clone())
        .build()
        .unwrap();

    // each channel alone is unpaired; concatenated they would line up
    let measured = BTreeMap::from([
        (0, measurement(&[10.0, 20.0], &[100.0])),
        (1, measurement(&[30.0], &[300.0, 200.0])),
    ]);
    let report = cal.calibrate_from(&measured).unwrap();
    assert!(report.fitted.is_empty());
    for ch in [0, 1] {
        assert!(
            matches!(report.failed[&ch], CalibrationError::Fit { channel: Some(c), .. } if c == ch),
            "unexpected {:?}",
            report.failed[&ch]
        );
    }
    assert!(!config.calibration_file.unwrap().exists());
    assert!(!cal.is_calibrated());
}

#[test]
fn pooled_fit_skips_unpaired_channel_and_fits_the_rest() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("lin", CalibratorKind::Linear)
        .config(files(&dir, vec![0, 1, 2]))
        .build()
        .unwrap();

    // raw = 2500 - 50 * reference
    let measured = BTreeMap::from([
        (0, measurement(&[10.0, 20.0], &[100.0])),
        (1, measurement(&[10.0, 30.0], &[2000.0, 1000.0])),
        (2, measurement(&[20.0], &[1500.0])),
    ]);
    let report = cal.calibrate_from(&measured).unwrap();
    assert_eq!(report.fitted.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert!(matches!(
        report.failed[&0],
        CalibrationError::Fit { channel: Some(0), .. }
    ));
    assert!((cal.convert_output(2, 1250.0).unwrap() - 25.0).abs() < 1e-9);
}

#[test]
fn pooled_fit_failures_name_their_channel() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("lin", CalibratorKind::Linear)
        .config(files(&dir, vec![3]))
        .build()
        .unwrap();
    let measured = BTreeMap::from([(3, measurement(&[10.0], &[2000.0]))]);
    let report = cal.calibrate_from(&measured).unwrap();
    assert_eq!(
        report.failed[&3],
        CalibrationError::InsufficientData {
            channel: Some(3),
            needed: 2,
            got: 1
        }
    );
}

#[test]
fn single_vial_linear_procedure_reaches_apply() {
    let dir = tempdir().unwrap();
    let mut cal = Calibrator::builder("lin", CalibratorKind::Linear)
        .config(files(&dir, vec![0]))
        .build()
        .unwrap();
    let mut hw = SimulatedSensor::temperature("lin", 1);
    let sim = hw.handle();
    cal.initialize_calibration_procedure(None, false).unwrap();

    // measuring the same vial twice stays in progress until the fit
    for t in [10.0, 40.0] {
        sim.set_physical(0, t);
        cal.dispatch("measure_vial_0_reference", &json!({"reference": t}), &mut hw)
            .unwrap();
        cal.dispatch("read_vial_0_raw_output", &json!(null), &mut hw)
            .unwrap();
        assert_eq!(done(cal.state()).phase, Phase::InProgress);
    }
    let view = done(cal.dispatch("calculate_fit", &json!(null), &mut hw).unwrap());
    assert_eq!(view.phase, Phase::Complete);
    assert!(view.state.fitted.contains_key(&0));

    let report = done(cal.apply().unwrap());
    assert!(report.failed.is_empty());
    assert!(report.fitted.contains_key(&0));
    assert!(!cal.state().is_started());
    assert!((cal.convert_output(0, 2500.0 - 50.0 * 25.0).unwrap() - 25.0).abs() < 1e-9);
}

#[test]
fn reload_picks_up_a_file_written_elsewhere() {
    let dir = tempdir().unwrap();
    let config = files(&dir, vec![0]);
    let mut reader = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config.clone())
        .build()
        .unwrap();
    assert!(!reader.reload().unwrap(), "no calibration file yet");

    let mut writer = Calibrator::builder("temp", CalibratorKind::Temperature)
        .config(config)
        .build()
        .unwrap();
    let measured = BTreeMap::from([(0, measurement(&[20.0, 40.0], &[1500.0, 500.0]))]);
    writer.calibrate_from(&measured).unwrap();

    assert_eq!(reader.convert_output(0, 1000.0).unwrap(), 1000.0);
    assert!(reader.reload().unwrap());
    assert!((reader.convert_output(0, 1000.0).unwrap() - 30.0).abs() < 1e-9);
}
