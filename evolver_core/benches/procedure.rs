use std::sync::Arc;

use criterion::{BatchSize, BenchmarkGroup, Criterion, black_box, criterion_group, criterion_main};
use criterion::measurement::WallTime;
use evolver_core::mocks::FixedSensor;
use evolver_core::transformer::{LinearTransformer, PolyFitTransformer, SigmoidTransformer};
use evolver_core::{
    ActionContext, CalibrationProcedure, CalibratorConfig, CalibratorKind, Transformer,
    TransformerFactory, TransformerSlot, Transformers,
};
use serde_json::json;

// Allow quick tweaking without CLI flags (Criterion 0.5):
//   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p evolver_core --bench procedure
fn tune(g: &mut BenchmarkGroup<'_, WallTime>) {
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(10));
        }
    } else {
        g.sample_size(30);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(std::time::Duration::from_millis(ms_u64));
    }
}

fn linear_procedure(channels: usize) -> CalibrationProcedure {
    let vials: Vec<usize> = (0..channels).collect();
    let kind = CalibratorKind::Linear;
    let mut p = CalibrationProcedure::new(kind.procedure_name(), "bench", vials.clone());
    for action in kind.actions(&CalibratorConfig::default(), &vials) {
        let _ = p.add_action(action);
    }
    p.start();
    p
}

pub fn bench_dispatch_undo(c: &mut Criterion) {
    let mut g = c.benchmark_group("procedure");
    tune(&mut g);

    for &channels in &[8usize, 50] {
        let mut hw = FixedSensor::new("bench", (0..channels).map(|c| c as f64).collect());
        let factory: TransformerFactory = Arc::new(|| Box::new(LinearTransformer::new()));
        let mut transformers = Transformers {
            input: TransformerSlot::Empty,
            output: TransformerSlot::per_channel(factory),
        };
        g.bench_function(format!("dispatch_then_undo_{}", channels * 2), |b| {
            b.iter_batched(
                || linear_procedure(channels),
                |mut p| {
                    let mut ctx = ActionContext {
                        hardware: &mut hw,
                        transformers: &mut transformers,
                    };
                    for ch in 0..channels {
                        let _ = p.dispatch(
                            &format!("measure_vial_{ch}_reference"),
                            &json!({"reference": ch as f64}),
                            &mut ctx,
                        );
                        let _ = p.dispatch(&format!("read_vial_{ch}_raw_output"), &json!(null), &mut ctx);
                    }
                    while p.undo().is_ok() {}
                    black_box(p.state().history.len());
                },
                BatchSize::SmallInput,
            )
        });
    }
    g.finish();
}

pub fn bench_fits(c: &mut Criterion) {
    let mut g = c.benchmark_group("fit");
    tune(&mut g);

    let x: Vec<f64> = (0..64).map(|i| f64::from(i) * 0.03).collect();
    let cubic: Vec<f64> = x.iter().map(|v| 1.0 + 2.0 * v - 0.5 * v * v + 0.1 * v * v * v).collect();
    let sigmoid: Vec<f64> = x
        .iter()
        .map(|v| 62_000.0 - 60_000.0 / (1.0 + 10f64.powf((0.9 - v) * 2.0)))
        .collect();

    let poly = PolyFitTransformer::new(3);
    g.bench_function("poly3_fit_64", |b| {
        b.iter(|| black_box(poly.fit(black_box(&x), black_box(&cubic)).ok()))
    });
    let mut fitted = PolyFitTransformer::new(3);
    let _ = fitted.refit(&x, &cubic);
    g.bench_function("poly3_convert_from", |b| {
        b.iter(|| black_box(fitted.convert_from(black_box(2.1)).ok()))
    });
    let sig = SigmoidTransformer::new();
    g.bench_function("sigmoid_fit_64", |b| {
        b.iter(|| black_box(sig.fit(black_box(&x), black_box(&sigmoid)).ok()))
    });
    g.finish();
}

criterion_group!(procedure, bench_dispatch_undo, bench_fits);
criterion_main!(procedure);
