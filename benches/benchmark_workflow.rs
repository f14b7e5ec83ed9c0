//! End-to-end timing of the analysis: single fits, the AR(1) profile and the
//! full default stage sequence on seeded synthetic records.

use std::f64::consts::PI;
use std::time::Instant;
use flowgam::config::AnalysisConfig;
use flowgam::{fit_ar1, Ar1Options, Dataset, FitOptions, Observation, Workflow, GAM};
use rand::{
    distributions::{Distribution, Uniform},
    SeedableRng,
};
use rand_chacha::ChaCha8Rng;

fn synthetic(n: usize) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let uniform = Uniform::new(0.0, 1.0);
    let mut error = 0.0;
    let observations = (0..n)
        .map(|i| {
            let moy = (i % 12) as u32 + 1;
            let season = 2.0 * PI * moy as f64 / 12.0;
            let rain = 60.0 + 35.0 * season.sin() + 40.0 * uniform.sample(&mut rng);
            let soi = 4.0 * uniform.sample(&mut rng) - 2.0;
            error = 0.6 * error + 0.2 * (uniform.sample(&mut rng) - 0.5);
            let log_flow = 0.5 + 0.012 * rain + 0.1 * soi + 0.4 * season.cos() + error;
            Observation {
                month: format!("m{}", i),
                flow: log_flow.exp(),
                rain,
                soi,
                moy,
                time: (i + 1) as f64,
                log_flow: None,
            }
        })
        .collect();
    Dataset::from_observations(observations).expect("synthetic data is valid")
}

/// Best of `reps` runs in milliseconds
fn time_ms<F: FnMut()>(reps: usize, mut f: F) -> f64 {
    (0..reps)
        .map(|_| {
            let start = Instant::now();
            f();
            start.elapsed().as_secs_f64() * 1000.0
        })
        .fold(f64::INFINITY, f64::min)
}

fn main() {
    println!("\n=== flowgam workflow benchmark (seed 42) ===\n");
    let formula = "log_flow ~ s(rain) + s(SOI) + s(moy, bs=\"cc\", k=12) + s(time, k=20)";
    let gam = GAM::from_formula(formula).expect("valid formula");
    let options = FitOptions::default().with_cyclic_period("moy", 0.5, 12.5);

    println!("{:>6} {:>12} {:>12} {:>14}", "n", "fit (ms)", "AR(1) (ms)", "workflow (ms)");
    for &n in &[120, 240, 480, 960] {
        let data = synthetic(n);
        let fit = time_ms(3, || {
            gam.fit(&data, &options).expect("fit");
        });
        let ar1 = time_ms(1, || {
            let opts = Ar1Options {
                fit: options.clone(),
                ..Ar1Options::default()
            };
            fit_ar1(&gam, &data, &opts).expect("AR(1) fit");
        });
        let mut config = AnalysisConfig::default();
        config.analysis.k_check_reps = 100;
        let workflow = Workflow::new(config).expect("default config");
        let full = time_ms(1, || {
            workflow.run(&data).expect("workflow");
        });
        println!("{:>6} {:>12.1} {:>12.1} {:>14.1}", n, fit, ar1, full);
    }
}
