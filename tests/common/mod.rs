//! Seeded synthetic streamflow records shared by the integration tests

#![allow(dead_code)]

use std::f64::consts::PI;
use std::io::Write;
use std::path::Path;
use flowgam::{Dataset, Observation};
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

/// Monthly record with seasonal flow, rainfall and SOI effects, a slow trend
/// and AR(1) errors with correlation `rho`
pub fn synthetic_observations(n: usize, rho: f64, seed: u64) -> Vec<Observation> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();

    let sd = 0.15;
    let mut error = sd * normal.sample(&mut rng);
    let mut soi = 0.0;

    (0..n)
        .map(|i| {
            let time = (i + 1) as f64;
            let moy = (i % 12) as u32 + 1;
            let season = 2.0 * PI * moy as f64 / 12.0;

            let rain = (60.0 + 35.0 * season.sin() + 20.0 * normal.sample(&mut rng)).max(1.0);
            soi = 0.8 * soi + 0.6 * normal.sample(&mut rng);
            if i > 0 {
                error = rho * error + sd * (1.0 - rho * rho).sqrt() * normal.sample(&mut rng);
            }

            let log_flow = 0.5
                + 0.012 * rain
                + 0.1 * soi
                + 0.4 * season.cos()
                + 0.3 * (2.0 * PI * time / n as f64).sin()
                + error;
            Observation {
                month: format!("{}-{:02}", 1990 + i / 12, moy),
                flow: log_flow.exp(),
                rain,
                soi,
                moy,
                time,
                log_flow: None,
            }
        })
        .collect()
}

pub fn synthetic_dataset(n: usize, rho: f64, seed: u64) -> Dataset {
    Dataset::from_observations(synthetic_observations(n, rho, seed)).unwrap()
}

/// Write observations as CSV in the input file layout
pub fn write_csv(path: &Path, observations: &[Observation]) {
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "month,flow,rain,SOI,moy,time,log_flow").unwrap();
    for o in observations {
        writeln!(
            file,
            "{},{},{},{},{},{},{}",
            o.month,
            o.flow,
            o.rain,
            o.soi,
            o.moy,
            o.time,
            o.flow.ln()
        )
        .unwrap();
    }
}
