//! Additive models with AR(1) residual correlation
//!
//! With errors `e ~ N(0, φR)` and `R` the AR(1) correlation matrix of each run
//! of unit-spaced observations, the transform `C` with `CᵀC = R⁻¹` leaves the
//! first observation of a run unchanged and maps the rest to
//! `(yₜ − ρyₜ₋₁)/√(1−ρ²)`. Fitting `Cy` on `CX` by REML and adding `log|R|`
//! gives the restricted likelihood of the correlated model, which is profiled
//! over `ρ` by golden section search. Smoothing parameters are re-estimated
//! at every `ρ`.

use ndarray::{Array1, Array2, ArrayView1};
use tracing::{debug, info, warn};
use crate::data::Dataset;
use crate::gam::{FitOptions, FittedGAM, GAMSummary, ModelMatrix, GAM};
use crate::smooth::{Convergence, OptimizationMethod};
use crate::{GAMError, Result};

#[derive(Debug, Clone)]
pub struct Ar1Options {
    /// Options for the inner (smoothing parameter) fits
    pub fit: FitOptions,
    /// Search interval for ρ
    pub bounds: (f64, f64),
    /// Width of the final bracketing interval
    pub tolerance: f64,
    pub max_iter: usize,
}

impl Default for Ar1Options {
    fn default() -> Self {
        Self {
            fit: FitOptions::default(),
            bounds: (-0.99, 0.99),
            tolerance: 1e-4,
            max_iter: 60,
        }
    }
}

/// One evaluation of the profile criterion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfilePoint {
    pub rho: f64,
    pub criterion: f64,
}

#[derive(Debug, Clone)]
pub struct Ar1Fit {
    /// Model fitted on the pre-whitened problem at ρ̂
    pub gam: FittedGAM,
    pub rho: f64,
    /// Every (ρ, criterion) pair evaluated, in evaluation order
    pub profile: Vec<ProfilePoint>,
    /// `y − Xβ̂` on the original scale
    pub raw_residuals: Array1<f64>,
    /// Pre-whitened residuals divided by `√φ̂`
    pub normalized_residuals: Array1<f64>,
    pub convergence: Convergence,
    /// AIC including the correlation parameter
    pub aic: f64,
}

impl Ar1Fit {
    pub fn summary(&self) -> Result<GAMSummary> {
        let mut summary = self.gam.summary()?;
        summary.correlation = Some(self.rho);
        Ok(summary)
    }

    /// Profile points sorted by ρ
    pub fn sorted_profile(&self) -> Vec<ProfilePoint> {
        let mut points = self.profile.clone();
        points.sort_by(|a, b| a.rho.total_cmp(&b.rho));
        points
    }
}

/// Run boundaries `[start, end)` from the break indices
fn runs(n: usize, breaks: &[usize]) -> Vec<(usize, usize)> {
    let mut starts = vec![0];
    starts.extend(breaks.iter().copied().filter(|&b| b > 0 && b < n));
    starts.dedup();
    let mut bounds = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(n);
        bounds.push((start, end));
    }
    bounds
}

/// Apply the AR(1) pre-whitening transform to a vector
pub fn whiten(v: ArrayView1<f64>, rho: f64, breaks: &[usize]) -> Array1<f64> {
    let n = v.len();
    let scale = 1.0 / (1.0 - rho * rho).sqrt();
    let mut out = v.to_owned();
    for (start, end) in runs(n, breaks) {
        for t in start + 1..end {
            out[t] = (v[t] - rho * v[t - 1]) * scale;
        }
    }
    out
}

/// Apply the pre-whitening transform to every column of `x`
pub fn whiten_matrix(x: &Array2<f64>, rho: f64, breaks: &[usize]) -> Array2<f64> {
    let mut out = Array2::zeros(x.dim());
    for (j, column) in x.columns().into_iter().enumerate() {
        out.column_mut(j).assign(&whiten(column, rho, breaks));
    }
    out
}

/// `log|R| = Σ_runs (len − 1) ln(1 − ρ²)`
pub fn log_det_correlation(n: usize, rho: f64, breaks: &[usize]) -> f64 {
    let log_one_minus = (1.0 - rho * rho).ln();
    runs(n, breaks)
        .iter()
        .map(|(start, end)| (end - start).saturating_sub(1) as f64 * log_one_minus)
        .sum()
}

struct Profiler<'a> {
    gam: &'a GAM,
    model: &'a ModelMatrix,
    breaks: Vec<usize>,
    options: FitOptions,
    lambda: Option<Vec<f64>>,
    profile: Vec<ProfilePoint>,
}

impl<'a> Profiler<'a> {
    fn fit_at(&mut self, rho: f64) -> Result<FittedGAM> {
        let x = whiten_matrix(&self.model.x, rho, &self.breaks);
        let y = whiten(self.model.y.view(), rho, &self.breaks);
        let log_det_r = log_det_correlation(self.model.n(), rho, &self.breaks);
        let fitted = self.gam.fit_transformed(
            self.model,
            &x,
            &y,
            log_det_r,
            &self.options,
            self.lambda.as_deref(),
        )?;
        self.lambda = Some(fitted.smooths.iter().map(|s| s.lambda).collect());
        Ok(fitted)
    }

    fn criterion(&mut self, rho: f64) -> Result<f64> {
        let fitted = self.fit_at(rho)?;
        debug!(rho, criterion = fitted.score, "AR(1) profile evaluation");
        self.profile.push(ProfilePoint {
            rho,
            criterion: fitted.score,
        });
        Ok(fitted.score)
    }
}

/// Fit `gam` with AR(1) errors, estimating ρ by profiled REML
pub fn fit_ar1(gam: &GAM, data: &Dataset, options: &Ar1Options) -> Result<Ar1Fit> {
    let (lower, upper) = options.bounds;
    if !(lower > -1.0 && upper < 1.0 && lower < upper) {
        return Err(GAMError::InvalidParameter(format!(
            "AR(1) bounds must satisfy -1 < lower < upper < 1, got ({}, {})",
            lower, upper
        )));
    }

    let mut fit_options = options.fit.clone();
    if fit_options.method != OptimizationMethod::REML {
        warn!(
            method = fit_options.method.name(),
            "AR(1) correlation is estimated by REML; ignoring the requested method"
        );
        fit_options.method = OptimizationMethod::REML;
    }

    let model = gam.model_matrix(data, &fit_options)?;
    let mut profiler = Profiler {
        gam,
        model: &model,
        breaks: data.series_breaks(),
        options: fit_options,
        lambda: None,
        profile: Vec::new(),
    };

    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let resphi = 2.0 - phi;

    let mut a = lower;
    let mut b = upper;
    let mut c = a + resphi * (b - a);
    let mut d = b - resphi * (b - a);
    let mut fc = profiler.criterion(c)?;
    let mut fd = profiler.criterion(d)?;

    let mut iterations = 0;
    while (b - a).abs() >= options.tolerance && iterations < options.max_iter {
        iterations += 1;
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = a + resphi * (b - a);
            fc = profiler.criterion(c)?;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = b - resphi * (b - a);
            fd = profiler.criterion(d)?;
        }
    }

    let rho = (a + b) / 2.0;
    let gam_fit = profiler.fit_at(rho)?;
    profiler.profile.push(ProfilePoint {
        rho,
        criterion: gam_fit.score,
    });

    let width = (b - a).abs();
    let at_boundary = rho - lower < 10.0 * options.tolerance || upper - rho < 10.0 * options.tolerance;
    let converged = width < options.tolerance && !at_boundary;
    let message = if at_boundary {
        format!("AR(1) parameter at the boundary of ({}, {})", lower, upper)
    } else if !converged {
        format!("golden section stopped after {} iterations", iterations)
    } else {
        "bracket below tolerance".to_string()
    };
    if converged {
        info!(rho, iterations, "AR(1) correlation estimated");
    } else {
        warn!(rho, iterations, "{}", message);
    }

    let raw_residuals = gam_fit.residuals.clone();
    let normalized_residuals = gam_fit.normalized_residuals.clone();
    let aic = gam_fit.aic + 2.0;

    Ok(Ar1Fit {
        rho,
        profile: profiler.profile,
        raw_residuals,
        normalized_residuals,
        convergence: Convergence {
            iterations,
            converged,
            gradient_norm: width,
            message,
        },
        aic,
        gam: gam_fit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observation;
    use crate::diagnostics::acf;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::distributions::Distribution;
    use rand_chacha::ChaCha8Rng;
    use statrs::distribution::Normal;

    fn ar1_series(n: usize, rho: f64, seed: u64) -> Array1<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut e = Array1::zeros(n);
        e[0] = normal.sample(&mut rng);
        for t in 1..n {
            e[t] = rho * e[t - 1] + (1.0 - rho * rho).sqrt() * normal.sample(&mut rng);
        }
        e
    }

    #[test]
    fn test_whitening_removes_lag_one_correlation() {
        let e = ar1_series(2000, 0.7, 11);
        let raw = acf(&e, 1).unwrap();
        let white = whiten(e.view(), 0.7, &[]);
        let whitened = acf(&white, 1).unwrap();
        assert!(raw.values[1] > 0.6);
        assert!(whitened.values[1].abs() < 0.08);
    }

    #[test]
    fn test_whitening_restarts_at_breaks() {
        let v = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let w = whiten(v.view(), 0.5, &[2]);
        let s = 1.0 / 0.75f64.sqrt();
        assert_abs_diff_eq!(w[0], 1.0);
        assert_abs_diff_eq!(w[1], (2.0 - 0.5) * s, epsilon = 1e-12);
        assert_abs_diff_eq!(w[2], 3.0);
        assert_abs_diff_eq!(w[3], (4.0 - 1.5) * s, epsilon = 1e-12);

        assert_abs_diff_eq!(log_det_correlation(4, 0.5, &[2]), 2.0 * 0.75f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_det_correlation(4, 0.0, &[]), 0.0);
    }

    #[test]
    fn test_whitening_at_zero_is_identity() {
        let x = Array2::from_shape_fn((5, 2), |(i, j)| (i * 3 + j) as f64);
        assert_eq!(whiten_matrix(&x, 0.0, &[]), x);
    }

    fn correlated_dataset(n: usize, rho: f64) -> Dataset {
        let e = ar1_series(n, rho, 2024);
        let observations = (0..n)
            .map(|i| {
                let t = (i + 1) as f64;
                let log_flow = 2.0 + (2.0 * std::f64::consts::PI * t / 120.0).sin() + 0.3 * e[i];
                Observation {
                    month: format!("m{}", i),
                    flow: log_flow.exp(),
                    rain: 0.0,
                    soi: 0.0,
                    moy: (i % 12) as u32 + 1,
                    time: t,
                    log_flow: None,
                }
            })
            .collect();
        Dataset::from_observations(observations).unwrap()
    }

    #[test]
    fn test_fit_ar1_recovers_correlation() {
        let data = correlated_dataset(240, 0.6);
        let gam = GAM::from_formula("log_flow ~ s(time, k=6)").unwrap();
        let fit = fit_ar1(&gam, &data, &Ar1Options::default()).unwrap();

        assert!(fit.convergence.converged, "{:?}", fit.convergence);
        assert!((fit.rho - 0.6).abs() < 0.2, "rho = {}", fit.rho);
        assert!(fit.profile.len() > 10);
        assert_eq!(fit.normalized_residuals.len(), 240);

        // normalized residuals are close to white noise
        let r = acf(&fit.normalized_residuals, 1).unwrap();
        assert!(r.values[1].abs() < 0.2);

        // the profile criterion is lowest near the estimate
        let best = fit
            .profile
            .iter()
            .fold(f64::INFINITY, |m, p| m.min(p.criterion));
        let at_zero = fit_ar1(
            &gam,
            &data,
            &Ar1Options {
                bounds: (-0.01, 0.01),
                ..Ar1Options::default()
            },
        )
        .unwrap();
        assert!(best < at_zero.gam.score);
        assert!(fit.summary().unwrap().to_string().contains("AR(1)"));
    }

    #[test]
    fn test_invalid_bounds() {
        let data = correlated_dataset(60, 0.3);
        let gam = GAM::from_formula("log_flow ~ s(time, k=5)").unwrap();
        let options = Ar1Options {
            bounds: (-1.0, 0.5),
            ..Ar1Options::default()
        };
        assert!(fit_ar1(&gam, &data, &options).is_err());
    }
}
