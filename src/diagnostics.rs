//! Residual diagnostics
//!
//! Correlograms, portmanteau and heteroscedasticity tests, the basis
//! dimension check for smooth terms, and the data behind the usual four
//! residual plots.

use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use crate::gam::FittedGAM;
use crate::{GAMError, Result};

/// Autocorrelations (or partial autocorrelations) indexed by lag
#[derive(Debug, Clone)]
pub struct Correlogram {
    /// `values[k]` is the coefficient at lag `k`; lag 0 is 1
    pub values: Vec<f64>,
    /// Approximate 95% bound `1.96/√n` for white noise
    pub bound: f64,
    pub n: usize,
}

impl Correlogram {
    pub fn max_lag(&self) -> usize {
        self.values.len().saturating_sub(1)
    }

    /// Lags (≥ 1) whose coefficient lies outside the white noise bound
    pub fn significant_lags(&self) -> Vec<usize> {
        (1..self.values.len())
            .filter(|&k| self.values[k].abs() > self.bound)
            .collect()
    }
}

/// Outcome of a test with a χ² or similar reference distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestResult {
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

fn chi_squared_sf(statistic: f64, df: f64) -> Result<f64> {
    let dist = ChiSquared::new(df).map_err(|e| GAMError::InvalidParameter(e.to_string()))?;
    Ok((1.0 - dist.cdf(statistic)).max(0.0))
}

/// Sample autocorrelation function up to `max_lag`
pub fn acf(x: &Array1<f64>, max_lag: usize) -> Result<Correlogram> {
    let n = x.len();
    if n < 2 {
        return Err(GAMError::InvalidParameter(
            "autocorrelation needs at least two values".to_string(),
        ));
    }
    let max_lag = max_lag.min(n - 1);
    let mean = x.sum() / n as f64;
    let centered: Vec<f64> = x.iter().map(|v| v - mean).collect();
    let denom: f64 = centered.iter().map(|v| v * v).sum();
    if denom <= 0.0 {
        return Err(GAMError::InvalidParameter(
            "autocorrelation of a constant series is undefined".to_string(),
        ));
    }

    let values = (0..=max_lag)
        .map(|k| {
            let num: f64 = (0..n - k).map(|t| centered[t] * centered[t + k]).sum();
            num / denom
        })
        .collect();

    Ok(Correlogram {
        values,
        bound: 1.96 / (n as f64).sqrt(),
        n,
    })
}

/// Partial autocorrelations by the Durbin–Levinson recursion
pub fn pacf(x: &Array1<f64>, max_lag: usize) -> Result<Correlogram> {
    let r = acf(x, max_lag)?;
    let m = r.max_lag();
    let mut values = vec![1.0; m + 1];
    let mut phi_prev: Vec<f64> = Vec::new();

    for k in 1..=m {
        let num = r.values[k] - (1..k).map(|j| phi_prev[j - 1] * r.values[k - j]).sum::<f64>();
        let den = 1.0 - (1..k).map(|j| phi_prev[j - 1] * r.values[j]).sum::<f64>();
        let phi_kk = if den.abs() > 1e-12 { num / den } else { 0.0 };

        let mut phi = Vec::with_capacity(k);
        for j in 1..k {
            phi.push(phi_prev[j - 1] - phi_kk * phi_prev[k - j - 1]);
        }
        phi.push(phi_kk);
        values[k] = phi_kk;
        phi_prev = phi;
    }

    Ok(Correlogram {
        values,
        bound: r.bound,
        n: r.n,
    })
}

/// Ljung–Box portmanteau test on the first `lags` autocorrelations, with
/// `fitted_df` degrees of freedom removed for estimated ARMA parameters
pub fn ljung_box(residuals: &Array1<f64>, lags: usize, fitted_df: usize) -> Result<TestResult> {
    if lags <= fitted_df {
        return Err(GAMError::InvalidParameter(format!(
            "Ljung-Box needs more lags ({}) than fitted parameters ({})",
            lags, fitted_df
        )));
    }
    let r = acf(residuals, lags)?;
    let n = r.n as f64;
    let statistic = n
        * (n + 2.0)
        * (1..=r.max_lag())
            .map(|k| r.values[k] * r.values[k] / (n - k as f64))
            .sum::<f64>();
    let df = r.max_lag().saturating_sub(fitted_df).max(1) as f64;
    Ok(TestResult {
        statistic,
        df,
        p_value: chi_squared_sf(statistic, df)?,
    })
}

/// Studentized Breusch–Pagan test: `n·R²` of the regression of squared
/// residuals on the fitted values, against χ²₁
pub fn breusch_pagan(residuals: &Array1<f64>, fitted: &Array1<f64>) -> Result<TestResult> {
    let n = residuals.len();
    if n != fitted.len() {
        return Err(GAMError::DimensionMismatch(format!(
            "{} residuals but {} fitted values",
            n,
            fitted.len()
        )));
    }
    if n < 3 {
        return Err(GAMError::InvalidParameter(
            "Breusch-Pagan needs at least three observations".to_string(),
        ));
    }

    let u: Array1<f64> = residuals.mapv(|e| e * e);
    let nf = n as f64;
    let u_mean = u.sum() / nf;
    let f_mean = fitted.sum() / nf;

    let sxx: f64 = fitted.iter().map(|f| (f - f_mean).powi(2)).sum();
    let sxy: f64 = fitted
        .iter()
        .zip(u.iter())
        .map(|(f, ui)| (f - f_mean) * (ui - u_mean))
        .sum();
    let syy: f64 = u.iter().map(|ui| (ui - u_mean).powi(2)).sum();

    let r_squared = if sxx > 0.0 && syy > 0.0 {
        sxy * sxy / (sxx * syy)
    } else {
        0.0
    };
    let statistic = nf * r_squared;
    Ok(TestResult {
        statistic,
        df: 1.0,
        p_value: chi_squared_sf(statistic, 1.0)?,
    })
}

/// Basis dimension check for one smooth term
#[derive(Debug, Clone)]
pub struct KCheckRow {
    pub label: String,
    /// Coefficients available to the term after the constraint
    pub k_prime: usize,
    pub edf: f64,
    pub k_index: f64,
    pub p_value: f64,
}

impl KCheckRow {
    /// Low k-index with a small p-value: the basis may be too small
    pub fn suggests_larger_k(&self) -> bool {
        self.k_index < 1.0 && self.p_value < 0.05 && self.edf > 0.8 * self.k_prime as f64
    }
}

/// Half the mean squared difference of residuals taken in covariate order
fn neighbour_variance(residuals: &[f64], order: &[usize]) -> f64 {
    let diffs: f64 = order
        .windows(2)
        .map(|w| (residuals[w[1]] - residuals[w[0]]).powi(2))
        .sum();
    diffs / (2.0 * (order.len() - 1) as f64)
}

/// Compare residual variance between covariate neighbours with the overall
/// residual variance for each smooth; p-values come from `reps` random
/// permutations of the residuals.
pub fn k_check(fitted: &FittedGAM, reps: usize, seed: u64) -> Result<Vec<KCheckRow>> {
    let residuals: Vec<f64> = fitted.residuals.to_vec();
    let n = residuals.len();
    if n < 3 {
        return Err(GAMError::InvalidParameter(
            "k-check needs at least three residuals".to_string(),
        ));
    }
    let mean = residuals.iter().sum::<f64>() / n as f64;
    let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled = residuals.clone();

    let mut rows = Vec::with_capacity(fitted.smooths.len());
    for smooth in &fitted.smooths {
        let x = &smooth.term.covariate;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));

        let observed = neighbour_variance(&residuals, &order);
        let mut below = 0usize;
        for _ in 0..reps {
            shuffled.shuffle(&mut rng);
            if neighbour_variance(&shuffled, &order) < observed {
                below += 1;
            }
        }
        let p_value = if reps > 0 {
            below as f64 / reps as f64
        } else {
            f64::NAN
        };

        rows.push(KCheckRow {
            label: smooth.term.label(),
            k_prime: smooth.term.size,
            edf: smooth.edf,
            k_index: if variance > 0.0 { observed / variance } else { f64::NAN },
            p_value,
        });
    }
    Ok(rows)
}

pub fn format_k_check(rows: &[KCheckRow]) -> String {
    let width = rows.iter().map(|r| r.label.len()).max().unwrap_or(0).max(8);
    let mut out = format!(
        "{:<w$} {:>4} {:>7} {:>8} {:>8}\n",
        "", "k'", "edf", "k-index", "p-value",
        w = width
    );
    for row in rows {
        out.push_str(&format!(
            "{:<w$} {:>4} {:>7.2} {:>8.2} {:>8.3}\n",
            row.label, row.k_prime, row.edf, row.k_index, row.p_value,
            w = width
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Data behind the standard residual plots: QQ, residuals vs fitted,
/// histogram and response vs fitted
#[derive(Debug, Clone)]
pub struct ResidualChecks {
    pub residuals: Array1<f64>,
    pub fitted: Array1<f64>,
    pub response: Array1<f64>,
    /// (theoretical normal quantile, sorted residual)
    pub qq: Vec<(f64, f64)>,
    pub histogram: Vec<HistogramBin>,
}

/// Plotting positions `(i − a)/(n + 1 − 2a)`, `a = 3/8` for n ≤ 10 else 1/2
fn plotting_positions(n: usize) -> Vec<f64> {
    let a = if n <= 10 { 0.375 } else { 0.5 };
    (1..=n)
        .map(|i| (i as f64 - a) / (n as f64 + 1.0 - 2.0 * a))
        .collect()
}

/// Sturges' rule histogram
fn histogram(values: &[f64]) -> Vec<HistogramBin> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let bins = ((n as f64).log2().ceil() as usize + 1).max(1);
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };

    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|b| HistogramBin {
            lower: lo + b as f64 * width,
            upper: lo + (b + 1) as f64 * width,
            count: 0,
        })
        .collect();
    for &v in values {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}

impl ResidualChecks {
    pub fn new(residuals: &Array1<f64>, fitted: &Array1<f64>, response: &Array1<f64>) -> Result<Self> {
        let n = residuals.len();
        if fitted.len() != n || response.len() != n {
            return Err(GAMError::DimensionMismatch(
                "residuals, fitted values and response differ in length".to_string(),
            ));
        }

        let normal = Normal::new(0.0, 1.0).map_err(|e| GAMError::InvalidParameter(e.to_string()))?;
        let mut sorted = residuals.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let qq = plotting_positions(n)
            .into_iter()
            .map(|p| normal.inverse_cdf(p))
            .zip(sorted)
            .collect();

        Ok(Self {
            residuals: residuals.clone(),
            fitted: fitted.clone(),
            response: response.clone(),
            qq,
            histogram: histogram(&residuals.to_vec()),
        })
    }

    pub fn from_fit(fit: &FittedGAM) -> Result<Self> {
        Self::new(&fit.residuals, &fit.fitted_values, &fit.response)
    }
}
