//! Main GAM model structure and fitting
//!
//! A model is a formula; fitting it to a [`Dataset`] builds the design matrix
//! (intercept, linear covariates, then one constrained spline block per smooth
//! term), selects smoothing parameters and returns an immutable [`FittedGAM`].
//! Models without smooth terms go through the same path with no penalties,
//! which is ordinary least squares.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use ndarray::{s, Array1, Array2};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use tracing::info;
use crate::{
    Result, GAMError,
    basis::{BasisFunction, CubicRegressionSpline, CyclicCubicSpline},
    data::{canonical_name, Dataset},
    formula::{BasisType, ModelFormula, SmoothSpec},
    linalg::{constraint_null_space, truncated_pinv},
    penalty::{scale_to_design, BlockPenalty},
    pls::Gram,
    reml::reported_reml_score,
    smooth::{Convergence, OptimizationMethod, SmoothingParameter},
};

/// Options controlling a fit
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub method: OptimizationMethod,
    /// Maximum Newton iterations for the smoothing parameters
    pub max_iter: usize,
    /// Relative gradient tolerance
    pub tolerance: f64,
    /// γ for GCV
    pub gamma: f64,
    /// Period of cyclic smooths by variable; others wrap over their data range
    pub cyclic_periods: HashMap<String, (f64, f64)>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            method: OptimizationMethod::REML,
            max_iter: 100,
            tolerance: 1e-7,
            gamma: 1.0,
            cyclic_periods: HashMap::new(),
        }
    }
}

impl FitOptions {
    pub fn with_cyclic_period(mut self, var: &str, lower: f64, upper: f64) -> Self {
        self.cyclic_periods
            .insert(canonical_name(var).to_string(), (lower, upper));
        self
    }

    pub fn cyclic_period(&self, var: &str) -> Option<(f64, f64)> {
        self.cyclic_periods.get(canonical_name(var)).copied()
    }
}

/// A smooth term in a GAM: its basis, the identifiability constraint absorbed
/// into it, and its position in the coefficient vector.
#[derive(Debug, Clone)]
pub struct SmoothTerm {
    pub spec: SmoothSpec,
    pub basis: Arc<dyn BasisFunction>,
    /// `k × (k-1)` null space of the sum-to-zero constraint
    pub constraint: Array2<f64>,
    /// First coefficient of the term
    pub offset: usize,
    /// Number of coefficients after the constraint
    pub size: usize,
    /// Covariate values the term was set up on
    pub covariate: Array1<f64>,
}

impl SmoothTerm {
    fn setup(spec: &SmoothSpec, x: &Array1<f64>, options: &FitOptions) -> Result<Self> {
        let basis: Arc<dyn BasisFunction> = match spec.bs {
            BasisType::CubicRegression => {
                Arc::new(CubicRegressionSpline::with_quantile_knots(x, spec.k)?)
            }
            BasisType::Cyclic => match options.cyclic_period(&spec.var) {
                Some((lower, upper)) => Arc::new(CyclicCubicSpline::new(lower, upper, spec.k)?),
                None => Arc::new(CyclicCubicSpline::with_data_range(x, spec.k)?),
            },
        };

        let raw = basis.evaluate(x)?;
        let column_sums = raw.sum_axis(ndarray::Axis(0));
        let constraint = constraint_null_space(&column_sums)?;
        let size = constraint.ncols();

        Ok(Self {
            spec: spec.clone(),
            basis,
            constraint,
            offset: 0,
            size,
            covariate: x.clone(),
        })
    }

    /// Constrained design block at arbitrary covariate values
    pub fn evaluate(&self, x: &Array1<f64>) -> Result<Array2<f64>> {
        Ok(self.basis.evaluate(x)?.dot(&self.constraint))
    }

    pub fn label(&self) -> String {
        self.spec.label()
    }
}

/// Design matrix, response and penalties for a formula on a dataset
#[derive(Debug, Clone)]
pub struct ModelMatrix {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub coef_names: Vec<String>,
    /// Intercept plus linear covariates
    pub n_parametric: usize,
    pub smooths: Vec<SmoothTerm>,
    pub penalties: Vec<BlockPenalty>,
    /// Names of the linear covariates, in column order
    linear_columns: Vec<String>,
}

impl ModelMatrix {
    pub fn n(&self) -> usize {
        self.y.len()
    }

    pub fn p(&self) -> usize {
        self.x.ncols()
    }
}

/// Generalized Additive Model
#[derive(Debug, Clone)]
pub struct GAM {
    pub formula: ModelFormula,
}

impl GAM {
    pub fn new(formula: ModelFormula) -> Self {
        Self { formula }
    }

    pub fn from_formula(formula: &str) -> Result<Self> {
        Ok(Self::new(ModelFormula::parse(formula)?))
    }

    /// Build the design matrix: intercept, linear columns, then smooth blocks
    pub fn model_matrix(&self, data: &Dataset, options: &FitOptions) -> Result<ModelMatrix> {
        let n = data.len();
        let y = data.column(&self.formula.response)?;

        let linear_columns: Vec<String> = self.formula.linear_terms().map(str::to_string).collect();
        let mut blocks: Vec<Array2<f64>> = Vec::new();
        let mut coef_names = vec!["(Intercept)".to_string()];

        let mut parametric = Array2::ones((n, 1 + linear_columns.len()));
        for (j, name) in linear_columns.iter().enumerate() {
            parametric.column_mut(j + 1).assign(&data.column(name)?);
            coef_names.push(name.clone());
        }
        let n_parametric = parametric.ncols();

        let mut smooths = Vec::new();
        let mut raw_penalties = Vec::new();
        let mut offset = n_parametric;
        for spec in self.formula.smooths() {
            let x = data.column(&spec.var)?;
            let mut term = SmoothTerm::setup(spec, &x, options)?;
            term.offset = offset;

            let block = term.evaluate(&x)?;
            let constrained_penalty = term
                .constraint
                .t()
                .dot(&term.basis.penalty()?)
                .dot(&term.constraint);
            let (scaled, _) = scale_to_design(&constrained_penalty, &block);

            for i in 1..=term.size {
                coef_names.push(format!("{}.{}", term.label(), i));
            }
            offset += term.size;
            raw_penalties.push(scaled);
            blocks.push(block);
            smooths.push(term);
        }

        let p = offset;
        if n <= p {
            return Err(GAMError::InvalidParameter(format!(
                "{} coefficients cannot be estimated from {} observations",
                p, n
            )));
        }

        let mut x = Array2::zeros((n, p));
        x.slice_mut(s![.., 0..n_parametric]).assign(&parametric);
        for (term, block) in smooths.iter().zip(blocks.iter()) {
            x.slice_mut(s![.., term.offset..term.offset + term.size])
                .assign(block);
        }

        let penalties = smooths
            .iter()
            .zip(raw_penalties)
            .map(|(term, block)| BlockPenalty::new(block, term.offset, p))
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelMatrix {
            x,
            y,
            coef_names,
            n_parametric,
            smooths,
            penalties,
            linear_columns,
        })
    }

    /// Fit the model with automatic smoothing parameter selection
    pub fn fit(&self, data: &Dataset, options: &FitOptions) -> Result<FittedGAM> {
        let model = self.model_matrix(data, options)?;
        self.fit_model_matrix(&model, options)
    }

    pub fn fit_model_matrix(&self, model: &ModelMatrix, options: &FitOptions) -> Result<FittedGAM> {
        self.fit_transformed(model, &model.x, &model.y, 0.0, options, None)
    }

    /// Fit on a linearly transformed problem (`x_fit = C X`, `y_fit = C y`,
    /// e.g. pre-whitened for correlated errors) while reporting fitted values
    /// and residuals on the original scale. `log_det_r` is `log|R|` of the
    /// implied error correlation matrix.
    pub fn fit_transformed(
        &self,
        model: &ModelMatrix,
        x_fit: &Array2<f64>,
        y_fit: &Array1<f64>,
        log_det_r: f64,
        options: &FitOptions,
        initial_lambda: Option<&[f64]>,
    ) -> Result<FittedGAM> {
        let n = model.n();
        let p = model.p();
        if x_fit.dim() != model.x.dim() || y_fit.len() != n {
            return Err(GAMError::DimensionMismatch(format!(
                "transformed problem is {:?}/{} but the model is {:?}/{}",
                x_fit.dim(),
                y_fit.len(),
                model.x.dim(),
                n
            )));
        }

        let gram = Gram::new(x_fit, y_fit)?;
        let mut sp = SmoothingParameter::new(model.penalties.len(), options.method);
        sp.gamma = options.gamma;
        if let Some(lambda) = initial_lambda {
            if lambda.len() == sp.lambda.len() {
                sp.lambda = lambda.to_vec();
            }
        }

        let (eval, convergence) = sp.optimize(
            x_fit,
            y_fit,
            &gram,
            &model.penalties,
            options.max_iter,
            options.tolerance,
        )?;

        let fit = &eval.fit;
        let scale = eval.scale;
        let coefficients = fit.coefficients.clone();
        let fitted_values = model.x.dot(&coefficients);
        let residuals = &model.y - &fitted_values;
        let working_residuals = y_fit - &fit.fitted_values;
        let sigma = scale.sqrt();
        let normalized_residuals = working_residuals.mapv(|r| r / sigma);

        let edf = fit.edf();
        let residual_df = n as f64 - edf;
        let rss: f64 = residuals.iter().map(|r| r * r).sum();

        let y_mean = model.y.mean().unwrap_or(0.0);
        let null_deviance: f64 = model.y.iter().map(|v| (v - y_mean).powi(2)).sum();
        let deviance_explained = if null_deviance > 0.0 {
            1.0 - rss / null_deviance
        } else {
            0.0
        };
        let r_sq_adj = if null_deviance > 0.0 && residual_df > 0.0 {
            let r_mean = residuals.mean().unwrap_or(0.0);
            let centered: f64 = residuals.iter().map(|r| (r - r_mean).powi(2)).sum();
            1.0 - centered * (n as f64 - 1.0) / (null_deviance * residual_df)
        } else {
            f64::NAN
        };

        let nf = n as f64;
        let aic = nf * (2.0 * std::f64::consts::PI * fit.rss / nf).ln() + nf + log_det_r + 2.0 * (edf + 1.0);

        let score = match options.method {
            OptimizationMethod::REML => {
                reported_reml_score(eval.value, n, p, &model.penalties) + 0.5 * log_det_r
            }
            OptimizationMethod::GCV => eval.value,
        };

        let smooths = model
            .smooths
            .iter()
            .zip(sp.lambda.iter())
            .map(|(term, &lambda)| FittedSmooth {
                term: term.clone(),
                lambda,
                edf: fit.edf_range(term.offset, term.size),
            })
            .collect();

        let vp = &fit.a_inv * scale;

        info!(
            formula = %self.formula,
            n,
            edf,
            score,
            method = options.method.name(),
            "model fitted"
        );

        Ok(FittedGAM {
            formula: self.formula.clone(),
            method: options.method,
            coefficients,
            coef_names: model.coef_names.clone(),
            n_parametric: model.n_parametric,
            linear_columns: model.linear_columns.clone(),
            smooths,
            vp,
            response: model.y.clone(),
            fitted_values,
            residuals,
            working_residuals,
            normalized_residuals,
            edf_per_coef: fit.edf_per_coef.clone(),
            edf,
            residual_df,
            scale,
            score,
            rss,
            r_sq_adj,
            deviance_explained,
            aic,
            log_det_r,
            convergence,
        })
    }
}

/// A smooth term with its estimated smoothing parameter and edf
#[derive(Debug, Clone)]
pub struct FittedSmooth {
    pub term: SmoothTerm,
    pub lambda: f64,
    pub edf: f64,
}

/// Covariate values for prediction, by variable name
#[derive(Debug, Clone, Default)]
pub struct PredictionData {
    columns: HashMap<String, Array1<f64>>,
}

impl PredictionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, values: Array1<f64>) -> Self {
        self.columns.insert(name.to_string(), values);
        self
    }

    pub fn from_dataset(data: &Dataset, names: &[&str]) -> Result<Self> {
        let mut columns = HashMap::new();
        for name in names {
            columns.insert(name.to_string(), data.column(name)?);
        }
        Ok(Self { columns })
    }

    fn get(&self, name: &str) -> Result<&Array1<f64>> {
        self.columns
            .get(name)
            .or_else(|| match name {
                "SOI" => self.columns.get("soi"),
                "soi" => self.columns.get("SOI"),
                _ => None,
            })
            .ok_or_else(|| GAMError::InvalidParameter(format!("no values for '{}' in prediction data", name)))
    }

    fn len(&self) -> Result<usize> {
        let mut lengths = self.columns.values().map(|c| c.len());
        let n = lengths.next().unwrap_or(0);
        if lengths.any(|l| l != n) {
            return Err(GAMError::DimensionMismatch(
                "prediction columns have different lengths".to_string(),
            ));
        }
        Ok(n)
    }
}

/// Predictions on the linear predictor scale with standard errors
#[derive(Debug, Clone)]
pub struct Prediction {
    pub fit: Array1<f64>,
    pub se: Array1<f64>,
}

impl Prediction {
    /// Pointwise band `fit ± z·se`
    pub fn band(&self, z: f64) -> (Array1<f64>, Array1<f64>) {
        (&self.fit - &(&self.se * z), &self.fit + &(&self.se * z))
    }
}

/// `sqrt(diag(X V Xᵀ))` without forming the n×n product
fn rowwise_se(x: &Array2<f64>, v: &Array2<f64>) -> Array1<f64> {
    let xv = x.dot(v);
    Array1::from_iter(
        x.rows()
            .into_iter()
            .zip(xv.rows())
            .map(|(row, row_v)| row.dot(&row_v).max(0.0).sqrt()),
    )
}

/// A fitted Gaussian additive model
#[derive(Debug, Clone)]
pub struct FittedGAM {
    pub formula: ModelFormula,
    pub method: OptimizationMethod,
    pub coefficients: Array1<f64>,
    pub coef_names: Vec<String>,
    pub n_parametric: usize,
    linear_columns: Vec<String>,
    pub smooths: Vec<FittedSmooth>,
    /// Bayesian posterior covariance of the coefficients
    pub vp: Array2<f64>,
    pub response: Array1<f64>,
    pub fitted_values: Array1<f64>,
    /// Response residuals `y − Xβ̂`
    pub residuals: Array1<f64>,
    /// Residuals of the problem actually solved (pre-whitened when fitted with a
    /// correlation structure, otherwise equal to the response residuals)
    pub working_residuals: Array1<f64>,
    /// Working residuals divided by `√scale`
    pub normalized_residuals: Array1<f64>,
    pub edf_per_coef: Array1<f64>,
    pub edf: f64,
    pub residual_df: f64,
    pub scale: f64,
    /// -REML (or GCV) score at the optimum
    pub score: f64,
    pub rss: f64,
    pub r_sq_adj: f64,
    pub deviance_explained: f64,
    pub aic: f64,
    pub log_det_r: f64,
    pub convergence: Convergence,
}

impl FittedGAM {
    pub fn n(&self) -> usize {
        self.response.len()
    }

    pub fn smooth(&self, name: &str) -> Option<&FittedSmooth> {
        self.smooths
            .iter()
            .find(|s| s.term.spec.var == name || s.term.label() == name)
    }

    /// Design matrix for new covariate values
    pub fn design_for(&self, data: &PredictionData) -> Result<Array2<f64>> {
        let n = data.len()?;
        let p = self.coefficients.len();
        let mut x = Array2::zeros((n, p));
        x.column_mut(0).fill(1.0);
        for (j, name) in self.linear_columns.iter().enumerate() {
            let values = data.get(name)?;
            x.column_mut(j + 1).assign(values);
        }
        for smooth in &self.smooths {
            let term = &smooth.term;
            let block = term.evaluate(data.get(&term.spec.var)?)?;
            x.slice_mut(s![.., term.offset..term.offset + term.size])
                .assign(&block);
        }
        Ok(x)
    }

    /// Linear predictor and its standard error at new covariate values
    pub fn predict(&self, data: &PredictionData) -> Result<Prediction> {
        let x = self.design_for(data)?;
        let fit = x.dot(&self.coefficients);
        let se = rowwise_se(&x, &self.vp);
        Ok(Prediction { fit, se })
    }

    /// Centred contribution of one smooth on a grid of covariate values
    pub fn partial_effect(&self, name: &str, grid: &Array1<f64>) -> Result<Prediction> {
        let smooth = self
            .smooth(name)
            .ok_or_else(|| GAMError::InvalidParameter(format!("model has no smooth of '{}'", name)))?;
        let term = &smooth.term;
        let range = term.offset..term.offset + term.size;

        let x = term.evaluate(grid)?;
        let beta = self.coefficients.slice(s![range.clone()]);
        let v = self.vp.slice(s![range.clone(), range]).to_owned();
        Ok(Prediction {
            fit: x.dot(&beta),
            se: rowwise_se(&x, &v),
        })
    }

    /// Partial effect at the observed covariate values plus response residuals
    pub fn partial_residuals(&self, name: &str) -> Result<Array1<f64>> {
        let smooth = self
            .smooth(name)
            .ok_or_else(|| GAMError::InvalidParameter(format!("model has no smooth of '{}'", name)))?;
        let effect = self.partial_effect(name, &smooth.term.covariate)?;
        Ok(&effect.fit + &self.residuals)
    }

    fn parametric_table(&self) -> Result<Vec<ParametricRow>> {
        let df = self.residual_df.max(1.0);
        let t_dist = StudentsT::new(0.0, 1.0, df).map_err(|e| GAMError::InvalidParameter(e.to_string()))?;
        Ok((0..self.n_parametric)
            .map(|j| {
                let estimate = self.coefficients[j];
                let std_error = self.vp[[j, j]].max(0.0).sqrt();
                let t_value = estimate / std_error;
                let p_value = 2.0 * (1.0 - t_dist.cdf(t_value.abs()));
                ParametricRow {
                    name: self.coef_names[j].clone(),
                    estimate,
                    std_error,
                    t_value,
                    p_value,
                }
            })
            .collect())
    }

    /// Wald test of a smooth against zero using a pseudo-inverse of its
    /// covariance block truncated to rank `round(edf)`
    fn smooth_test(&self, smooth: &FittedSmooth) -> Result<SmoothRow> {
        let term = &smooth.term;
        let range = term.offset..term.offset + term.size;
        let beta = self.coefficients.slice(s![range.clone()]).to_owned();
        let v = self.vp.slice(s![range.clone(), range]).to_owned();

        let rank = (smooth.edf.round() as usize).clamp(1, term.size);
        let v_inv = truncated_pinv(&v, rank)?;
        let f_value = beta.dot(&v_inv.dot(&beta)) / rank as f64;

        let df2 = self.residual_df.max(1.0);
        let f_dist = FisherSnedecor::new(rank as f64, df2)
            .map_err(|e| GAMError::InvalidParameter(e.to_string()))?;
        let p_value = if f_value.is_finite() {
            (1.0 - f_dist.cdf(f_value)).max(0.0)
        } else {
            f64::NAN
        };

        Ok(SmoothRow {
            label: term.label(),
            edf: smooth.edf,
            ref_df: rank as f64,
            f_value,
            p_value,
        })
    }

    pub fn summary(&self) -> Result<GAMSummary> {
        let parametric = self.parametric_table()?;
        let smooths = self
            .smooths
            .iter()
            .map(|s| self.smooth_test(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(GAMSummary {
            formula: self.formula.to_string(),
            method: self.method,
            parametric,
            smooths,
            r_sq_adj: self.r_sq_adj,
            deviance_explained: self.deviance_explained,
            score: self.score,
            scale: self.scale,
            n: self.n(),
            correlation: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParametricRow {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct SmoothRow {
    pub label: String,
    pub edf: f64,
    pub ref_df: f64,
    pub f_value: f64,
    pub p_value: f64,
}

/// Summary tables of a fitted model, displayed like mgcv's `summary.gam`
#[derive(Debug, Clone)]
pub struct GAMSummary {
    pub formula: String,
    pub method: OptimizationMethod,
    pub parametric: Vec<ParametricRow>,
    pub smooths: Vec<SmoothRow>,
    pub r_sq_adj: f64,
    pub deviance_explained: f64,
    pub score: f64,
    pub scale: f64,
    pub n: usize,
    /// Estimated AR(1) correlation, when the model has one
    pub correlation: Option<f64>,
}

pub fn format_p_value(p: f64) -> String {
    if p.is_nan() {
        "NA".to_string()
    } else if p < 2e-16 {
        "< 2e-16".to_string()
    } else if p < 1e-4 {
        format!("{:.2e}", p)
    } else {
        format!("{:.4}", p)
    }
}

fn significance_stars(p: f64) -> &'static str {
    match p {
        p if p < 0.001 => "***",
        p if p < 0.01 => "**",
        p if p < 0.05 => "*",
        p if p < 0.1 => ".",
        _ => "",
    }
}

impl fmt::Display for GAMSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Family: gaussian")?;
        writeln!(f, "Link function: identity")?;
        writeln!(f)?;
        writeln!(f, "Formula:")?;
        writeln!(f, "{}", self.formula)?;
        if let Some(rho) = self.correlation {
            writeln!(f, "Correlation: AR(1), Phi = {:.4}", rho)?;
        }
        writeln!(f)?;

        let name_width = self
            .parametric
            .iter()
            .map(|r| r.name.len())
            .chain(self.smooths.iter().map(|r| r.label.len()))
            .max()
            .unwrap_or(10)
            .max(11);

        writeln!(f, "Parametric coefficients:")?;
        writeln!(
            f,
            "{:<w$} {:>10} {:>10} {:>8} {:>10}",
            "", "Estimate", "Std. Error", "t value", "Pr(>|t|)",
            w = name_width
        )?;
        for row in &self.parametric {
            writeln!(
                f,
                "{:<w$} {:>10.4} {:>10.4} {:>8.3} {:>10} {}",
                row.name,
                row.estimate,
                row.std_error,
                row.t_value,
                format_p_value(row.p_value),
                significance_stars(row.p_value),
                w = name_width
            )?;
        }

        if !self.smooths.is_empty() {
            writeln!(f)?;
            writeln!(f, "Approximate significance of smooth terms:")?;
            writeln!(
                f,
                "{:<w$} {:>7} {:>7} {:>8} {:>10}",
                "", "edf", "Ref.df", "F", "p-value",
                w = name_width
            )?;
            for row in &self.smooths {
                writeln!(
                    f,
                    "{:<w$} {:>7.3} {:>7.3} {:>8.3} {:>10} {}",
                    row.label,
                    row.edf,
                    row.ref_df,
                    row.f_value,
                    format_p_value(row.p_value),
                    significance_stars(row.p_value),
                    w = name_width
                )?;
            }
        }
        writeln!(f, "---")?;
        writeln!(f, "Signif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1")?;
        writeln!(f)?;
        writeln!(
            f,
            "R-sq.(adj) = {:.3}   Deviance explained = {:.1}%",
            self.r_sq_adj,
            100.0 * self.deviance_explained
        )?;
        let score_label = match self.method {
            OptimizationMethod::REML => "-REML",
            OptimizationMethod::GCV => "GCV",
        };
        write!(
            f,
            "{} = {:.4}  Scale est. = {:.5}  n = {}",
            score_label, self.score, self.scale, self.n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observation;
    use crate::linalg::solve;
    use approx::assert_abs_diff_eq;

    /// Deterministic monthly series: log flow = seasonal + rain effect + trend + noise
    fn synthetic_dataset(n: usize) -> Dataset {
        let observations = (0..n)
            .map(|i| {
                let t = (i + 1) as f64;
                let moy = (i % 12) as u32 + 1;
                let rain = 50.0 + 30.0 * ((i * 7919) % 97) as f64 / 97.0;
                let soi = ((i * 104729) % 41) as f64 / 10.0 - 2.0;
                let noise = 0.1 * (((i * 37) % 23) as f64 / 23.0 - 0.5);
                let log_flow = 1.0
                    + 0.5 * (2.0 * std::f64::consts::PI * moy as f64 / 12.0).sin()
                    + 0.02 * rain
                    + 0.1 * soi
                    + 0.002 * t
                    + noise;
                Observation {
                    month: format!("m{}", i),
                    flow: log_flow.exp(),
                    rain,
                    soi,
                    moy,
                    time: t,
                    log_flow: None,
                }
            })
            .collect();
        Dataset::from_observations(observations).unwrap()
    }

    #[test]
    fn test_linear_model_matches_ols() {
        let data = synthetic_dataset(120);
        let gam = GAM::from_formula("log_flow ~ rain + SOI").unwrap();
        let fitted = gam.fit(&data, &FitOptions::default()).unwrap();

        let n = data.len();
        let mut x = Array2::ones((n, 3));
        x.column_mut(1).assign(&data.column("rain").unwrap());
        x.column_mut(2).assign(&data.column("SOI").unwrap());
        let y = data.column("log_flow").unwrap();
        let beta = solve(x.t().dot(&x), x.t().dot(&y)).unwrap();

        for j in 0..3 {
            assert_abs_diff_eq!(fitted.coefficients[j], beta[j], epsilon = 1e-6);
        }
        assert_abs_diff_eq!(fitted.edf, 3.0, epsilon = 1e-6);
        assert!(fitted.convergence.converged);
        // scale is the usual residual variance
        assert_abs_diff_eq!(fitted.scale, fitted.rss / (n as f64 - 3.0), epsilon = 1e-8);
        assert!(fitted.smooths.is_empty());
    }

    #[test]
    fn test_smooth_model_structure() {
        let data = synthetic_dataset(144);
        let gam = GAM::from_formula("log_flow ~ s(rain) + s(moy, bs=\"cc\", k=12) + s(time, k=5)").unwrap();
        let options = FitOptions::default().with_cyclic_period("moy", 0.5, 12.5);
        let model = gam.model_matrix(&data, &options).unwrap();
        // intercept + (10-1) + (12-1-1) + (5-1)
        assert_eq!(model.p(), 1 + 9 + 10 + 4);
        assert_eq!(model.penalties.len(), 3);
        assert_eq!(model.coef_names.len(), model.p());
        // constrained smooth columns sum to zero
        for term in &model.smooths {
            for j in term.offset..term.offset + term.size {
                assert_abs_diff_eq!(model.x.column(j).sum(), 0.0, epsilon = 1e-8);
            }
        }

        let fitted = gam.fit_model_matrix(&model, &options).unwrap();
        assert!(fitted.r_sq_adj > 0.8, "r2 = {}", fitted.r_sq_adj);
        let seasonal = fitted.smooth("moy").unwrap();
        assert!(seasonal.edf > 1.0);
        // residuals of the fit sum to zero through the intercept
        assert_abs_diff_eq!(fitted.residuals.sum(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cyclic_period_applies_to_its_variable_only() {
        let data = synthetic_dataset(144);
        let gam = GAM::from_formula(
            "log_flow ~ s(moy, bs=\"cc\", k=12) + s(time, bs=\"cc\", k=6)",
        )
        .unwrap();
        let options = FitOptions::default().with_cyclic_period("moy", 0.5, 12.5);
        let model = gam.model_matrix(&data, &options).unwrap();
        let moy = &model.smooths[0];
        let time = &model.smooths[1];

        // moy wraps with the month-of-year period
        let ends = moy.evaluate(&Array1::from_vec(vec![0.5, 12.5, 1.0, 13.0])).unwrap();
        for j in 0..moy.size {
            assert_abs_diff_eq!(ends[[0, j]], ends[[1, j]], epsilon = 1e-10);
            assert_abs_diff_eq!(ends[[2, j]], ends[[3, j]], epsilon = 1e-10);
        }

        // time wraps over its own range, so points a year apart differ
        let rows = time.evaluate(&Array1::from_vec(vec![1.0, 13.0, 133.0])).unwrap();
        let distance = |a: usize, b: usize| {
            (0..time.size)
                .map(|j| (rows[[a, j]] - rows[[b, j]]).abs())
                .fold(0.0, f64::max)
        };
        assert!(distance(0, 1) > 1e-3);
        assert!(distance(0, 2) > 1e-3);
        assert!(distance(1, 2) > 1e-3);

        assert_eq!(options.cyclic_period("moy"), Some((0.5, 12.5)));
        assert_eq!(options.cyclic_period("time"), None);
        let soi = FitOptions::default().with_cyclic_period("soi", -3.0, 3.0);
        assert_eq!(soi.cyclic_period("SOI"), Some((-3.0, 3.0)));
    }

    #[test]
    fn test_predict_reproduces_fitted_values() {
        let data = synthetic_dataset(120);
        let gam = GAM::from_formula("log_flow ~ SOI + s(rain, k=6)").unwrap();
        let fitted = gam.fit(&data, &FitOptions::default()).unwrap();

        let newdata = PredictionData::from_dataset(&data, &["rain", "SOI"]).unwrap();
        let pred = fitted.predict(&newdata).unwrap();
        for i in 0..data.len() {
            assert_abs_diff_eq!(pred.fit[i], fitted.fitted_values[i], epsilon = 1e-8);
            assert!(pred.se[i] > 0.0);
        }

        let grid = Array1::linspace(50.0, 80.0, 25);
        let effect = fitted.partial_effect("rain", &grid).unwrap();
        assert_eq!(effect.fit.len(), 25);
        // rain enters linearly, so the smooth is close to a straight line
        let slope = (effect.fit[24] - effect.fit[0]) / 30.0;
        assert_abs_diff_eq!(slope, 0.02, epsilon = 0.012);
        assert!(fitted.partial_effect("time", &grid).is_err());
    }

    #[test]
    fn test_summary_renders() {
        let data = synthetic_dataset(120);
        let gam = GAM::from_formula("log_flow ~ SOI + s(rain, k=6) + s(moy, bs=\"cc\", k=12)").unwrap();
        let options = FitOptions::default().with_cyclic_period("moy", 0.5, 12.5);
        let fitted = gam.fit(&data, &options).unwrap();
        let summary = fitted.summary().unwrap();

        assert_eq!(summary.parametric.len(), 2);
        assert_eq!(summary.smooths.len(), 2);
        assert!(summary.smooths[1].p_value < 1e-6);
        assert!(summary.parametric[1].p_value < 1e-6);
        let text = summary.to_string();
        assert!(text.contains("Parametric coefficients:"));
        assert!(text.contains("s(rain)"));
        assert!(text.contains("-REML"));
    }

    #[test]
    fn test_unknown_column_is_an_error() {
        let data = synthetic_dataset(40);
        let gam = GAM::from_formula("log_flow ~ s(stage)").unwrap();
        assert!(matches!(
            gam.fit(&data, &FitOptions::default()),
            Err(GAMError::Data(_))
        ));
    }

    #[test]
    fn test_format_p_value() {
        assert_eq!(format_p_value(1e-20), "< 2e-16");
        assert_eq!(format_p_value(0.5), "0.5000");
        assert_eq!(format_p_value(f64::NAN), "NA");
    }
}
