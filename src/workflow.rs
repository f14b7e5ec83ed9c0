//! The analysis sequence
//!
//! Every configured stage is fitted on the rayon pool together with its
//! diagnostics. The report is then assembled in stage order, so the document
//! does not depend on scheduling. A stage whose fit fails aborts the run with
//! the stage name attached; a fit that did not converge is flagged in the
//! document and the log but kept.

use ndarray::Array1;
use rayon::prelude::*;
use tracing::{info, warn};
use crate::ar1::{fit_ar1, Ar1Fit, Ar1Options};
use crate::config::{AnalysisConfig, Figure, StageConfig};
use crate::data::Dataset;
use crate::diagnostics::{
    acf, breusch_pagan, format_k_check, k_check, ljung_box, pacf, Correlogram, KCheckRow,
    ResidualChecks, TestResult,
};
use crate::gam::{format_p_value, FitOptions, FittedGAM, GAMSummary, GAM};
use crate::report::{Report, Section};
use crate::svg::{Chart, Grid, BAND, BLUE, GREEN, GREY, ORANGE, RED};
use crate::{GAMError, Result};

/// Points on the grid used to draw smooths
const EFFECT_GRID: usize = 100;
/// Multiplier for the pointwise confidence bands
const BAND_Z: f64 = 2.0;
const PANEL_WIDTH: f64 = 420.0;
const PANEL_HEIGHT: f64 = 300.0;

/// A stage's fitted model, with or without residual correlation
#[derive(Debug, Clone)]
pub enum StageModel {
    Independent(FittedGAM),
    Correlated(Ar1Fit),
}

impl StageModel {
    pub fn gam(&self) -> &FittedGAM {
        match self {
            StageModel::Independent(fit) => fit,
            StageModel::Correlated(fit) => &fit.gam,
        }
    }

    pub fn summary(&self) -> Result<GAMSummary> {
        match self {
            StageModel::Independent(fit) => fit.summary(),
            StageModel::Correlated(fit) => fit.summary(),
        }
    }

    pub fn aic(&self) -> f64 {
        match self {
            StageModel::Independent(fit) => fit.aic,
            StageModel::Correlated(fit) => fit.aic,
        }
    }

    pub fn correlation(&self) -> Option<f64> {
        match self {
            StageModel::Independent(_) => None,
            StageModel::Correlated(fit) => Some(fit.rho),
        }
    }

    /// Root mean squared residual on the response scale
    pub fn rmse(&self) -> f64 {
        let residuals = match self {
            StageModel::Independent(fit) => &fit.residuals,
            StageModel::Correlated(fit) => &fit.raw_residuals,
        };
        (residuals.dot(residuals) / residuals.len() as f64).sqrt()
    }

    /// Residuals that should look like white noise when the model is adequate
    pub fn model_residuals(&self) -> &Array1<f64> {
        match self {
            StageModel::Independent(fit) => &fit.residuals,
            StageModel::Correlated(fit) => &fit.normalized_residuals,
        }
    }

    /// Messages of every optimisation that stopped short of convergence
    pub fn convergence_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let inner = &self.gam().convergence;
        if !inner.converged {
            problems.push(format!(
                "Smoothing parameter estimation did not converge after {} iterations ({}).",
                inner.iterations, inner.message
            ));
        }
        if let StageModel::Correlated(fit) = self {
            if !fit.convergence.converged {
                problems.push(format!(
                    "AR(1) correlation estimate did not converge: {}.",
                    fit.convergence.message
                ));
            }
        }
        problems
    }
}

#[derive(Debug, Clone)]
pub struct StageDiagnostics {
    pub residual_checks: ResidualChecks,
    pub breusch_pagan: TestResult,
    /// Correlogram of [`StageModel::model_residuals`]
    pub acf: Correlogram,
    pub pacf: Correlogram,
    pub ljung_box: TestResult,
    /// Correlogram of the raw residuals of a correlated model
    pub raw_acf: Option<Correlogram>,
    pub k_check: Vec<KCheckRow>,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub config: StageConfig,
    pub model: StageModel,
    pub summary: GAMSummary,
    pub diagnostics: StageDiagnostics,
}

impl StageResult {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn converged(&self) -> bool {
        self.model.convergence_problems().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub stages: Vec<StageResult>,
    pub report: Report,
}

impl WorkflowOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn html(&self) -> String {
        self.report.render()
    }
}

pub struct Workflow {
    config: AnalysisConfig,
}

impl Workflow {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    fn fit_options(&self, stage: &StageConfig) -> FitOptions {
        self.config.analysis.fit_options(stage.method)
    }

    /// Fit one stage and compute its diagnostics
    pub fn run_stage(&self, stage: &StageConfig, data: &Dataset) -> Result<StageResult> {
        info!(stage = %stage.name, formula = %stage.formula, "fitting stage");
        let gam = GAM::from_formula(&stage.formula)?;
        let fit_options = self.fit_options(stage);

        let model = if stage.ar1 {
            let options = Ar1Options {
                fit: fit_options,
                ..Ar1Options::default()
            };
            StageModel::Correlated(fit_ar1(&gam, data, &options)?)
        } else {
            StageModel::Independent(gam.fit(data, &fit_options)?)
        };

        let settings = &self.config.analysis;
        let fitted = model.gam();
        let residuals = model.model_residuals();
        let fitted_df = usize::from(stage.ar1);

        let raw_acf = match &model {
            StageModel::Correlated(fit) => Some(acf(&fit.raw_residuals, settings.acf_max_lag)?),
            StageModel::Independent(_) => None,
        };
        let k_check_rows = if stage.figures.contains(&Figure::KCheck) {
            k_check(fitted, settings.k_check_reps, settings.seed)?
        } else {
            Vec::new()
        };

        let diagnostics = StageDiagnostics {
            residual_checks: ResidualChecks::from_fit(fitted)?,
            breusch_pagan: breusch_pagan(&fitted.residuals, &fitted.fitted_values)?,
            acf: acf(residuals, settings.acf_max_lag)?,
            pacf: pacf(residuals, settings.acf_max_lag)?,
            ljung_box: ljung_box(residuals, settings.ljung_box_lags, fitted_df)?,
            raw_acf,
            k_check: k_check_rows,
        };

        let summary = model.summary()?;
        let problems = model.convergence_problems();
        if problems.is_empty() {
            info!(
                stage = %stage.name,
                edf = fitted.edf,
                aic = model.aic(),
                "stage finished"
            );
        } else {
            for problem in &problems {
                warn!(stage = %stage.name, "{}", problem);
            }
        }

        Ok(StageResult {
            config: stage.clone(),
            model,
            summary,
            diagnostics,
        })
    }

    pub fn run(&self, data: &Dataset) -> Result<WorkflowOutcome> {
        info!(
            stages = self.config.stages.len(),
            n = data.len(),
            "running analysis"
        );
        let results: Vec<Result<StageResult>> = self
            .config
            .stages
            .par_iter()
            .map(|stage| {
                self.run_stage(stage, data).map_err(|e| GAMError::Stage {
                    stage: stage.name.clone(),
                    source: Box::new(e),
                })
            })
            .collect();
        let stages = results.into_iter().collect::<Result<Vec<_>>>()?;

        let report = self.build_report(data, &stages)?;
        info!(figures = report.figure_count(), "report assembled");
        Ok(WorkflowOutcome { stages, report })
    }

    fn build_report(&self, data: &Dataset, stages: &[StageResult]) -> Result<Report> {
        let mut report = Report::new(&self.config.analysis.title);
        report.push(data_section(data)?);
        for stage in stages {
            report.push(self.stage_section(data, stage, stages)?);
        }
        report.push(comparison_section(stages));
        Ok(report)
    }

    fn stage_section(&self, data: &Dataset, stage: &StageResult, all: &[StageResult]) -> Result<Section> {
        let config = &stage.config;
        let fitted = stage.model.gam();
        let mut section = Section::new(&config.heading);
        section.paragraph(&config.prose);
        section.preformatted(&stage.summary.to_string());
        section.paragraph(&format!(
            "AIC {:.1}, total edf {:.2}, residual df {:.1}.",
            stage.model.aic(),
            fitted.edf,
            fitted.residual_df
        ));
        for problem in stage.model.convergence_problems() {
            section.note(&problem);
        }

        for figure in &config.figures {
            match figure {
                Figure::Predictions => predictions_block(&mut section, data, fitted)?,
                Figure::ResidualChecks => residual_checks_block(&mut section, stage),
                Figure::Smooths => smooths_block(&mut section, fitted)?,
                Figure::KCheck => k_check_block(&mut section, &stage.diagnostics.k_check),
                Figure::Acf => acf_block(&mut section, &stage.diagnostics),
                Figure::AcfComparison => acf_comparison_block(&mut section, stage),
                Figure::SmoothComparison => {
                    let other = config
                        .compare_with
                        .as_deref()
                        .and_then(|name| all.iter().find(|s| s.name() == name))
                        .ok_or_else(|| {
                            GAMError::InvalidParameter(format!(
                                "stage '{}' has no stage to compare with",
                                config.name
                            ))
                        })?;
                    smooth_comparison_block(&mut section, stage, other)?;
                }
            }
        }
        Ok(section)
    }
}

fn pairs(x: &Array1<f64>, y: &Array1<f64>) -> Vec<(f64, f64)> {
    x.iter().copied().zip(y.iter().copied()).collect()
}

fn value_range(x: &Array1<f64>) -> (f64, f64) {
    x.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn panel(title: &str) -> Chart {
    Chart::new(title).size(PANEL_WIDTH, PANEL_HEIGHT)
}

fn data_section(data: &Dataset) -> Result<Section> {
    let time = data.column("time")?;
    let flow = data.column("flow")?;
    let log_flow = data.column("log_flow")?;
    let observations = data.observations();

    let mut section = Section::new("The data");
    if let (Some(first), Some(last)) = (observations.first(), observations.last()) {
        section.paragraph(&format!(
            "The record holds {} monthly observations of streamflow, rainfall and the Southern \
             Oscillation Index, from {} to {}.",
            data.len(),
            first.month,
            last.month
        ));
    }
    let breaks = data.series_breaks();
    if !breaks.is_empty() {
        section.note(&format!(
            "The series has {} gap(s) in time; residual correlation restarts after each.",
            breaks.len()
        ));
    }

    let grid = Grid::new(2)
        .push(panel("Flow").x_label("time").y_label("flow").line(pairs(&time, &flow), BLUE))
        .push(
            panel("Log flow")
                .x_label("time")
                .y_label("log flow")
                .line(pairs(&time, &log_flow), BLUE),
        );
    section.figure(grid.render(), "Monthly flow on the original and the log scale.");
    Ok(section)
}

fn predictions_block(section: &mut Section, data: &Dataset, fitted: &FittedGAM) -> Result<()> {
    let time = data.column("time")?;
    let chart = Chart::new("Observed and fitted")
        .size(2.0 * PANEL_WIDTH, PANEL_HEIGHT)
        .x_label("time")
        .y_label(&fitted.formula.response)
        .points(pairs(&time, &fitted.response), GREY)
        .line(pairs(&time, &fitted.fitted_values), BLUE);
    section.figure(chart.render(), "Observations (grey) and fitted values (blue) over time.");
    Ok(())
}

fn residual_checks_block(section: &mut Section, stage: &StageResult) {
    let checks = &stage.diagnostics.residual_checks;
    let n = checks.residuals.len() as f64;
    let mean = checks.residuals.sum() / n;
    let sd = (checks.residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0)).sqrt();

    let mut qq = panel("Normal QQ plot")
        .x_label("theoretical quantiles")
        .y_label("residuals")
        .points(checks.qq.clone(), BLUE);
    if let (Some(first), Some(last)) = (checks.qq.first(), checks.qq.last()) {
        qq = qq.line(
            vec![(first.0, mean + sd * first.0), (last.0, mean + sd * last.0)],
            RED,
        );
    }

    let histogram: Vec<(f64, f64)> = checks
        .histogram
        .iter()
        .map(|b| ((b.lower + b.upper) / 2.0, b.count as f64))
        .collect();

    let grid = Grid::new(2)
        .push(qq)
        .push(
            panel("Residuals vs fitted")
                .x_label("fitted values")
                .y_label("residuals")
                .points(pairs(&checks.fitted, &checks.residuals), BLUE)
                .hline(0.0, GREY, true),
        )
        .push(
            panel("Histogram of residuals")
                .x_label("residuals")
                .y_label("count")
                .bars(histogram, BLUE),
        )
        .push(
            panel("Response vs fitted")
                .x_label("fitted values")
                .y_label("response")
                .points(pairs(&checks.fitted, &checks.response), BLUE),
        );
    section.figure(grid.render(), "Residual checks.");

    let bp = &stage.diagnostics.breusch_pagan;
    section.preformatted(&format!(
        "Studentized Breusch-Pagan test\nBP = {:.3}, df = {}, p-value = {}",
        bp.statistic,
        bp.df,
        format_p_value(bp.p_value)
    ));
    if bp.p_value < 0.05 {
        section.paragraph("The residual variance changes with the fitted values.");
    }
}

/// Effect curve, ±2 SE band and partial residuals for one smooth
fn effect_chart(fitted: &FittedGAM, var: &str, title: &str) -> Result<Chart> {
    let smooth = fitted
        .smooth(var)
        .ok_or_else(|| GAMError::InvalidParameter(format!("model has no smooth of '{}'", var)))?;
    let (lo, hi) = value_range(&smooth.term.covariate);
    let grid = Array1::linspace(lo, hi, EFFECT_GRID);
    let effect = fitted.partial_effect(var, &grid)?;
    let (lower, upper) = effect.band(BAND_Z);
    let partial = fitted.partial_residuals(var)?;

    Ok(panel(title)
        .x_label(var)
        .y_label(&smooth.term.label())
        .points(pairs(&smooth.term.covariate, &partial), GREY)
        .band(grid.to_vec(), lower.to_vec(), upper.to_vec(), BAND)
        .line(pairs(&grid, &effect.fit), BLUE)
        .hline(0.0, GREY, true))
}

fn smooths_block(section: &mut Section, fitted: &FittedGAM) -> Result<()> {
    if fitted.smooths.is_empty() {
        return Ok(());
    }
    let mut grid = Grid::new(2);
    for smooth in &fitted.smooths {
        let title = format!("{}, edf {:.2}", smooth.term.label(), smooth.edf);
        grid = grid.push(effect_chart(fitted, &smooth.term.spec.var, &title)?);
    }
    section.figure(
        grid.render(),
        "Estimated smooths with approximate 95% confidence bands and partial residuals.",
    );
    Ok(())
}

fn k_check_block(section: &mut Section, rows: &[KCheckRow]) {
    if rows.is_empty() {
        return;
    }
    section.preformatted(&format!("Basis dimension (k) checking results\n{}", format_k_check(rows)));
    let low: Vec<&str> = rows
        .iter()
        .filter(|r| r.suggests_larger_k())
        .map(|r| r.label.as_str())
        .collect();
    if !low.is_empty() {
        section.note(&format!(
            "The basis dimension may be too low for {}.",
            low.join(", ")
        ));
    }
}

fn correlogram_chart(title: &str, c: &Correlogram, color: &str) -> Chart {
    let bars = c
        .values
        .iter()
        .enumerate()
        .skip(1)
        .map(|(k, &v)| (k as f64, v))
        .collect();
    panel(title)
        .x_label("lag")
        .bars(bars, color)
        .hline(0.0, GREY, false)
        .hline(c.bound, RED, true)
        .hline(-c.bound, RED, true)
}

fn acf_block(section: &mut Section, diagnostics: &StageDiagnostics) {
    let grid = Grid::new(2)
        .push(correlogram_chart("ACF of residuals", &diagnostics.acf, BLUE).y_label("ACF"))
        .push(correlogram_chart("PACF of residuals", &diagnostics.pacf, BLUE).y_label("partial ACF"));
    section.figure(
        grid.render(),
        "Residual autocorrelation; dashed lines mark the approximate 95% white noise bounds.",
    );
    let significant = diagnostics.acf.significant_lags();
    if !significant.is_empty() {
        let lags: Vec<String> = significant.iter().map(|k| k.to_string()).collect();
        section.paragraph(&format!(
            "The autocorrelation exceeds the white noise bounds at lag(s) {}.",
            lags.join(", ")
        ));
    }
    let lb = &diagnostics.ljung_box;
    section.preformatted(&format!(
        "Box-Ljung test\nX-squared = {:.3}, df = {}, p-value = {}",
        lb.statistic,
        lb.df,
        format_p_value(lb.p_value)
    ));
}

fn acf_comparison_block(section: &mut Section, stage: &StageResult) {
    let diagnostics = &stage.diagnostics;
    let mut grid = Grid::new(2);
    if let Some(raw) = &diagnostics.raw_acf {
        grid = grid.push(correlogram_chart("Raw residuals", raw, ORANGE).y_label("ACF"));
    }
    grid = grid.push(correlogram_chart("Normalized residuals", &diagnostics.acf, BLUE).y_label("ACF"));

    if let StageModel::Correlated(fit) = &stage.model {
        let profile: Vec<(f64, f64)> = fit
            .sorted_profile()
            .iter()
            .map(|p| (p.rho, p.criterion))
            .collect();
        grid = grid.push(
            panel("Profile of the AR(1) parameter")
                .x_label("rho")
                .y_label("-REML")
                .line(profile.clone(), GREY)
                .points(profile, GREEN),
        );
        section.paragraph(&format!(
            "The estimated lag-one correlation of the residuals is {:.3}.",
            fit.rho
        ));
    }
    section.figure(
        grid.render(),
        "Autocorrelation of the raw residuals and of the residuals normalized by the AR(1) model.",
    );
    let lb = &diagnostics.ljung_box;
    section.preformatted(&format!(
        "Box-Ljung test (normalized residuals)\nX-squared = {:.3}, df = {}, p-value = {}",
        lb.statistic,
        lb.df,
        format_p_value(lb.p_value)
    ));
}

fn smooth_comparison_block(section: &mut Section, stage: &StageResult, other: &StageResult) -> Result<()> {
    let this_fit = stage.model.gam();
    let other_fit = other.model.gam();
    let mut grid = Grid::new(2);

    for smooth in &this_fit.smooths {
        let var = &smooth.term.spec.var;
        if other_fit.smooth(var).is_none() {
            continue;
        }
        let (lo, hi) = value_range(&smooth.term.covariate);
        let x = Array1::linspace(lo, hi, EFFECT_GRID);
        let this_effect = this_fit.partial_effect(var, &x)?;
        let other_effect = other_fit.partial_effect(var, &x)?;
        let (lower, upper) = this_effect.band(BAND_Z);
        let (other_lower, other_upper) = other_effect.band(BAND_Z);

        grid = grid.push(
            panel(&smooth.term.label())
                .x_label(var)
                .band(x.to_vec(), lower.to_vec(), upper.to_vec(), BAND)
                .line(pairs(&x, &this_effect.fit), BLUE)
                .line(pairs(&x, &other_effect.fit), ORANGE)
                .dashed_line(pairs(&x, &other_lower), ORANGE)
                .dashed_line(pairs(&x, &other_upper), ORANGE),
        );
    }
    if grid.is_empty() {
        return Ok(());
    }

    section.figure(
        grid.render(),
        &format!(
            "Smooths of this model (blue, shaded band) against '{}' (orange, dashed band).",
            other.config.heading
        ),
    );
    let rows = this_fit
        .smooths
        .iter()
        .filter_map(|s| {
            other_fit.smooth(&s.term.spec.var).map(|o| {
                vec![
                    s.term.label(),
                    format!("{:.2}", o.edf),
                    format!("{:.2}", s.edf),
                ]
            })
        })
        .collect();
    section.table(
        vec!["smooth".to_string(), format!("edf ({})", other.name()), format!("edf ({})", stage.name())],
        rows,
    );
    Ok(())
}

fn comparison_section(stages: &[StageResult]) -> Section {
    let mut section = Section::new("Model comparison");
    section.paragraph(
        "AIC is only comparable between models of the same response, so the untransformed \
         linear model stands apart from the rest.",
    );
    let rows = stages
        .iter()
        .map(|s| {
            let fitted = s.model.gam();
            vec![
                s.name().to_string(),
                fitted.formula.to_string(),
                s.model
                    .correlation()
                    .map(|rho| format!("{:.3}", rho))
                    .unwrap_or_else(|| "-".to_string()),
                format!("{:.2}", fitted.edf),
                format!("{:.1}", s.model.aic()),
                format!("{:.3}", fitted.r_sq_adj),
                format!("{:.1}%", 100.0 * fitted.deviance_explained),
                format!("{:.3}", s.model.rmse()),
                format!("{:.3}", s.diagnostics.acf.values.get(1).copied().unwrap_or(f64::NAN)),
            ]
        })
        .collect();
    section.table(
        ["stage", "formula", "AR(1)", "edf", "AIC", "R-sq.(adj)", "deviance explained", "RMSE", "lag-1 ACF"]
            .iter()
            .map(|h| h.to_string())
            .collect(),
        rows,
    );
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_stages;
    use crate::data::Observation;
    use crate::smooth::OptimizationMethod;

    fn dataset(n: usize) -> Dataset {
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
                    + noise;
                Observation {
                    month: format!("{}-{:02}", 2000 + i / 12, moy),
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

    fn config(stages: Vec<StageConfig>) -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.analysis.k_check_reps = 50;
        config.stages = stages;
        config
    }

    fn stage(name: &str, formula: &str, figures: &[Figure]) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            heading: format!("Stage {}", name),
            prose: "Some prose.".to_string(),
            formula: formula.to_string(),
            method: OptimizationMethod::REML,
            ar1: false,
            figures: figures.to_vec(),
            compare_with: None,
        }
    }

    #[test]
    fn test_linear_stage() {
        let workflow = Workflow::new(config(vec![stage(
            "linear",
            "flow ~ rain + SOI",
            &[Figure::Predictions, Figure::ResidualChecks],
        )]))
        .unwrap();
        let outcome = workflow.run(&dataset(96)).unwrap();
        let result = outcome.stage("linear").unwrap();
        assert!(result.converged());
        assert!(result.summary.smooths.is_empty());
        assert!(result.diagnostics.k_check.is_empty());
        assert!(result.diagnostics.raw_acf.is_none());
        let fitted = result.model.gam();
        assert!((result.model.rmse() - (fitted.rss / fitted.n() as f64).sqrt()).abs() < 1e-10);
        // data overview, predictions, residual checks
        assert_eq!(outcome.report.figure_count(), 3);
        assert_eq!(outcome.report.sections().len(), 3);
    }

    #[test]
    fn test_smooth_stage_figures() {
        let workflow = Workflow::new(config(vec![stage(
            "seasonal",
            "log_flow ~ s(rain, k=6) + s(moy, bs=\"cc\", k=12)",
            &[Figure::Smooths, Figure::KCheck, Figure::Acf],
        )]))
        .unwrap();
        let outcome = workflow.run(&dataset(96)).unwrap();
        let result = &outcome.stages[0];
        assert_eq!(result.diagnostics.k_check.len(), 2);
        assert_eq!(result.diagnostics.acf.max_lag(), 24);

        let html = outcome.html();
        assert!(html.contains("Basis dimension (k) checking results"));
        assert!(html.contains("Box-Ljung test"));
        assert!(html.contains("s(moy)"));
        assert_eq!(html.matches("<svg").count(), 3);
    }

    #[test]
    fn test_failing_stage_is_named() {
        let workflow = Workflow::new(config(vec![
            stage("fine", "log_flow ~ rain", &[]),
            stage("broken", "log_flow ~ s(elevation)", &[]),
        ]))
        .unwrap();
        match workflow.run(&dataset(60)) {
            Err(GAMError::Stage { stage, .. }) => assert_eq!(stage, "broken"),
            other => panic!("expected a stage error, got {:?}", other.map(|o| o.stages.len())),
        }
    }

    #[test]
    fn test_default_stage_sequence_runs() {
        let mut config = config(default_stages());
        config.analysis.k_check_reps = 20;
        let outcome = Workflow::new(config).unwrap().run(&dataset(144)).unwrap();
        assert_eq!(outcome.stages.len(), 6);
        let ar1 = outcome.stage("ar1").unwrap();
        let rho = ar1.model.correlation().unwrap();
        assert!(rho > -0.99 && rho < 0.99);
        assert!(ar1.diagnostics.raw_acf.is_some());
        assert_eq!(ar1.summary.correlation, Some(rho));
        let html = outcome.html();
        assert!(html.contains("Model comparison"));
        assert!(html.contains("<th>RMSE</th>"));
        let raw = match &ar1.model {
            StageModel::Correlated(fit) => &fit.raw_residuals,
            StageModel::Independent(_) => panic!("ar1 stage fitted without correlation"),
        };
        let expected = (raw.mapv(|r| r * r).sum() / raw.len() as f64).sqrt();
        assert!((ar1.model.rmse() - expected).abs() < 1e-10);
    }
}
