//! flowgam command line
//!
//! `flowgam report` runs the configured analysis and writes the HTML report;
//! `flowgam fit` fits a single formula and prints its summary and checks.

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use flowgam::config::AnalysisConfig;
use flowgam::diagnostics::{acf, breusch_pagan, format_k_check, k_check, ljung_box};
use flowgam::gam::format_p_value;
use flowgam::{fit_ar1, Ar1Options, Dataset, OptimizationMethod, Workflow, GAM};

#[derive(Parser)]
#[command(name = "flowgam")]
#[command(about = "GAM analysis of monthly streamflow", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis and write the HTML report
    Report {
        /// CSV with month, flow, rain, SOI, moy, time and optionally log_flow
        #[arg(short, long)]
        input: PathBuf,

        /// HTML file to write
        #[arg(short, long)]
        output: PathBuf,

        /// TOML file describing the stages (built-in sequence when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Fit one model and print its summary
    Fit {
        #[arg(short, long)]
        input: PathBuf,

        /// Model formula, e.g. "log_flow ~ s(rain) + s(moy, bs=\"cc\", k=12)"
        #[arg(short, long)]
        formula: String,

        /// Smoothing parameter criterion (reml or gcv)
        #[arg(short, long, default_value = "reml", value_parser = parse_method)]
        method: OptimizationMethod,

        /// Model the residuals as AR(1)
        #[arg(long)]
        ar1: bool,

        /// Permutations for the basis dimension check
        #[arg(long, default_value = "400")]
        k_check_reps: usize,
    },
}

fn parse_method(s: &str) -> std::result::Result<OptimizationMethod, String> {
    s.parse()
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install log subscriber")
}

fn load_data(input: &Path) -> Result<Dataset> {
    let data = Dataset::from_csv_path(input)
        .with_context(|| format!("failed to load data from {}", input.display()))?;
    info!(rows = data.len(), path = %input.display(), "data loaded");
    Ok(data)
}

fn report(input: PathBuf, output: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let config = AnalysisConfig::load(config.as_deref()).context("failed to load configuration")?;
    let data = load_data(&input)?;
    let workflow = Workflow::new(config)?;
    let outcome = workflow.run(&data).context("analysis failed")?;
    outcome
        .report
        .write_to(&output)
        .with_context(|| format!("failed to write report to {}", output.display()))?;

    for stage in &outcome.stages {
        if !stage.converged() {
            eprintln!("warning: stage '{}' did not fully converge", stage.name());
        }
    }
    println!(
        "Wrote {} ({} stages, {} figures)",
        output.display(),
        outcome.stages.len(),
        outcome.report.figure_count()
    );
    Ok(())
}

fn fit(
    input: PathBuf,
    formula: &str,
    method: OptimizationMethod,
    ar1: bool,
    k_check_reps: usize,
) -> Result<()> {
    let data = load_data(&input)?;
    let gam = GAM::from_formula(formula).context("invalid formula")?;
    let defaults = AnalysisConfig::default().analysis;
    let options = defaults.fit_options(method);

    let (fitted, summary, aic, residuals, fitted_df) = if ar1 {
        let fit = fit_ar1(
            &gam,
            &data,
            &Ar1Options {
                fit: options,
                ..Ar1Options::default()
            },
        )
        .context("AR(1) fit failed")?;
        let summary = fit.summary()?;
        let residuals = fit.normalized_residuals.clone();
        (fit.gam, summary, fit.aic, residuals, 1)
    } else {
        let fitted = gam.fit(&data, &options).context("fit failed")?;
        let summary = fitted.summary()?;
        let aic = fitted.aic;
        let residuals = fitted.residuals.clone();
        (fitted, summary, aic, residuals, 0)
    };

    println!("{}", summary);
    println!("AIC: {:.2}", aic);
    if !fitted.convergence.converged {
        println!("Warning: {}", fitted.convergence.message);
    }

    if !fitted.smooths.is_empty() {
        let rows = k_check(&fitted, k_check_reps, defaults.seed)?;
        println!("\nBasis dimension (k) checking results\n{}", format_k_check(&rows));
    }

    let correlogram = acf(&residuals, defaults.acf_max_lag)?;
    println!(
        "Lag-1 residual autocorrelation: {:.3} (bound ±{:.3})",
        correlogram.values.get(1).copied().unwrap_or(f64::NAN),
        correlogram.bound
    );
    let lb = ljung_box(&residuals, defaults.ljung_box_lags, fitted_df)?;
    println!(
        "Box-Ljung: X-squared = {:.3}, df = {}, p-value = {}",
        lb.statistic,
        lb.df,
        format_p_value(lb.p_value)
    );
    let bp = breusch_pagan(&fitted.residuals, &fitted.fitted_values)?;
    println!(
        "Breusch-Pagan: BP = {:.3}, df = {}, p-value = {}",
        bp.statistic,
        bp.df,
        format_p_value(bp.p_value)
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Report { input, output, config } => report(input, output, config),
        Commands::Fit {
            input,
            formula,
            method,
            ar1,
            k_check_reps,
        } => fit(input, &formula, method, ar1, k_check_reps),
    }
}
