//! flowgam: Generalized Additive Models for monthly streamflow
//!
//! Fits a sequence of increasingly flexible models to a monthly streamflow
//! record (linear, log-linear, additive smooths, cyclic seasonal smooth, AR(1)
//! residual correlation), with smoothing parameters chosen by REML, and renders
//! the fits, diagnostics and commentary as a single HTML document.
//!
//! The fitting engine follows R's mgcv: penalized cubic regression splines with
//! absorbed sum-to-zero constraints, penalized least squares, and Newton
//! optimisation of the REML criterion over log smoothing parameters.

pub mod basis;
pub mod penalty;
pub mod linalg;
pub mod pls;
pub mod reml;
pub mod smooth;
pub mod formula;
pub mod data;
pub mod gam;
pub mod ar1;
pub mod diagnostics;
pub mod svg;
pub mod report;
pub mod config;
pub mod workflow;

pub use basis::{BasisFunction, CubicRegressionSpline, CyclicCubicSpline};
pub use data::{Dataset, Observation};
pub use formula::ModelFormula;
pub use gam::{FitOptions, FittedGAM, GAM};
pub use ar1::{fit_ar1, Ar1Fit, Ar1Options};
pub use smooth::OptimizationMethod;
pub use workflow::{Workflow, WorkflowOutcome};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GAMError {
    #[error("Matrix dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("Singular matrix encountered")]
    SingularMatrix,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Linear algebra error: {0}")]
    LinAlgError(String),

    #[error(transparent)]
    Formula(#[from] formula::FormulaError),

    #[error(transparent)]
    Data(#[from] data::DataError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<GAMError>,
    },
}

pub type Result<T> = std::result::Result<T, GAMError>;
