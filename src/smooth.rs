//! Smoothing parameter selection
//!
//! Newton iteration on `ρ = log λ` for the REML or GCV criterion. The Hessian
//! is formed by forward differences of the criterion gradient, made positive
//! definite by a growing ridge when needed, and every step is backtracked until
//! the criterion decreases. Coordinates pinned at a bound with the gradient
//! pointing outwards are frozen (the term is effectively linear or
//! unpenalized there).

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::linalg::{cholesky, solve};
use crate::penalty::BlockPenalty;
use crate::pls::Gram;
use crate::reml::{gcv_criterion, reml_criterion, CriterionEval};
use crate::Result;

/// Bounds on log smoothing parameters
pub const RHO_MIN: f64 = -15.0;
pub const RHO_MAX: f64 = 25.0;

const MAX_STEP: f64 = 5.0;
const FD_STEP: f64 = 1e-4;

/// Smoothing parameter optimization method
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum OptimizationMethod {
    #[default]
    #[serde(alias = "reml")]
    REML,
    #[serde(alias = "gcv")]
    GCV,
}

impl OptimizationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationMethod::REML => "REML",
            OptimizationMethod::GCV => "GCV",
        }
    }
}

impl std::str::FromStr for OptimizationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REML" => Ok(OptimizationMethod::REML),
            "GCV" | "GCV.CP" => Ok(OptimizationMethod::GCV),
            other => Err(format!("unknown smoothing method '{}', expected REML or GCV", other)),
        }
    }
}

/// Outcome of an iterative optimisation
#[derive(Debug, Clone, PartialEq)]
pub struct Convergence {
    pub iterations: usize,
    pub converged: bool,
    pub gradient_norm: f64,
    pub message: String,
}

impl Convergence {
    pub fn trivially_converged() -> Self {
        Self {
            iterations: 0,
            converged: true,
            gradient_norm: 0.0,
            message: "no smoothing parameters to estimate".to_string(),
        }
    }
}

/// Container for smoothing parameters
#[derive(Debug, Clone)]
pub struct SmoothingParameter {
    pub lambda: Vec<f64>,
    pub method: OptimizationMethod,
    /// γ in GCV's `n·RSS/(n − γ·edf)²`
    pub gamma: f64,
}

impl SmoothingParameter {
    /// Create new smoothing parameters with initial values
    pub fn new(num_smooths: usize, method: OptimizationMethod) -> Self {
        Self {
            lambda: vec![1.0; num_smooths],
            method,
            gamma: 1.0,
        }
    }

    pub fn rho(&self) -> Vec<f64> {
        self.lambda.iter().map(|l| l.ln()).collect()
    }

    /// Evaluate the selected criterion at log smoothing parameters `rho`
    pub fn evaluate(
        &self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        gram: &Gram,
        rho: &[f64],
        penalties: &[BlockPenalty],
    ) -> Result<CriterionEval> {
        match self.method {
            OptimizationMethod::REML => reml_criterion(x, y, gram, rho, penalties),
            OptimizationMethod::GCV => gcv_criterion(x, y, gram, rho, penalties, self.gamma),
        }
    }

    /// Optimize smoothing parameters; `self.lambda` holds the result and the
    /// criterion evaluation at the optimum is returned.
    pub fn optimize(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        gram: &Gram,
        penalties: &[BlockPenalty],
        max_iter: usize,
        tolerance: f64,
    ) -> Result<(CriterionEval, Convergence)> {
        let m = self.lambda.len();
        let mut rho: Vec<f64> = self.rho().iter().map(|r| r.clamp(RHO_MIN, RHO_MAX)).collect();
        let mut current = self.evaluate(x, y, gram, &rho, penalties)?;

        if m == 0 {
            return Ok((current, Convergence::trivially_converged()));
        }

        let mut convergence = Convergence {
            iterations: 0,
            converged: false,
            gradient_norm: f64::INFINITY,
            message: String::new(),
        };

        for iter in 0..max_iter {
            convergence.iterations = iter + 1;

            let free: Vec<bool> = (0..m)
                .map(|j| {
                    let g = current.gradient[j];
                    !((rho[j] >= RHO_MAX - 1e-9 && g < 0.0) || (rho[j] <= RHO_MIN + 1e-9 && g > 0.0))
                })
                .collect();

            let grad_norm = (0..m)
                .filter(|&j| free[j])
                .map(|j| current.gradient[j].abs())
                .fold(0.0, f64::max);
            convergence.gradient_norm = grad_norm;

            debug!(
                iteration = iter,
                criterion = current.value,
                gradient = grad_norm,
                method = self.method.name(),
                "smoothing parameter iteration"
            );

            if grad_norm < tolerance * (1.0 + current.value.abs()) {
                convergence.converged = true;
                convergence.message = "gradient below tolerance".to_string();
                break;
            }

            let step = self.newton_step(x, y, gram, penalties, &rho, &current, &free)?;

            let mut accepted = false;
            let mut scale = 1.0;
            for _ in 0..25 {
                let trial: Vec<f64> = rho
                    .iter()
                    .zip(step.iter())
                    .map(|(r, s)| (r + scale * s).clamp(RHO_MIN, RHO_MAX))
                    .collect();
                let eval = self.evaluate(x, y, gram, &trial, penalties)?;
                if eval.value < current.value {
                    rho = trial;
                    current = eval;
                    accepted = true;
                    break;
                }
                scale *= 0.5;
            }

            if !accepted {
                // no descent possible along the Newton direction: at the optimum
                // up to numerical precision if the gradient is already small
                convergence.converged = grad_norm < 1e3 * tolerance * (1.0 + current.value.abs());
                convergence.message = "step failed to reduce the criterion".to_string();
                break;
            }
        }

        if !convergence.converged && convergence.message.is_empty() {
            convergence.message = format!("iteration limit ({}) reached", max_iter);
        }
        if !convergence.converged {
            warn!(
                method = self.method.name(),
                iterations = convergence.iterations,
                gradient = convergence.gradient_norm,
                "smoothing parameter selection did not converge: {}",
                convergence.message
            );
        }

        self.lambda = rho.iter().map(|r| r.exp()).collect();
        Ok((current, convergence))
    }

    #[allow(clippy::too_many_arguments)]
    fn newton_step(
        &self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        gram: &Gram,
        penalties: &[BlockPenalty],
        rho: &[f64],
        current: &CriterionEval,
        free: &[bool],
    ) -> Result<Vec<f64>> {
        let idx: Vec<usize> = (0..rho.len()).filter(|&j| free[j]).collect();
        let m = idx.len();
        let mut step = vec![0.0; rho.len()];
        if m == 0 {
            return Ok(step);
        }

        let mut hessian = Array2::zeros((m, m));
        for (col, &j) in idx.iter().enumerate() {
            let mut shifted = rho.to_vec();
            shifted[j] += FD_STEP;
            let eval = self.evaluate(x, y, gram, &shifted, penalties)?;
            for (row, &i) in idx.iter().enumerate() {
                hessian[[row, col]] = (eval.gradient[i] - current.gradient[i]) / FD_STEP;
            }
        }
        let hessian = (&hessian + &hessian.t()) * 0.5;
        let g = Array1::from_iter(idx.iter().map(|&j| current.gradient[j]));

        let diag_max = (0..m).map(|i| hessian[[i, i]].abs()).fold(1e-8, f64::max);
        let mut ridge = 0.0;
        let mut direction = None;
        for _ in 0..40 {
            let mut h = hessian.clone();
            for i in 0..m {
                h[[i, i]] += ridge;
            }
            if cholesky(&h).is_ok() {
                direction = Some(solve(h, -&g)?);
                break;
            }
            ridge = if ridge == 0.0 { 1e-6 * diag_max } else { ridge * 10.0 };
        }
        // steepest descent when no ridge made the Hessian positive definite
        let direction = direction.unwrap_or_else(|| -&g);

        let largest = direction.iter().fold(0.0f64, |a, d| a.max(d.abs()));
        let shrink = if largest > MAX_STEP { MAX_STEP / largest } else { 1.0 };
        for (k, &j) in idx.iter().enumerate() {
            step[j] = direction[k] * shrink;
        }
        Ok(step)
    }
}
