//! REML and GCV criteria for smoothing parameter selection
//!
//! Both criteria are functions of `ρ = log λ`. For the Gaussian additive model
//! the scale parameter is profiled out of the restricted likelihood:
//!
//! ```text
//! V(ρ) = ν log φ̂ + ν + log|XᵀX + S_λ| − log|S_λ|₊
//! φ̂    = (‖y − Xβ̂‖² + β̂ᵀS_λβ̂) / ν,       ν = n − M_p
//! ```
//!
//! where `M_p` is the dimension of the penalty null space. Because every
//! penalty occupies its own diagonal block, `log|S_λ|₊ = Σ rⱼ ρⱼ + log|Sⱼ|₊`.
//! The gradient is exact:
//! `∂V/∂ρⱼ = λⱼβ̂ᵀSⱼβ̂/φ̂ + λⱼ tr(A⁻¹Sⱼ) − rⱼ`.

use ndarray::{Array1, Array2};
use crate::penalty::BlockPenalty;
use crate::pls::{fit_pls, Gram, PlsFit};
use crate::{GAMError, Result};

/// Criterion value, gradient in ρ, and the fit it was computed from
#[derive(Debug, Clone)]
pub struct CriterionEval {
    pub value: f64,
    pub gradient: Vec<f64>,
    pub fit: PlsFit,
    /// Scale estimate implied by the criterion
    pub scale: f64,
}

/// Dimension of the null space of `S_λ` (unpenalized directions)
pub fn null_space_dim(p: usize, penalties: &[BlockPenalty]) -> usize {
    p.saturating_sub(penalties.iter().map(|s| s.rank()).sum::<usize>())
}

/// Profiled REML criterion `V(ρ)` and its gradient
pub fn reml_criterion(
    x: &Array2<f64>,
    y: &Array1<f64>,
    gram: &Gram,
    rho: &[f64],
    penalties: &[BlockPenalty],
) -> Result<CriterionEval> {
    let lambda: Vec<f64> = rho.iter().map(|r| r.exp()).collect();
    let fit = fit_pls(x, y, gram, &lambda, penalties)?;

    let nu = gram.n as f64 - null_space_dim(x.ncols(), penalties) as f64;
    if nu <= 0.0 {
        return Err(GAMError::InvalidParameter(format!(
            "model has more unpenalized coefficients than observations (n = {})",
            gram.n
        )));
    }

    let scale = ((fit.rss + fit.penalty_value) / nu).max(1e-300);

    let log_det_s: f64 = penalties
        .iter()
        .zip(rho.iter())
        .map(|(s, r)| s.rank() as f64 * r + s.log_pdet())
        .sum();

    let value = nu * scale.ln() + nu + fit.log_det_a - log_det_s;

    let gradient = penalties
        .iter()
        .zip(lambda.iter())
        .map(|(s, l)| {
            let beta_s_beta = s.quadratic_form(&fit.coefficients);
            l * beta_s_beta / scale + l * s.trace_product(&fit.a_inv) - s.rank() as f64
        })
        .collect();

    Ok(CriterionEval {
        value,
        gradient,
        fit,
        scale,
    })
}

/// The REML score as reported in summaries: `V/2 + (ν/2) log 2π`
pub fn reported_reml_score(value: f64, n: usize, p: usize, penalties: &[BlockPenalty]) -> f64 {
    let nu = n as f64 - null_space_dim(p, penalties) as f64;
    0.5 * value + 0.5 * nu * (2.0 * std::f64::consts::PI).ln()
}

fn gcv_value(fit: &PlsFit, n: usize, gamma: f64) -> Result<f64> {
    let n = n as f64;
    let denom = n - gamma * fit.edf();
    if denom <= 0.0 {
        return Err(GAMError::OptimizationFailed(
            "GCV denominator is not positive (edf too large for n)".to_string(),
        ));
    }
    Ok(n * fit.rss / (denom * denom))
}

/// GCV score `n·RSS / (n − γ·edf)²` with a central-difference gradient in ρ
pub fn gcv_criterion(
    x: &Array2<f64>,
    y: &Array1<f64>,
    gram: &Gram,
    rho: &[f64],
    penalties: &[BlockPenalty],
    gamma: f64,
) -> Result<CriterionEval> {
    let lambda: Vec<f64> = rho.iter().map(|r| r.exp()).collect();
    let fit = fit_pls(x, y, gram, &lambda, penalties)?;
    let value = gcv_value(&fit, gram.n, gamma)?;

    let delta = 1e-4;
    let mut gradient = Vec::with_capacity(rho.len());
    for j in 0..rho.len() {
        let mut up = lambda.clone();
        let mut down = lambda.clone();
        up[j] = (rho[j] + delta).exp();
        down[j] = (rho[j] - delta).exp();
        let v_up = gcv_value(&fit_pls(x, y, gram, &up, penalties)?, gram.n, gamma)?;
        let v_down = gcv_value(&fit_pls(x, y, gram, &down, penalties)?, gram.n, gamma)?;
        gradient.push((v_up - v_down) / (2.0 * delta));
    }

    let scale = fit.rss / (gram.n as f64 - fit.edf()).max(1.0);

    Ok(CriterionEval {
        value,
        gradient,
        fit,
        scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_problem() -> (Array2<f64>, Array1<f64>, Vec<BlockPenalty>) {
        let n = 40;
        let p = 6;
        let x = Array2::from_shape_fn((n, p), |(i, j)| {
            let t = i as f64 / n as f64;
            (t * (j + 1) as f64 * 2.0).sin()
        });
        let y: Array1<f64> = (0..n)
            .map(|i| {
                let t = i as f64 / n as f64;
                (3.0 * t).sin() + 0.1 * (((i * 37) % 11) as f64 / 11.0 - 0.5)
            })
            .collect();

        let mut d = Array2::zeros((p - 3, p - 1));
        for i in 0..p - 3 {
            d[[i, i]] = 1.0;
            d[[i, i + 1]] = -2.0;
            d[[i, i + 2]] = 1.0;
        }
        let s = d.t().dot(&d);
        let penalties = vec![BlockPenalty::new(s, 1, p).unwrap()];
        (x, y, penalties)
    }

    #[test]
    fn test_reml_gradient_matches_finite_difference() {
        let (x, y, penalties) = toy_problem();
        let gram = Gram::new(&x, &y).unwrap();

        for &rho in &[-2.0, 0.0, 3.0] {
            let eval = reml_criterion(&x, &y, &gram, &[rho], &penalties).unwrap();
            let h = 1e-5;
            let up = reml_criterion(&x, &y, &gram, &[rho + h], &penalties).unwrap();
            let down = reml_criterion(&x, &y, &gram, &[rho - h], &penalties).unwrap();
            let fd = (up.value - down.value) / (2.0 * h);
            assert_abs_diff_eq!(eval.gradient[0], fd, epsilon = 1e-4 * (1.0 + fd.abs()));
        }
    }

    #[test]
    fn test_null_space_dim() {
        let (_, _, penalties) = toy_problem();
        // unpenalized first column plus the 2-dimensional null space of the difference penalty
        assert_eq!(null_space_dim(6, &penalties), 3);
    }

    #[test]
    fn test_gcv_criterion_is_finite() {
        let (x, y, penalties) = toy_problem();
        let gram = Gram::new(&x, &y).unwrap();
        let eval = gcv_criterion(&x, &y, &gram, &[0.0], &penalties, 1.0).unwrap();
        assert!(eval.value.is_finite() && eval.value > 0.0);
        assert_eq!(eval.gradient.len(), 1);
    }
}
