//! Cubic spline bases for smooth terms
//!
//! Both bases are parameterised by the function values at the knots
//! (cardinal form, as mgcv's `cr` and `cc` bases): the second derivatives at
//! the knots follow from the values through `B δ = D β`, so a row of the design
//! matrix mixes the two neighbouring knot values and the two neighbouring
//! rows of `F = B⁻¹D`. The penalty `∫ f''(x)² dx` is exactly `βᵀ Dᵀ B⁻¹ D β`.

use ndarray::{Array1, Array2};
use crate::linalg::solve;
use crate::{GAMError, Result};

/// Trait for basis function implementations
pub trait BasisFunction: Send + Sync + std::fmt::Debug {
    /// Evaluate the basis functions at given points (rows = points)
    fn evaluate(&self, x: &Array1<f64>) -> Result<Array2<f64>>;

    /// Number of basis functions (columns of the design block)
    fn num_basis(&self) -> usize;

    /// Knot positions
    fn knots(&self) -> &Array1<f64>;

    /// Wiggliness penalty `∫ f''(x)² dx` as a quadratic form in the coefficients
    fn penalty(&self) -> Result<Array2<f64>>;

    /// Short mgcv-style basis code ("cr", "cc")
    fn code(&self) -> &'static str;
}

/// Knot spacings `h[i] = knots[i + 1] - knots[i]`.
fn spacings(knots: &Array1<f64>) -> Result<Vec<f64>> {
    let h: Vec<f64> = (1..knots.len()).map(|i| knots[i] - knots[i - 1]).collect();
    if h.iter().any(|&hi| !(hi > 0.0)) {
        return Err(GAMError::InvalidParameter(
            "knots must be strictly increasing".to_string(),
        ));
    }
    Ok(h)
}

/// `B⁻¹ D` column by column.
fn left_solve(b: &Array2<f64>, d: &Array2<f64>) -> Result<Array2<f64>> {
    let mut f = Array2::zeros(d.dim());
    for j in 0..d.ncols() {
        let col = solve(b.clone(), d.column(j).to_owned())?;
        f.column_mut(j).assign(&col);
    }
    Ok(f)
}

/// Cubic spline cardinal weights on an interval of width `h`, for a point
/// `dl = x - x_j` from the left knot and `dr = x_{j+1} - x` from the right knot.
#[inline]
fn interval_weights(dl: f64, dr: f64, h: f64) -> (f64, f64, f64, f64) {
    let a_minus = dr / h;
    let a_plus = dl / h;
    let c_minus = (dr * dr * dr / h - h * dr) / 6.0;
    let c_plus = (dl * dl * dl / h - h * dl) / 6.0;
    (a_minus, a_plus, c_minus, c_plus)
}

/// Sorted unique finite values of `x`.
fn unique_sorted(x: &Array1<f64>) -> Vec<f64> {
    let mut v: Vec<f64> = x.iter().copied().filter(|v| v.is_finite()).collect();
    v.sort_by(|a, b| a.total_cmp(b));
    v.dedup_by(|a, b| (*a - *b).abs() <= 1e-12 * b.abs().max(1.0));
    v
}

/// Cubic regression spline (natural boundary conditions, mgcv `bs="cr"`).
#[derive(Debug, Clone)]
pub struct CubicRegressionSpline {
    knots: Array1<f64>,
    h: Vec<f64>,
    /// k × k map from knot values to knot second derivatives (first and last rows zero)
    f: Array2<f64>,
    penalty: Array2<f64>,
}

impl CubicRegressionSpline {
    /// Create a spline on explicit knots (at least 3, strictly increasing)
    pub fn new(knots: Array1<f64>) -> Result<Self> {
        let k = knots.len();
        if k < 3 {
            return Err(GAMError::InvalidParameter(format!(
                "cubic regression spline needs at least 3 knots, got {}",
                k
            )));
        }
        let h = spacings(&knots)?;

        let m = k - 2;
        let mut b = Array2::zeros((m, m));
        let mut d = Array2::zeros((m, k));
        for i in 0..m {
            d[[i, i]] = 1.0 / h[i];
            d[[i, i + 1]] = -1.0 / h[i] - 1.0 / h[i + 1];
            d[[i, i + 2]] = 1.0 / h[i + 1];
            b[[i, i]] = (h[i] + h[i + 1]) / 3.0;
            if i + 1 < m {
                b[[i, i + 1]] = h[i + 1] / 6.0;
                b[[i + 1, i]] = h[i + 1] / 6.0;
            }
        }

        let f_inner = left_solve(&b, &d)?;
        let penalty = d.t().dot(&f_inner);

        let mut f = Array2::zeros((k, k));
        for i in 0..m {
            f.row_mut(i + 1).assign(&f_inner.row(i));
        }

        Ok(Self { knots, h, f, penalty })
    }

    /// Create a spline with `k` knots at quantiles of the unique values of `x` (like mgcv)
    pub fn with_quantile_knots(x: &Array1<f64>, k: usize) -> Result<Self> {
        let u = unique_sorted(x);
        if u.len() < k {
            return Err(GAMError::InvalidParameter(format!(
                "covariate has {} unique values, fewer than the {} knots requested",
                u.len(),
                k
            )));
        }
        if k < 3 {
            return Err(GAMError::InvalidParameter(
                "cubic regression spline needs at least 3 knots".to_string(),
            ));
        }

        let n = u.len();
        let knots = Array1::from_iter((0..k).map(|i| {
            let pos = i as f64 * (n - 1) as f64 / (k - 1) as f64;
            let lo = pos.floor() as usize;
            if lo + 1 >= n {
                u[n - 1]
            } else {
                u[lo] + (pos - lo as f64) * (u[lo + 1] - u[lo])
            }
        }));
        Self::new(knots)
    }

    /// Derivative of the spline at the first (`left = true`) or last knot as a
    /// row of coefficient weights. Used for linear extrapolation.
    fn boundary_slope(&self, left: bool) -> Array1<f64> {
        let k = self.knots.len();
        let mut row = Array1::zeros(k);
        if left {
            let h = self.h[0];
            row[0] -= 1.0 / h;
            row[1] += 1.0 / h;
            row.scaled_add(-h / 3.0, &self.f.row(0));
            row.scaled_add(-h / 6.0, &self.f.row(1));
        } else {
            let h = self.h[k - 2];
            row[k - 2] -= 1.0 / h;
            row[k - 1] += 1.0 / h;
            row.scaled_add(h / 6.0, &self.f.row(k - 2));
            row.scaled_add(h / 3.0, &self.f.row(k - 1));
        }
        row
    }
}

impl BasisFunction for CubicRegressionSpline {
    fn evaluate(&self, x: &Array1<f64>) -> Result<Array2<f64>> {
        let k = self.knots.len();
        let lo = self.knots[0];
        let hi = self.knots[k - 1];
        let mut design = Array2::zeros((x.len(), k));

        let left_slope = self.boundary_slope(true);
        let right_slope = self.boundary_slope(false);

        for (i, &xi) in x.iter().enumerate() {
            if !xi.is_finite() {
                return Err(GAMError::InvalidParameter(format!(
                    "non-finite covariate value at row {}",
                    i
                )));
            }
            let mut row = design.row_mut(i);
            if xi < lo {
                row[0] = 1.0;
                row.scaled_add(xi - lo, &left_slope);
                continue;
            }
            if xi > hi {
                row[k - 1] = 1.0;
                row.scaled_add(xi - hi, &right_slope);
                continue;
            }

            let j = self
                .knots
                .as_slice()
                .map(|s| s.partition_point(|&kn| kn <= xi))
                .unwrap_or(1)
                .saturating_sub(1)
                .min(k - 2);
            let h = self.h[j];
            let (am, ap, cm, cp) = interval_weights(xi - self.knots[j], self.knots[j + 1] - xi, h);
            row[j] += am;
            row[j + 1] += ap;
            row.scaled_add(cm, &self.f.row(j));
            row.scaled_add(cp, &self.f.row(j + 1));
        }

        Ok(design)
    }

    fn num_basis(&self) -> usize {
        self.knots.len()
    }

    fn knots(&self) -> &Array1<f64> {
        &self.knots
    }

    fn penalty(&self) -> Result<Array2<f64>> {
        Ok(self.penalty.clone())
    }

    fn code(&self) -> &'static str {
        "cr"
    }
}

/// Cyclic cubic regression spline (mgcv `bs="cc"`).
///
/// `k` knots span one period `[lower, upper]`; the value at `upper` is the
/// value at `lower`, so there are `k - 1` coefficients.
#[derive(Debug, Clone)]
pub struct CyclicCubicSpline {
    knots: Array1<f64>,
    h: Vec<f64>,
    f: Array2<f64>,
    penalty: Array2<f64>,
}

impl CyclicCubicSpline {
    /// `k` evenly spaced knots over the period `[lower, upper]`
    pub fn new(lower: f64, upper: f64, k: usize) -> Result<Self> {
        if k < 4 {
            return Err(GAMError::InvalidParameter(format!(
                "cyclic spline needs at least 4 knots, got {}",
                k
            )));
        }
        if !(upper > lower) || !lower.is_finite() || !upper.is_finite() {
            return Err(GAMError::InvalidParameter(format!(
                "invalid cyclic period [{}, {}]",
                lower, upper
            )));
        }
        let knots = Array1::linspace(lower, upper, k);
        Self::from_knots(knots)
    }

    /// Period taken from the range of the data
    pub fn with_data_range(x: &Array1<f64>, k: usize) -> Result<Self> {
        let lower = x.iter().copied().fold(f64::INFINITY, f64::min);
        let upper = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self::new(lower, upper, k)
    }

    fn from_knots(knots: Array1<f64>) -> Result<Self> {
        let h = spacings(&knots)?;
        let n = h.len();

        let mut b = Array2::zeros((n, n));
        let mut d = Array2::zeros((n, n));
        for i in 0..n {
            let prev = (i + n - 1) % n;
            let next = (i + 1) % n;
            b[[i, i]] += (h[prev] + h[i]) / 3.0;
            b[[i, next]] += h[i] / 6.0;
            b[[i, prev]] += h[prev] / 6.0;
            d[[i, i]] -= 1.0 / h[prev] + 1.0 / h[i];
            d[[i, next]] += 1.0 / h[i];
            d[[i, prev]] += 1.0 / h[prev];
        }

        let f = left_solve(&b, &d)?;
        let penalty = d.t().dot(&f);

        Ok(Self { knots, h, f, penalty })
    }

    /// Period boundaries
    pub fn period(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }
}

impl BasisFunction for CyclicCubicSpline {
    fn evaluate(&self, x: &Array1<f64>) -> Result<Array2<f64>> {
        let n = self.h.len();
        let (lower, upper) = self.period();
        let period = upper - lower;
        let mut design = Array2::zeros((x.len(), n));

        for (i, &xi) in x.iter().enumerate() {
            if !xi.is_finite() {
                return Err(GAMError::InvalidParameter(format!(
                    "non-finite covariate value at row {}",
                    i
                )));
            }
            let xw = lower + (xi - lower).rem_euclid(period);
            let j = self
                .knots
                .as_slice()
                .map(|s| s.partition_point(|&kn| kn <= xw))
                .unwrap_or(1)
                .saturating_sub(1)
                .min(n - 1);
            let j1 = (j + 1) % n;
            let h = self.h[j];
            let (am, ap, cm, cp) = interval_weights(xw - self.knots[j], self.knots[j + 1] - xw, h);

            let mut row = design.row_mut(i);
            row[j] += am;
            row[j1] += ap;
            row.scaled_add(cm, &self.f.row(j));
            row.scaled_add(cp, &self.f.row(j1));
        }

        Ok(design)
    }

    fn num_basis(&self) -> usize {
        self.h.len()
    }

    fn knots(&self) -> &Array1<f64> {
        &self.knots
    }

    fn penalty(&self) -> Result<Array2<f64>> {
        Ok(self.penalty.clone())
    }

    fn code(&self) -> &'static str {
        "cc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::symmetric_eigen;
    use approx::assert_abs_diff_eq;

    fn zero_eigenvalues(s: &Array2<f64>) -> usize {
        let (values, _) = symmetric_eigen(s).unwrap();
        let max = values[0];
        values.iter().filter(|v| v.abs() < 1e-9 * max).count()
    }

    #[test]
    fn test_cr_interpolates_knot_values() {
        let spline = CubicRegressionSpline::new(Array1::from_vec(vec![0.0, 0.3, 0.5, 0.8, 1.0])).unwrap();
        let x = spline.knots().clone();
        let basis = spline.evaluate(&x).unwrap();

        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(basis[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_cr_reproduces_linear_functions() {
        let spline = CubicRegressionSpline::new(Array1::linspace(0.0, 2.0, 6)).unwrap();
        let beta = spline.knots().mapv(|k| 1.5 - 2.0 * k);
        let x = Array1::from_vec(vec![-0.5, 0.1, 0.77, 1.3, 1.99, 2.6]);
        let fitted = spline.evaluate(&x).unwrap().dot(&beta);

        for (xi, fi) in x.iter().zip(fitted.iter()) {
            assert_abs_diff_eq!(*fi, 1.5 - 2.0 * xi, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_cr_penalty_null_space() {
        let spline = CubicRegressionSpline::new(Array1::from_vec(vec![0.0, 1.0, 1.5, 3.0, 4.0, 6.0])).unwrap();
        let s = spline.penalty().unwrap();
        for i in 0..6 {
            for j in 0..6 {
                assert_abs_diff_eq!(s[[i, j]], s[[j, i]], epsilon = 1e-12);
            }
        }
        assert_eq!(zero_eigenvalues(&s), 2);
    }

    #[test]
    fn test_quantile_knots_span_data() {
        let x = Array1::from_iter((0..100).map(|i| (i as f64 * 0.37).sin() * 10.0));
        let spline = CubicRegressionSpline::with_quantile_knots(&x, 8).unwrap();
        let knots = spline.knots();

        assert_eq!(knots.len(), 8);
        let min = x.iter().copied().fold(f64::INFINITY, f64::min);
        let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_abs_diff_eq!(knots[0], min, epsilon = 1e-12);
        assert_abs_diff_eq!(knots[7], max, epsilon = 1e-12);
    }

    #[test]
    fn test_quantile_knots_need_enough_unique_values() {
        let x = Array1::from_vec(vec![1.0, 1.0, 2.0, 2.0, 3.0]);
        assert!(CubicRegressionSpline::with_quantile_knots(&x, 5).is_err());
    }

    #[test]
    fn test_cc_matches_at_period_ends() {
        let spline = CyclicCubicSpline::new(0.5, 12.5, 12).unwrap();
        assert_eq!(spline.num_basis(), 11);

        let x = Array1::from_vec(vec![0.5, 12.5, 0.5 + 1e-7, 12.5 - 1e-7, 14.0, 2.0]);
        let basis = spline.evaluate(&x).unwrap();
        for j in 0..11 {
            assert_abs_diff_eq!(basis[[0, j]], basis[[1, j]], epsilon = 1e-12);
            assert_abs_diff_eq!(basis[[2, j]], basis[[3, j]], epsilon = 1e-5);
            // wrapping: 14.0 is 2.0 one period later
            assert_abs_diff_eq!(basis[[4, j]], basis[[5, j]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cc_rows_sum_to_one_and_penalty_rank() {
        let spline = CyclicCubicSpline::new(0.0, 1.0, 7).unwrap();
        let x = Array1::linspace(0.0, 0.99, 25);
        let basis = spline.evaluate(&x).unwrap();
        for row in basis.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_eq!(zero_eigenvalues(&spline.penalty().unwrap()), 1);
    }

    #[test]
    fn test_cc_rejects_small_k() {
        assert!(CyclicCubicSpline::new(0.0, 1.0, 3).is_err());
        assert!(CyclicCubicSpline::new(1.0, 1.0, 6).is_err());
    }
}
