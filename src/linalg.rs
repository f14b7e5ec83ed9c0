//! Dense linear algebra for penalized regression
//!
//! Everything here works on small symmetric systems (p = total number of
//! coefficients, a few dozen at most), so straightforward O(p³) routines on
//! `ndarray` are sufficient. With the `blas` feature the solve, Cholesky and
//! symmetric eigen-decomposition go through LAPACK via `ndarray-linalg`
//! instead.

use ndarray::{s, Array1, Array2};
#[cfg(feature = "blas")]
use ndarray_linalg::{error::LinalgError, Cholesky, Eigh, Solve, UPLO};
use crate::{GAMError, Result};

fn max_abs(a: &Array2<f64>) -> f64 {
    a.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

fn check_system(a: &Array2<f64>, b: &Array1<f64>) -> Result<()> {
    if a.ncols() != a.nrows() || b.len() != a.nrows() {
        return Err(GAMError::DimensionMismatch(format!(
            "cannot solve {}x{} system with right hand side of length {}",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }
    Ok(())
}

fn check_square(a: &Array2<f64>) -> Result<()> {
    if a.ncols() != a.nrows() {
        return Err(GAMError::DimensionMismatch("Matrix must be square".to_string()));
    }
    Ok(())
}

/// Solve `A x = b` by LU factorisation.
#[cfg(feature = "blas")]
pub fn solve(a: Array2<f64>, b: Array1<f64>) -> Result<Array1<f64>> {
    check_system(&a, &b)?;
    a.solve_into(b).map_err(|e| match e {
        LinalgError::Lapack(_) => GAMError::SingularMatrix,
        other => GAMError::LinAlgError(other.to_string()),
    })
}

/// Solve `A x = b` by Gaussian elimination with partial pivoting.
#[cfg(not(feature = "blas"))]
pub fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>> {
    check_system(&a, &b)?;
    let n = a.nrows();

    let tol = 1e-13 * max_abs(&a).max(1e-300);

    for k in 0..n {
        let mut max_idx = k;
        let mut max_val = a[[k, k]].abs();
        for i in (k + 1)..n {
            let val = a[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }

        if max_val <= tol {
            return Err(GAMError::SingularMatrix);
        }

        if max_idx != k {
            for j in 0..n {
                a.swap([k, j], [max_idx, j]);
            }
            b.swap(k, max_idx);
        }

        for i in (k + 1)..n {
            let factor = a[[i, k]] / a[[k, k]];
            if factor == 0.0 {
                continue;
            }
            for j in (k + 1)..n {
                a[[i, j]] -= factor * a[[k, j]];
            }
            b[i] -= factor * b[k];
        }
    }

    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += a[[i, j]] * x[j];
        }
        x[i] = (b[i] - sum) / a[[i, i]];
    }

    Ok(x)
}

/// Determinant via LU decomposition with partial pivoting.
pub fn determinant(a: &Array2<f64>) -> Result<f64> {
    check_square(a)?;
    let n = a.nrows();

    let mut lu = a.clone();
    let mut sign = 1.0;

    for k in 0..n {
        let mut max_idx = k;
        let mut max_val = lu[[k, k]].abs();
        for i in (k + 1)..n {
            let val = lu[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }

        if max_val < 1e-300 {
            return Ok(0.0);
        }

        if max_idx != k {
            for j in 0..n {
                lu.swap([k, j], [max_idx, j]);
            }
            sign = -sign;
        }

        for i in (k + 1)..n {
            lu[[i, k]] /= lu[[k, k]];
            for j in (k + 1)..n {
                lu[[i, j]] -= lu[[i, k]] * lu[[k, j]];
            }
        }
    }

    Ok((0..n).fold(sign, |det, i| det * lu[[i, i]]))
}

/// Matrix inverse by Gauss-Jordan elimination.
pub fn inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    check_square(a)?;
    let n = a.nrows();

    let tol = 1e-13 * max_abs(a).max(1e-300);
    let mut aug = Array2::zeros((n, 2 * n));
    aug.slice_mut(s![.., ..n]).assign(a);
    for i in 0..n {
        aug[[i, n + i]] = 1.0;
    }

    for k in 0..n {
        let mut max_idx = k;
        let mut max_val = aug[[k, k]].abs();
        for i in (k + 1)..n {
            let val = aug[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }

        if max_val <= tol {
            return Err(GAMError::SingularMatrix);
        }

        if max_idx != k {
            for j in 0..(2 * n) {
                aug.swap([k, j], [max_idx, j]);
            }
        }

        let pivot = aug[[k, k]];
        for j in 0..(2 * n) {
            aug[[k, j]] /= pivot;
        }

        for i in 0..n {
            if i != k {
                let factor = aug[[i, k]];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..(2 * n) {
                    aug[[i, j]] -= factor * aug[[k, j]];
                }
            }
        }
    }

    Ok(aug.slice(s![.., n..]).to_owned())
}

/// Cholesky factor `L` with `A = L Lᵀ`. Fails if `A` is not positive definite.
#[cfg(feature = "blas")]
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    check_square(a)?;
    a.cholesky(UPLO::Lower)
        .map_err(|e| GAMError::LinAlgError(format!("matrix not positive definite: {}", e)))
}

/// Cholesky factor `L` with `A = L Lᵀ`. Fails if `A` is not positive definite.
#[cfg(not(feature = "blas"))]
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    check_square(a)?;
    let n = a.nrows();

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return Err(GAMError::LinAlgError(format!(
                        "matrix not positive definite (pivot {} = {:e})",
                        i, sum
                    )));
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// `log|A|` for a symmetric positive definite matrix.
pub fn log_det_spd(a: &Array2<f64>) -> Result<f64> {
    let l = cholesky(a)?;
    Ok(2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>())
}

/// Eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching eigenvectors as
/// columns.
#[cfg(feature = "blas")]
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    check_square(a)?;
    let (values, vectors) = a
        .eigh(UPLO::Lower)
        .map_err(|e| GAMError::LinAlgError(e.to_string()))?;
    // LAPACK orders eigenvalues ascending
    Ok((
        values.slice(s![..;-1]).to_owned(),
        vectors.slice(s![.., ..;-1]).to_owned(),
    ))
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns eigenvalues in descending order and the matching eigenvectors as
/// columns.
#[cfg(not(feature = "blas"))]
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    check_square(a)?;
    let n = a.nrows();

    let mut m = a.clone();
    let mut v = Array2::<f64>::eye(n);
    let scale = max_abs(a).max(1e-300);

    for _sweep in 0..100 {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += m[[p, q]] * m[[p, q]];
            }
        }
        if off.sqrt() <= 1e-14 * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq.abs() <= 1e-300 {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let sn = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - sn * mkq;
                    m[[k, q]] = sn * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - sn * mqk;
                    m[[q, k]] = sn * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - sn * vkq;
                    v[[k, q]] = sn * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| m[[j, j]].total_cmp(&m[[i, i]]));

    let values = Array1::from_iter(order.iter().map(|&i| m[[i, i]]));
    let mut vectors = Array2::zeros((n, n));
    for (col, &i) in order.iter().enumerate() {
        vectors.column_mut(col).assign(&v.column(i));
    }
    Ok((values, vectors))
}

/// Number of eigenvalues above `tol * max eigenvalue` and the log of their
/// product (the log pseudo-determinant).
pub fn rank_and_log_pdet(a: &Array2<f64>, tol: f64) -> Result<(usize, f64)> {
    let (values, _) = symmetric_eigen(a)?;
    let max_ev = values.iter().fold(0.0f64, |m, v| m.max(*v));
    if max_ev <= 0.0 {
        return Ok((0, 0.0));
    }
    let kept: Vec<f64> = values.iter().copied().filter(|&v| v > tol * max_ev).collect();
    Ok((kept.len(), kept.iter().map(|v| v.ln()).sum()))
}

/// Pseudo-inverse of a symmetric matrix truncated to its `rank` largest
/// eigenvalues.
pub fn truncated_pinv(a: &Array2<f64>, rank: usize) -> Result<Array2<f64>> {
    let (values, vectors) = symmetric_eigen(a)?;
    let n = a.nrows();
    let mut pinv = Array2::zeros((n, n));
    for k in 0..rank.min(n) {
        if values[k] <= 0.0 {
            break;
        }
        let u = vectors.column(k);
        for i in 0..n {
            for j in 0..n {
                pinv[[i, j]] += u[i] * u[j] / values[k];
            }
        }
    }
    Ok(pinv)
}

/// Orthonormal basis `Z` (k × k-1) for the null space of the constraint row `c`,
/// so that `c · Z = 0`.
///
/// Built from the Householder reflection that maps `c` onto the first axis:
/// the remaining k-1 columns of the reflector span the complement of `c`.
/// With `c = 1ᵀX` this absorbs the sum-to-zero constraint of a smooth into its
/// basis: the constrained design is `X Z` and the penalty `Zᵀ S Z`.
pub fn constraint_null_space(c: &Array1<f64>) -> Result<Array2<f64>> {
    let k = c.len();
    if k < 2 {
        return Err(GAMError::InvalidParameter(
            "constraint needs at least two coefficients".to_string(),
        ));
    }

    let norm = c.dot(c).sqrt();
    if norm < 1e-300 {
        return Err(GAMError::SingularMatrix);
    }

    let mut v = c.clone();
    v[0] += if c[0] >= 0.0 { norm } else { -norm };
    let vtv = v.dot(&v);

    let mut z = Array2::zeros((k, k - 1));
    for j in 1..k {
        for i in 0..k {
            let delta = if i == j { 1.0 } else { 0.0 };
            z[[i, j - 1]] = delta - 2.0 * v[i] * v[j] / vtv;
        }
    }
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_solve() {
        let a = Array2::from_shape_vec((3, 3), vec![
            2.0, 1.0, 1.0,
            1.0, 3.0, 2.0,
            1.0, 2.0, 2.0,
        ]).unwrap();
        let b = Array1::from_vec(vec![4.0, 6.0, 5.0]);

        let x = solve(a.clone(), b.clone()).unwrap();
        let ax = a.dot(&x);
        for i in 0..3 {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_solve_singular() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 4.0]).unwrap();
        let b = Array1::from_vec(vec![1.0, 2.0]);
        assert!(matches!(solve(a, b), Err(GAMError::SingularMatrix)));
    }

    #[test]
    fn test_determinant() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_abs_diff_eq!(determinant(&a).unwrap(), -2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_inverse() {
        let a = Array2::from_shape_vec((2, 2), vec![4.0, 7.0, 2.0, 6.0]).unwrap();
        let product = a.dot(&inverse(&a).unwrap());
        assert_abs_diff_eq!(product[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(product[[1, 1]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(product[[0, 1]], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(product[[1, 0]], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_log_det_matches_determinant() {
        let a = Array2::from_shape_vec((3, 3), vec![
            4.0, 1.0, 0.5,
            1.0, 3.0, 0.2,
            0.5, 0.2, 2.0,
        ]).unwrap();
        let det = determinant(&a).unwrap();
        assert_abs_diff_eq!(log_det_spd(&a).unwrap(), det.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(cholesky(&a).is_err());
    }

    #[test]
    fn test_cholesky_factor_is_lower() {
        let a = Array2::from_shape_vec((3, 3), vec![
            4.0, 2.0, 0.4,
            2.0, 5.0, 1.0,
            0.4, 1.0, 3.0,
        ]).unwrap();
        let l = cholesky(&a).unwrap();
        assert_eq!(l[[0, 1]], 0.0);
        assert_eq!(l[[0, 2]], 0.0);
        assert_eq!(l[[1, 2]], 0.0);
        assert_abs_diff_eq!(l[[0, 0]], 2.0, epsilon = 1e-12);
        let back = l.dot(&l.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(back[[i, j]], a[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_non_square_inputs_rejected() {
        let a = Array2::<f64>::zeros((2, 3));
        assert!(matches!(cholesky(&a), Err(GAMError::DimensionMismatch(_))));
        assert!(matches!(symmetric_eigen(&a), Err(GAMError::DimensionMismatch(_))));
        let square = Array2::<f64>::eye(2);
        assert!(matches!(
            solve(square, Array1::zeros(3)),
            Err(GAMError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_symmetric_eigen_reconstructs() {
        let a = Array2::from_shape_vec((3, 3), vec![
            2.0, -1.0, 0.0,
            -1.0, 2.0, -1.0,
            0.0, -1.0, 2.0,
        ]).unwrap();
        let (values, vectors) = symmetric_eigen(&a).unwrap();

        assert!(values[0] >= values[1] && values[1] >= values[2]);
        assert_abs_diff_eq!(values[0], 2.0 + 2f64.sqrt(), epsilon = 1e-10);
        assert_abs_diff_eq!(values[2], 2.0 - 2f64.sqrt(), epsilon = 1e-10);

        let diag = Array2::from_diag(&values);
        let back = vectors.dot(&diag).dot(&vectors.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(back[[i, j]], a[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_rank_of_difference_penalty() {
        // second-difference penalty on 5 coefficients has a 2-dimensional null space
        let mut d = Array2::zeros((3, 5));
        for i in 0..3 {
            d[[i, i]] = 1.0;
            d[[i, i + 1]] = -2.0;
            d[[i, i + 2]] = 1.0;
        }
        let s = d.t().dot(&d);
        let (rank, _) = rank_and_log_pdet(&s, 1e-9).unwrap();
        assert_eq!(rank, 3);
    }

    #[test]
    fn test_constraint_null_space() {
        let c = Array1::from_vec(vec![3.0, 1.0, 4.0, 1.0, 5.0]);
        let z = constraint_null_space(&c).unwrap();

        assert_eq!(z.dim(), (5, 4));
        let cz = c.dot(&z);
        for v in cz.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-10);
        }
        let ztz = z.t().dot(&z);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(ztz[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }
}
