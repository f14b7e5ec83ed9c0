//! Block-diagonal penalties.
//!
//! Every smooth term owns one k×k penalty sitting on the diagonal of the full
//! p×p coefficient space, at the columns of its (constrained) basis. Only the
//! block is stored; all operations used by the fitter touch the block alone.

use ndarray::{s, Array1, Array2};
use crate::linalg::rank_and_log_pdet;
use crate::Result;

/// Relative eigenvalue threshold used when computing penalty rank.
pub const RANK_TOL: f64 = 1e-9;

/// A penalty matrix stored as a single non-zero block on the diagonal.
#[derive(Debug, Clone)]
pub struct BlockPenalty {
    /// The non-zero k×k block
    pub block: Array2<f64>,
    /// Column/row offset in the full p×p matrix
    pub offset: usize,
    /// Dimension p of the full matrix
    pub total_size: usize,
    rank: usize,
    log_pdet: f64,
}

impl BlockPenalty {
    /// Create a block penalty, computing its rank and log pseudo-determinant once.
    pub fn new(block: Array2<f64>, offset: usize, total_size: usize) -> Result<Self> {
        debug_assert_eq!(block.nrows(), block.ncols(), "Block must be square");
        debug_assert!(
            offset + block.nrows() <= total_size,
            "Block exceeds total matrix size"
        );
        let (rank, log_pdet) = rank_and_log_pdet(&block, RANK_TOL)?;
        Ok(BlockPenalty {
            block,
            offset,
            total_size,
            rank,
            log_pdet,
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block.nrows()
    }

    /// Rank of the penalty (basis dimension minus null space dimension)
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Sum of the logs of the non-zero eigenvalues
    #[inline]
    pub fn log_pdet(&self) -> f64 {
        self.log_pdet
    }

    /// In-place `target += scale * self`, touching only the block.
    pub fn scaled_add_to(&self, target: &mut Array2<f64>, scale: f64) {
        let end = self.offset + self.block_size();
        let mut slice = target.slice_mut(s![self.offset..end, self.offset..end]);
        slice.scaled_add(scale, &self.block);
    }

    /// `vᵀ S v`
    pub fn quadratic_form(&self, v: &Array1<f64>) -> f64 {
        let end = self.offset + self.block_size();
        let v_slice = v.slice(s![self.offset..end]);
        v_slice.dot(&self.block.dot(&v_slice))
    }

    /// `tr(M S)` for a dense p×p matrix `M`.
    pub fn trace_product(&self, dense: &Array2<f64>) -> f64 {
        let k = self.block_size();
        let end = self.offset + k;
        let m_block = dense.slice(s![self.offset..end, self.offset..end]);
        let mut trace = 0.0;
        for i in 0..k {
            for j in 0..k {
                trace += m_block[[i, j]] * self.block[[j, i]];
            }
        }
        trace
    }

    /// Full dense p×p matrix.
    #[cfg(test)]
    pub fn to_dense(&self) -> Array2<f64> {
        let end = self.offset + self.block_size();
        let mut full = Array2::zeros((self.total_size, self.total_size));
        full.slice_mut(s![self.offset..end, self.offset..end])
            .assign(&self.block);
        full
    }
}

/// Max absolute row sum.
fn inf_norm(a: &Array2<f64>) -> f64 {
    a.rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Rescale a penalty so that its size is comparable with `XᵀX` for the term's
/// design block (mgcv's `scale.penalty`): `S ← S · ‖X‖∞² / ‖S‖∞`.
///
/// Returns the rescaled penalty and the factor applied.
pub fn scale_to_design(penalty: &Array2<f64>, design: &Array2<f64>) -> (Array2<f64>, f64) {
    let xnorm = inf_norm(design);
    let snorm = inf_norm(penalty);
    if snorm <= 0.0 || xnorm <= 0.0 {
        return (penalty.clone(), 1.0);
    }
    let factor = xnorm * xnorm / snorm;
    (penalty * factor, factor)
}
