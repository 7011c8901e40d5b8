//! Dense least-squares kernel on top of faer's SVD.
//!
//! The numerical rank is the number of singular values above
//! `rank_tol * s_max`; the solution is the pseudo-inverse applied to `b`
//! over those directions, which is the minimum-norm minimizer.

use faer::solvers::Svd;
use faer_core::mul::matmul;
use faer_core::{mat, MatRef, Parallelism};

/// Summary of a dense least-squares solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LstsqInfo {
    /// Numerical rank of the block.
    pub rank: usize,
    /// `rank < min(nrows, ncols)`: some directions were dropped.
    pub rank_deficient: bool,
    /// Norm of the least-squares residual.
    pub residual_norm: f64,
}

/// Scratch space for [`min_norm_lstsq`], sized once per problem.
#[derive(Debug)]
pub(crate) struct LstsqWorkspace {
    coeffs: Vec<f64>,
    fit: Vec<f64>,
}

impl LstsqWorkspace {
    pub(crate) fn new(max_rows: usize, max_cols: usize) -> Self {
        Self {
            coeffs: vec![0.0; max_rows.min(max_cols)],
            fit: vec![0.0; max_rows],
        }
    }
}

/// Minimum-norm least-squares solution of `a x = b`.
///
/// Minimizes `||a x - b||` and, among minimizers, `||x||`. `b` holds at least
/// `a.nrows()` entries and `x` exactly `a.ncols()`.
pub(crate) fn min_norm_lstsq(
    a: MatRef<'_, f64>,
    b: &[f64],
    x: &mut [f64],
    rank_tol: f64,
    ws: &mut LstsqWorkspace,
) -> LstsqInfo {
    let nrows = a.nrows();
    let ncols = a.ncols();
    let b = &b[..nrows];
    x.fill(0.0);
    if nrows == 0 || ncols == 0 {
        return LstsqInfo {
            rank: 0,
            rank_deficient: false,
            residual_norm: l2_norm(b),
        };
    }

    let svd = Svd::new(a);
    let s = svd.s_diagonal();
    let u = svd.u();
    let steps = nrows.min(ncols);
    let s_max = s.read(0, 0);
    let mut rank = 0;
    while rank < steps && s.read(rank, 0) > rank_tol * s_max && s.read(rank, 0) > 0.0 {
        rank += 1;
    }

    // c_i = (u_i^T b) / s_i over the retained directions.
    let coeffs = &mut ws.coeffs[..rank];
    for (i, c) in coeffs.iter_mut().enumerate() {
        let mut sum = 0.0;
        for r in 0..nrows {
            sum += u.read(r, i) * b[r];
        }
        *c = sum / s.read(i, 0);
    }
    if rank > 0 {
        gemv(x, svd.v().submatrix(0, 0, ncols, rank), coeffs, Parallelism::None);
    }

    let fit = &mut ws.fit[..nrows];
    gemv(fit, a, x, Parallelism::None);
    let mut sum = 0.0;
    for (f, v) in fit.iter().zip(b.iter()) {
        let d = v - f;
        sum += d * d;
    }

    LstsqInfo {
        rank,
        rank_deficient: rank < steps,
        residual_norm: sum.sqrt(),
    }
}

/// `out <- a * x`.
pub(crate) fn gemv(out: &mut [f64], a: MatRef<'_, f64>, x: &[f64], parallelism: Parallelism) {
    let rhs = mat::from_column_major_slice::<f64>(x, a.ncols(), 1);
    let acc = mat::from_column_major_slice_mut::<f64>(out, a.nrows(), 1);
    matmul(acc, a, rhs, None, 1.0, parallelism);
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

pub(crate) fn l2_norm(x: &[f64]) -> f64 {
    dot(x, x).sqrt()
}

pub(crate) fn max_abs(x: &[f64]) -> f64 {
    let mut max = 0.0;
    for &v in x {
        let v = v.abs();
        if v > max {
            max = v;
        }
    }
    max
}
