//! Symmetric-PSD square-root kernels.
//!
//! Both variants satisfy `sqrt(Q) = S` with **`S^T S = Q`** (`S` is
//! upper-triangular-like, not lower — see module-level note in the
//! spec). Only the Cholesky variant supports an analytic derivative;
//! the SVD variant's derivative is an explicit `NotImplemented`,
//! matching the `TODO` in the original source.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, ErrorKind};

fn check_square(q: &DMatrix<f64>) -> Result<usize, Error> {
    if q.nrows() != q.ncols() {
        return Err(ErrorKind::Shape {
            expected: (q.nrows(), q.nrows()),
            got: (q.nrows(), q.ncols()),
        }
        .into());
    }
    Ok(q.nrows())
}

/// A symmetric-PSD square-root backend.
pub trait MatrixSqrt {
    /// Compute `S` such that `S^T S = Q`.
    fn sqrt(&self, q: &DMatrix<f64>) -> Result<DMatrix<f64>, Error>;
}

/// Cholesky-based square root, with an analytic parameter derivative.
///
/// The lower-triangular index pairs used by [`CholeskySqrt::diff`]
/// depend only on `n`, so they are computed once at construction
/// (mirroring the original source's per-dimension index-array cache)
/// rather than rebuilt on every call.
#[derive(Debug, Clone)]
pub struct CholeskySqrt {
    n: usize,
    /// Lower-triangular `(i, j)` index pairs, `i >= j`, in row-major order.
    tril: Vec<(usize, usize)>,
}

impl CholeskySqrt {
    /// Build a Cholesky square-root/derivative kernel for `n x n` matrices.
    pub fn new(n: usize) -> Self {
        let mut tril = Vec::with_capacity(n * (n + 1) / 2);
        for i in 0..n {
            for j in 0..=i {
                tril.push((i, j));
            }
        }
        Self { n, tril }
    }

    /// Derivative of `S` (upper Cholesky factor) with respect to a
    /// parameter vector, given the derivatives `dQ/dq` (one symmetric
    /// `n x n` slice per parameter).
    ///
    /// Solves the linear system described in the spec: flattening by
    /// lower-triangular index pairs of `L = S^T` yields an `nnz x nnz`
    /// system `A_tril * vec(dL_tril) = vec(dQ_tril)`, factored once via
    /// `LU` and reused across all `nq` right-hand sides.
    pub fn diff(&self, s: &DMatrix<f64>, dq: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>, Error> {
        if s.nrows() != self.n || s.ncols() != self.n {
            return Err(ErrorKind::Shape {
                expected: (self.n, self.n),
                got: (s.nrows(), s.ncols()),
            }
            .into());
        }
        let n = self.n;
        let l = s.transpose();
        let nnz = self.tril.len();

        let mut a = DMatrix::<f64>::zeros(nnz, nnz);
        for (a_idx, &(i, j)) in self.tril.iter().enumerate() {
            for (b_idx, &(p, q)) in self.tril.iter().enumerate() {
                let mut val = 0.0;
                if p == i {
                    val += l[(j, q)];
                }
                if p == j {
                    val += l[(i, q)];
                }
                a[(a_idx, b_idx)] = val;
            }
        }
        let lu = LU::new(a);

        let mut result = Vec::with_capacity(dq.len());
        for dqm in dq {
            if dqm.nrows() != n || dqm.ncols() != n {
                return Err(ErrorKind::Shape {
                    expected: (n, n),
                    got: (dqm.nrows(), dqm.ncols()),
                }
                .into());
            }
            let mut rhs = DVector::<f64>::zeros(nnz);
            for (idx, &(i, j)) in self.tril.iter().enumerate() {
                rhs[idx] = dqm[(i, j)];
            }
            let sol = lu.solve(&rhs).ok_or_else(|| Error::from(ErrorKind::Singular))?;
            let mut ds = DMatrix::<f64>::zeros(n, n);
            for (idx, &(i, j)) in self.tril.iter().enumerate() {
                ds[(j, i)] = sol[idx];
            }
            result.push(ds);
        }
        Ok(result)
    }
}

impl MatrixSqrt for CholeskySqrt {
    fn sqrt(&self, q: &DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
        let n = check_square(q)?;
        if n != self.n {
            return Err(ErrorKind::Shape {
                expected: (self.n, self.n),
                got: (n, n),
            }
            .into());
        }
        let chol = nalgebra::linalg::Cholesky::new(q.clone())
            .ok_or_else(|| Error::from(ErrorKind::NotSpd))?;
        Ok(chol.l().transpose())
    }
}

/// SVD-based square root. Has no analytic derivative.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvdSqrt;

impl SvdSqrt {
    pub fn new() -> Self {
        Self
    }

    /// Always fails: the SVD square root's derivative is unimplemented
    /// (an explicit `TODO` in the original source).
    pub fn diff(&self, _s: &DMatrix<f64>, _dq: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>, Error> {
        Err(ErrorKind::NotImplemented.into())
    }
}

impl MatrixSqrt for SvdSqrt {
    fn sqrt(&self, q: &DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
        check_square(q)?;
        let svd = nalgebra::linalg::SVD::new(q.clone(), true, true);
        let u = svd.u.ok_or_else(|| Error::from(ErrorKind::NotSpd))?;
        let sqrt_s = svd.singular_values.map(|v| v.sqrt());
        let scaled = u * DMatrix::from_diagonal(&sqrt_s);
        Ok(scaled.transpose())
    }
}
