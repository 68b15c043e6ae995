//! The mutable state bundle carried step-to-step by a [`crate::filter::Filter`].
//!
//! Shaped after the teacher crate's `StateAndCovariance` (plain
//! getters, a `new` constructor, an `inner()` destructor), extended
//! with the PEM sensitivity fields and the previous-step snapshot the
//! `*_diff` calls consume.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};
use nalgebra::{DMatrix, DVector};

/// Posterior state, covariance, log-likelihood, and their derivatives
/// with respect to the parameter vector `q`.
#[derive(Debug, Clone)]
pub struct FilterState {
    k: usize,
    x: DVector<f64>,
    px: DMatrix<f64>,
    l: f64,
    dx_dq: DMatrix<f64>,
    dpx_dq: Vec<DMatrix<f64>>,
    dl_dq: DVector<f64>,

    /// Snapshot taken by `predict`/`correct`, consumed by the matching
    /// `*_diff` call. `None` once consumed or before the first step.
    prev: Option<Snapshot>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    k: usize,
    x: DVector<f64>,
    dx_dq: DMatrix<f64>,
    dpx_dq: Vec<DMatrix<f64>>,
}

impl FilterState {
    /// Create the initial filter state: `k = 0`, zero log-likelihood
    /// and zero derivatives.
    pub fn new(x0: DVector<f64>, px0: DMatrix<f64>, nq: usize) -> Self {
        let nx = x0.len();
        Self {
            k: 0,
            x: x0,
            px: px0,
            l: 0.0,
            dx_dq: DMatrix::<f64>::zeros(nq, nx),
            dpx_dq: vec![DMatrix::<f64>::zeros(nx, nx); nq],
            dl_dq: DVector::<f64>::zeros(nq),
            prev: None,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn px(&self) -> &DMatrix<f64> {
        &self.px
    }

    pub fn l(&self) -> f64 {
        self.l
    }

    pub fn dx_dq(&self) -> &DMatrix<f64> {
        &self.dx_dq
    }

    pub fn dpx_dq(&self) -> &[DMatrix<f64>] {
        &self.dpx_dq
    }

    pub fn dl_dq(&self) -> &DVector<f64> {
        &self.dl_dq
    }

    pub(crate) fn take_snapshot(&mut self) {
        self.prev = Some(Snapshot {
            k: self.k,
            x: self.x.clone(),
            dx_dq: self.dx_dq.clone(),
            dpx_dq: self.dpx_dq.clone(),
        });
    }

    pub(crate) fn prev_k(&self) -> usize {
        self.prev.as_ref().expect("snapshot taken before predict/correct").k
    }

    pub(crate) fn prev_x(&self) -> &DVector<f64> {
        &self.prev.as_ref().expect("snapshot taken before predict/correct").x
    }

    pub(crate) fn prev_dx_dq(&self) -> &DMatrix<f64> {
        &self.prev.as_ref().expect("snapshot taken before predict/correct").dx_dq
    }

    pub(crate) fn prev_dpx_dq(&self) -> &[DMatrix<f64>] {
        &self.prev.as_ref().expect("snapshot taken before predict/correct").dpx_dq
    }

    pub(crate) fn set_posterior(&mut self, x: DVector<f64>, px: DMatrix<f64>) {
        self.x = x;
        self.px = px;
    }

    pub(crate) fn set_sensitivity(&mut self, dx_dq: DMatrix<f64>, dpx_dq: Vec<DMatrix<f64>>) {
        self.dx_dq = dx_dq;
        self.dpx_dq = dpx_dq;
    }

    pub(crate) fn advance_k(&mut self) {
        self.k += 1;
    }

    pub(crate) fn add_likelihood(&mut self, delta: f64) {
        self.l += delta;
    }

    pub(crate) fn add_likelihood_grad(&mut self, delta: &DVector<f64>) {
        self.dl_dq += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_zero_derivatives() {
        let x0 = DVector::from_vec(vec![1.0, 2.0]);
        let px0 = DMatrix::<f64>::identity(2, 2);
        let s = FilterState::new(x0.clone(), px0.clone(), 3);
        assert_eq!(s.k(), 0);
        assert_eq!(s.x(), &x0);
        assert_eq!(s.px(), &px0);
        assert_eq!(s.l(), 0.0);
        assert_eq!(s.dx_dq().nrows(), 3);
        assert_eq!(s.dpx_dq().len(), 3);
        assert_eq!(s.dl_dq().len(), 3);
    }
}
