//! The `Model` capability interface.
//!
//! The original source (`qwfilter/kalman.py`) passes a duck-typed
//! `model` object exposing `nx`/`nq`/`ny`, `f`/`h`/`Q`/`R` and their
//! partial derivatives. This crate models that capability set as a
//! trait rather than an abstract base class, following the same
//! "interface, not inheritance" shape the teacher crate uses for
//! `TransitionModelLinearNoControl`/`ObservationModel`.
//!
//! Jacobians are stored "input-major": `df_dx`/`dh_dx`/`df_dq`/`dh_dq`
//! have shape `(input_dim, output_dim)`, the transpose of the usual
//! convention, so that they right-multiply a `(nq, input_dim)`
//! sensitivity matrix directly. `dQ_dx`/`dQ_dq`/`dR_dq` are tensors
//! indexed along the differentiation axis; since `nalgebra` has no
//! dense tensor type, each is represented as one `DMatrix` per slice
//! of that axis (`Vec<DMatrix<f64>>`).

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;
use nalgebra::{DMatrix, DVector};

/// The system model consumed by [`crate::predictor::Predictor`] and
/// [`crate::corrector::Corrector`].
///
/// This crate treats `Model` purely as a capability interface: it
/// neither constructs nor differentiates the drift/measurement
/// functions, it only calls them.
pub trait Model {
    /// Dimension of the state vector.
    fn nx(&self) -> usize;
    /// Dimension of the parameter vector `q`.
    fn nq(&self) -> usize;
    /// Dimension of the measurement vector.
    fn ny(&self) -> usize;

    /// Drift function: state at time `k` to state at time `k+1`.
    fn f(&self, k: usize, x: &DVector<f64>) -> DVector<f64>;
    /// Measurement function at time `k`.
    fn h(&self, k: usize, x: &DVector<f64>) -> DVector<f64>;
    /// Process noise covariance at time `k`, SPD, shape `(nx, nx)`.
    fn q(&self, k: usize, x: &DVector<f64>) -> DMatrix<f64>;
    /// Measurement noise covariance, SPD, shape `(ny, ny)`.
    fn r(&self) -> DMatrix<f64>;

    /// `df/dx`, shape `(nx, nx)`, input-major.
    fn df_dx(&self, k: usize, x: &DVector<f64>) -> DMatrix<f64>;
    /// `df/dq`, shape `(nq, nx)`.
    fn df_dq(&self, k: usize, x: &DVector<f64>) -> DMatrix<f64>;
    /// `dh/dx`, shape `(nx, ny)`, input-major.
    fn dh_dx(&self, k: usize, x: &DVector<f64>) -> DMatrix<f64>;
    /// `dh/dq`, shape `(nq, ny)`.
    fn dh_dq(&self, k: usize, x: &DVector<f64>) -> DMatrix<f64>;
    /// `dQ/dx`, one `(nx, nx)` symmetric slice per state dimension.
    fn dq_dx(&self, k: usize, x: &DVector<f64>) -> Vec<DMatrix<f64>>;
    /// `dQ/dq`, one `(nx, nx)` symmetric slice per parameter.
    fn dq_dq(&self, k: usize, x: &DVector<f64>) -> Vec<DMatrix<f64>>;
    /// `dR/dq`, one `(ny, ny)` symmetric slice per parameter.
    fn dr_dq(&self) -> Vec<DMatrix<f64>>;
}
