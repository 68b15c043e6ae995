//! Discrete-time unscented Kalman filtering with first-order parameter
//! sensitivities.
//!
//! Characteristics:
//! - Uses the [nalgebra](https://nalgebra.org) crate for math.
//! - Supports `no_std` (the `std` feature gates logging and
//!   `std::error::Error`).
//! - Two interchangeable matrix-square-root backends for the
//!   unscented transform; see [`config::SqrtKind`].
//! - Every `predict`/`correct` step has a matching `*_diff` call that
//!   propagates `d(state)/dq`, `d(covariance)/dq` and
//!   `d(log-likelihood)/dq` for a prediction-error-method gradient,
//!   without duplicating the forward pass.
//! - Strong typing used to keep Jacobian and tensor conventions
//!   explicit rather than convention-by-comment.
//!
//! Throughout the library, `nx` is the state dimension, `ny` the
//! measurement dimension, and `nq` the number of tracked parameters.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(debug_assertions)]
use approx::assert_relative_eq;
use nalgebra as na;

// Without std, create a dummy trace!() macro so modules can import
// `crate::trace` uniformly regardless of the `std` feature.
#[cfg(feature = "std")]
pub(crate) use log::trace;

#[cfg(not(feature = "std"))]
macro_rules! trace {
    ($e:expr) => {{}};
    ($e:expr, $($es:expr),+) => {{}};
}
#[cfg(not(feature = "std"))]
pub(crate) use trace;

/// perform a runtime check that matrix is symmetric
///
/// only compiled in debug mode
macro_rules! debug_assert_symmetric {
    ($mat:expr) => {
        #[cfg(debug_assertions)]
        {
            assert_relative_eq!($mat, &$mat.transpose(), max_relative = na::convert(1e-5));
        }
    };
}
pub(crate) use debug_assert_symmetric;

mod error;
pub use error::{Error, ErrorKind};

mod config;
pub use config::{FilterConfig, SqrtKind, UtConfig};

mod model;
pub use model::Model;

mod matrix_sqrt;
pub use matrix_sqrt::{CholeskySqrt, MatrixSqrt, SvdSqrt};

mod unscented_transform;
pub use unscented_transform::UnscentedTransform;

mod state;
pub use state::FilterState;

mod predictor;
pub use predictor::Predictor;

mod corrector;
pub use corrector::Corrector;

mod filter;
pub use filter::{Filter, Observation};
