//! Error types for the filter core.
//!
//! Mirrors the shape of the upstream `adskalman-rs` error module
//! (`Error` wrapping an `ErrorKind`), extended with the kinds this
//! crate's sensitivity-analysis machinery can fail with.

use core::fmt;

/// The kind of failure that occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// A `Model` output (or a derivative tensor) did not have the
    /// expected dimensions.
    Shape {
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// A matrix expected to be symmetric positive-definite was not
    /// (Cholesky factorization failed).
    NotSpd,
    /// The linear system solved for the Cholesky-factor derivative
    /// (`A_tril`) was singular.
    Singular,
    /// The requested operation is not implemented by this backend
    /// (e.g. the derivative of the SVD square root).
    NotImplemented,
    /// A derivative (`*_diff`) was requested before the corresponding
    /// forward pass populated the workspace it consumes.
    NotTransformed,
    /// `predict`/`correct`/`*_diff` were called out of the sequence
    /// required by the filter's state machine.
    OutOfOrder { expected: &'static str },
    /// A configuration option was invalid at construction time.
    InvalidOption { option: &'static str },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Shape { expected, got } => write!(
                f,
                "shape mismatch: expected {:?}, got {:?}",
                expected, got
            ),
            ErrorKind::NotSpd => write!(f, "matrix is not symmetric positive-definite"),
            ErrorKind::Singular => write!(f, "linear system is singular"),
            ErrorKind::NotImplemented => write!(f, "operation is not implemented"),
            ErrorKind::NotTransformed => {
                write!(f, "forward transform must be computed before its derivative")
            }
            ErrorKind::OutOfOrder { expected } => {
                write!(f, "filter step called out of order, expected {}", expected)
            }
            ErrorKind::InvalidOption { option } => {
                write!(f, "invalid configuration option: {}", option)
            }
        }
    }
}

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
