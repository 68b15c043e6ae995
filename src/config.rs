//! Typed filter configuration, replacing the original source's
//! free-form keyword-option bags (`**options`, `pred_ut_*`/`corr_ut_*`
//! prefixed keys).

use crate::error::{Error, ErrorKind};

/// Which backend `MatrixSqrt` uses.
///
/// `Svd` does not support analytic derivatives; requesting one raises
/// [`ErrorKind::NotImplemented`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqrtKind {
    Cholesky,
    Svd,
}

impl Default for SqrtKind {
    fn default() -> Self {
        SqrtKind::Cholesky
    }
}

/// Configuration for a single [`crate::unscented_transform::UnscentedTransform`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtConfig {
    /// Backend used for the symmetric square root.
    pub sqrt: SqrtKind,
    /// Relative weight of the center sigma point. Zero by default.
    pub kappa: f64,
}

impl Default for UtConfig {
    fn default() -> Self {
        Self {
            sqrt: SqrtKind::Cholesky,
            kappa: 0.0,
        }
    }
}

impl UtConfig {
    /// Validate this configuration against an input dimension.
    ///
    /// `ni + kappa != 0` is required so that the unscented-transform
    /// scaling factor is well defined.
    pub fn validate(&self, ni: usize) -> Result<(), Error> {
        if (ni as f64 + self.kappa).abs() < f64::EPSILON {
            return Err(ErrorKind::InvalidOption { option: "kappa" }.into());
        }
        Ok(())
    }
}

/// Top-level filter configuration.
///
/// `pred_ut`/`corr_ut` default to `sqrt`/`kappa` but may be overridden
/// independently, mirroring the original source's `pred_ut_*`/
/// `corr_ut_*` option prefixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// Default square-root backend, inherited by `pred_ut`/`corr_ut`
    /// unless overridden.
    pub sqrt: SqrtKind,
    /// Default center-weight, inherited by `pred_ut`/`corr_ut` unless
    /// overridden.
    pub kappa: f64,
    /// Unscented-transform configuration used by the predictor.
    pub pred_ut: UtConfig,
    /// Unscented-transform configuration used by the corrector.
    pub corr_ut: UtConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let sqrt = SqrtKind::Cholesky;
        let kappa = 0.0;
        Self {
            sqrt,
            kappa,
            pred_ut: UtConfig { sqrt, kappa },
            corr_ut: UtConfig { sqrt, kappa },
        }
    }
}

impl FilterConfig {
    /// Start from the defaults, overriding `sqrt`.
    pub fn with_sqrt(mut self, sqrt: SqrtKind) -> Self {
        self.sqrt = sqrt;
        self.pred_ut.sqrt = sqrt;
        self.corr_ut.sqrt = sqrt;
        self
    }

    /// Start from the defaults, overriding `kappa`.
    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = kappa;
        self.pred_ut.kappa = kappa;
        self.corr_ut.kappa = kappa;
        self
    }

    /// Validate both sub-configurations against the state dimension.
    ///
    /// Both the predictor's and the corrector's unscented transforms
    /// draw sigma points from state space, so both are sized by `nx`,
    /// not by the measurement dimension.
    pub fn validate(&self, nx: usize) -> Result<(), Error> {
        self.pred_ut.validate(nx)?;
        self.corr_ut.validate(nx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_cholesky_zero_kappa() {
        let cfg = FilterConfig::default();
        assert_eq!(cfg.sqrt, SqrtKind::Cholesky);
        assert_eq!(cfg.kappa, 0.0);
        assert_eq!(cfg.pred_ut.kappa, 0.0);
        assert_eq!(cfg.corr_ut.kappa, 0.0);
    }

    #[test]
    fn zero_kappa_with_zero_dimension_is_invalid() {
        let ut = UtConfig {
            sqrt: SqrtKind::Cholesky,
            kappa: 0.0,
        };
        assert!(ut.validate(0).is_err());
        assert!(ut.validate(1).is_ok());
    }

    #[test]
    fn with_kappa_overrides_both_sub_configs() {
        let cfg = FilterConfig::default().with_kappa(3.0).with_sqrt(SqrtKind::Svd);
        assert_eq!(cfg.pred_ut.kappa, 3.0);
        assert_eq!(cfg.corr_ut.kappa, 3.0);
        assert_eq!(cfg.pred_ut.sqrt, SqrtKind::Svd);
    }
}
