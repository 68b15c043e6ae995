//! The unscented transform: sigma-point generation, propagation of a
//! mean/covariance pair through an arbitrary map, and the parallel
//! derivative path used by the PEM gradient.
//!
//! One `UnscentedTransform` is reused across every time step of a
//! single predictor or corrector (it owns the scratch workspace the
//! spec calls `isigma`/`idev`/`osigma`/`odev`/... rather than
//! reallocating it per call). It knows nothing about `k` or which
//! physical quantity it transforms; `Predictor`/`Corrector` close over
//! the `Model` before calling [`UnscentedTransform::transform`].

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};
use nalgebra::{DMatrix, DVector};

use crate::config::{SqrtKind, UtConfig};
use crate::error::{Error, ErrorKind};
use crate::matrix_sqrt::{CholeskySqrt, MatrixSqrt, SvdSqrt};
use crate::trace;

fn outer(u: &DVector<f64>, v: &DVector<f64>) -> DMatrix<f64> {
    u * v.transpose()
}

enum SqrtBackend {
    Cholesky(CholeskySqrt),
    Svd(SvdSqrt),
}

impl SqrtBackend {
    fn sqrt(&self, q: &DMatrix<f64>) -> Result<DMatrix<f64>, Error> {
        match self {
            SqrtBackend::Cholesky(k) => k.sqrt(q),
            SqrtBackend::Svd(k) => k.sqrt(q),
        }
    }

    fn diff(&self, s: &DMatrix<f64>, dq: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>, Error> {
        match self {
            SqrtBackend::Cholesky(k) => k.diff(s, dq),
            SqrtBackend::Svd(k) => k.diff(s, dq),
        }
    }
}

/// Forward-pass workspace: sigma points and their deviations, retained
/// between `transform`/`crosscov` and their `*_diff` counterparts.
struct Forward {
    s: DMatrix<f64>,
    isigma: Vec<DVector<f64>>,
    idev: Vec<DVector<f64>>,
    osigma: Vec<DVector<f64>>,
    odev: Vec<DVector<f64>>,
}

/// Derivative-pass workspace, populated by `sigma_points_diff`/
/// `transform_diff` and consumed by `crosscov_diff`.
struct Backward {
    didev_dq: Vec<DMatrix<f64>>,
    dodev_dq: Vec<DMatrix<f64>>,
}

/// A reusable unscented-transform kernel for a fixed input dimension.
pub struct UnscentedTransform {
    ni: usize,
    kappa: f64,
    nsigma: usize,
    weights: DVector<f64>,
    backend: SqrtBackend,
    forward: Option<Forward>,
    backward: Option<Backward>,
}

impl UnscentedTransform {
    /// Build a transform for input dimension `ni` from a [`UtConfig`].
    pub fn new(ni: usize, config: UtConfig) -> Result<Self, Error> {
        config.validate(ni)?;
        let kappa = config.kappa;
        let has_center = kappa != 0.0;
        let nsigma = if has_center { 2 * ni + 1 } else { 2 * ni };

        let mut weights = DVector::<f64>::from_element(nsigma, 1.0 / (2.0 * (ni as f64 + kappa)));
        if has_center {
            weights[2 * ni] = kappa / (ni as f64 + kappa);
        }

        let backend = match config.sqrt {
            SqrtKind::Cholesky => SqrtBackend::Cholesky(CholeskySqrt::new(ni)),
            SqrtKind::Svd => SqrtBackend::Svd(SvdSqrt::new()),
        };

        Ok(Self {
            ni,
            kappa,
            nsigma,
            weights,
            backend,
            forward: None,
            backward: None,
        })
    }

    /// Number of sigma points generated per transform.
    pub fn nsigma(&self) -> usize {
        self.nsigma
    }

    /// The unscented-transform weights. Sum to 1 by construction.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    fn check_input(&self, i: &DVector<f64>, pi: &DMatrix<f64>) -> Result<(), Error> {
        if i.len() != self.ni {
            return Err(ErrorKind::Shape {
                expected: (self.ni, 1),
                got: (i.len(), 1),
            }
            .into());
        }
        if pi.nrows() != self.ni || pi.ncols() != self.ni {
            return Err(ErrorKind::Shape {
                expected: (self.ni, self.ni),
                got: (pi.nrows(), pi.ncols()),
            }
            .into());
        }
        Ok(())
    }

    /// Generate sigma points from `(i, Pi)`, retaining them (and their
    /// deviations from `i`) on the workspace for `crosscov`/`*_diff`.
    pub fn sigma_points(&mut self, i: &DVector<f64>, pi: &DMatrix<f64>) -> Result<Vec<DVector<f64>>, Error> {
        self.check_input(i, pi)?;
        let scale = self.ni as f64 + self.kappa;
        let scaled = pi * scale;
        let s = self.backend.sqrt(&scaled)?;
        trace!("ut sqrt S = {:?}", s);

        let mut idev = Vec::with_capacity(self.nsigma);
        for k in 0..self.ni {
            idev.push(s.row(k).transpose());
        }
        for k in 0..self.ni {
            idev.push(-s.row(k).transpose());
        }
        if self.kappa != 0.0 {
            idev.push(DVector::<f64>::zeros(self.ni));
        }

        let isigma: Vec<DVector<f64>> = idev.iter().map(|d| d + i).collect();

        self.forward = Some(Forward {
            s,
            isigma: isigma.clone(),
            idev,
            osigma: Vec::new(),
            odev: Vec::new(),
        });
        self.backward = None;
        Ok(isigma)
    }

    /// Propagate `(i, Pi)` through `f`, returning `(mean, covariance)`.
    pub fn transform(
        &mut self,
        i: &DVector<f64>,
        pi: &DMatrix<f64>,
        f: impl Fn(&DVector<f64>) -> DVector<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>), Error> {
        let isigma = self.sigma_points(i, pi)?;
        let osigma: Vec<DVector<f64>> = isigma.iter().map(&f).collect();
        let no = osigma[0].len();

        let mut o = DVector::<f64>::zeros(no);
        for (k, ok) in osigma.iter().enumerate() {
            o += self.weights[k] * ok;
        }
        let odev: Vec<DVector<f64>> = osigma.iter().map(|ok| ok - &o).collect();

        let mut po = DMatrix::<f64>::zeros(no, no);
        for (k, dk) in odev.iter().enumerate() {
            po += self.weights[k] * outer(dk, dk);
        }
        trace!("ut transform o = {:?}, Po = {:?}", o, po);

        if let Some(fw) = &mut self.forward {
            fw.osigma = osigma;
            fw.odev = odev;
        }
        Ok((o, po))
    }

    /// Input/output cross-covariance from the last `transform` call.
    pub fn crosscov(&self) -> Result<DMatrix<f64>, Error> {
        let fw = self.forward.as_ref().ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;
        if fw.odev.is_empty() {
            return Err(ErrorKind::NotTransformed.into());
        }
        let ni = self.ni;
        let no = fw.odev[0].len();
        let mut pio = DMatrix::<f64>::zeros(ni, no);
        for k in 0..self.nsigma {
            pio += self.weights[k] * outer(&fw.idev[k], &fw.odev[k]);
        }
        Ok(pio)
    }

    /// Derivative of the sigma points with respect to `q`, given
    /// `di/dq` (`nq x ni`) and `dPi/dq` (one `ni x ni` symmetric slice
    /// per parameter).
    pub fn sigma_points_diff(
        &mut self,
        di_dq: &DMatrix<f64>,
        dpi_dq: &[DMatrix<f64>],
    ) -> Result<Vec<DMatrix<f64>>, Error> {
        let ni = self.ni;
        let nq = di_dq.nrows();
        if di_dq.ncols() != ni {
            return Err(ErrorKind::Shape {
                expected: (nq, ni),
                got: (di_dq.nrows(), di_dq.ncols()),
            }
            .into());
        }
        let scale = ni as f64 + self.kappa;
        let fw = self
            .forward
            .as_ref()
            .ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;
        let s = fw.s.clone();

        let scaled_dpi: Vec<DMatrix<f64>> = dpi_dq.iter().map(|m| m * scale).collect();
        let ds_dq = self.backend.diff(&s, &scaled_dpi)?;

        let mut ddev_dq = Vec::with_capacity(self.nsigma);
        for k in 0..ni {
            let mut m = DMatrix::<f64>::zeros(nq, ni);
            for (a, ds) in ds_dq.iter().enumerate() {
                m.row_mut(a).copy_from(&ds.row(k));
            }
            ddev_dq.push(m);
        }
        for k in 0..ni {
            ddev_dq.push(-ddev_dq[k].clone());
        }
        if self.kappa != 0.0 {
            ddev_dq.push(DMatrix::<f64>::zeros(nq, ni));
        }

        let disigma_dq: Vec<DMatrix<f64>> = ddev_dq.iter().map(|d| d + di_dq).collect();

        self.backward = Some(Backward {
            didev_dq: ddev_dq,
            dodev_dq: Vec::new(),
        });
        Ok(disigma_dq)
    }

    /// Derivative of `(mean, covariance)` with respect to `q`.
    ///
    /// `df_dq`/`df_di` are evaluated at each retained sigma point
    /// (input-major Jacobian convention, see [`crate::model::Model`]).
    #[allow(clippy::type_complexity)]
    pub fn transform_diff(
        &mut self,
        df_dq: impl Fn(&DVector<f64>) -> DMatrix<f64>,
        df_di: impl Fn(&DVector<f64>) -> DMatrix<f64>,
        di_dq: &DMatrix<f64>,
        dpi_dq: &[DMatrix<f64>],
    ) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>), Error> {
        let nq = di_dq.nrows();
        let disigma_dq = self.sigma_points_diff(di_dq, dpi_dq)?;
        let fw = self
            .forward
            .as_ref()
            .ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;
        if fw.odev.is_empty() {
            return Err(ErrorKind::NotTransformed.into());
        }
        let no = fw.odev[0].len();

        let mut dosigma_dq = Vec::with_capacity(self.nsigma);
        for k in 0..self.nsigma {
            let jac_di = df_di(&fw.isigma[k]); // ni x no
            let jac_dq = df_dq(&fw.isigma[k]); // nq x no
            dosigma_dq.push(&disigma_dq[k] * jac_di + jac_dq);
        }

        let mut do_dq = DMatrix::<f64>::zeros(nq, no);
        for (k, d) in dosigma_dq.iter().enumerate() {
            do_dq += self.weights[k] * d;
        }
        let dodev_dq: Vec<DMatrix<f64>> = dosigma_dq.iter().map(|d| d - &do_dq).collect();

        let mut dpo_dq = vec![DMatrix::<f64>::zeros(no, no); nq];
        for a in 0..nq {
            let mut m = DMatrix::<f64>::zeros(no, no);
            for k in 0..self.nsigma {
                let row = dodev_dq[k].row(a).transpose();
                m += self.weights[k] * outer(&row, &fw.odev[k]);
            }
            dpo_dq[a] = &m + m.transpose();
        }

        trace!("ut transform_diff do_dq = {:?}", do_dq);
        if let Some(bw) = &mut self.backward {
            bw.dodev_dq = dodev_dq;
        }
        Ok((do_dq, dpo_dq))
    }

    /// Derivative of the cross-covariance from the last
    /// `transform_diff` call.
    pub fn crosscov_diff(&self) -> Result<Vec<DMatrix<f64>>, Error> {
        let fw = self.forward.as_ref().ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;
        let bw = self.backward.as_ref().ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;
        if bw.dodev_dq.is_empty() {
            return Err(ErrorKind::NotTransformed.into());
        }
        let ni = self.ni;
        let no = fw.odev[0].len();
        let nq = bw.didev_dq[0].nrows();

        let mut dpio_dq = vec![DMatrix::<f64>::zeros(ni, no); nq];
        for a in 0..nq {
            let mut m = DMatrix::<f64>::zeros(ni, no);
            for k in 0..self.nsigma {
                let didev_row = bw.didev_dq[k].row(a).transpose();
                let dodev_row = bw.dodev_dq[k].row(a).transpose();
                m += self.weights[k] * outer(&didev_row, &fw.odev[k]);
                m += self.weights[k] * outer(&fw.idev[k], &dodev_row);
            }
            dpio_dq[a] = m;
        }
        Ok(dpio_dq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ut(ni: usize, kappa: f64) -> UnscentedTransform {
        UnscentedTransform::new(ni, UtConfig { sqrt: SqrtKind::Cholesky, kappa }).unwrap()
    }

    fn spd(n: usize, seed: f64) -> DMatrix<f64> {
        let a = DMatrix::<f64>::from_fn(n, n, |i, j| ((i + 1) as f64 * 0.31 + (j + 1) as f64 * 0.17 + seed).cos());
        &a * a.transpose() + DMatrix::<f64>::identity(n, n) * 0.7
    }

    fn random_spd(n: usize, rng: &mut impl rand::Rng) -> DMatrix<f64> {
        let a = DMatrix::<f64>::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
        &a * a.transpose() + DMatrix::<f64>::identity(n, n) * 0.5
    }

    #[test]
    fn sigma_point_reconstruction_holds_across_random_seeds() {
        use rand::{rngs::StdRng, SeedableRng};
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let n = 3;
            let mut t = ut(n, 0.0);
            let x = DVector::<f64>::from_fn(n, |_, _| rng.gen_range(-5.0..5.0));
            let p = random_spd(n, &mut rng);
            let sigma = t.sigma_points(&x, &p).unwrap();

            let mut mean = DVector::<f64>::zeros(n);
            for (k, s) in sigma.iter().enumerate() {
                mean += t.weights()[k] * s;
            }
            assert_relative_eq!(mean, x, max_relative = 1e-6, epsilon = 1e-6);

            let mut cov = DMatrix::<f64>::zeros(n, n);
            for (k, s) in sigma.iter().enumerate() {
                let d = s - &x;
                cov += t.weights()[k] * outer(&d, &d);
            }
            assert_relative_eq!(cov, p, max_relative = 1e-6, epsilon = 1e-6);
        }
    }

    #[test]
    fn weights_sum_to_one() {
        for kappa in [0.0, 1.5] {
            let t = ut(3, kappa);
            assert_relative_eq!(t.weights().sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn sigma_point_reconstruction() {
        for kappa in [0.0, 2.0] {
            let mut t = ut(2, kappa);
            let x = DVector::from_vec(vec![1.0, -2.0]);
            let p = spd(2, 3.0);
            let sigma = t.sigma_points(&x, &p).unwrap();

            let mut mean = DVector::<f64>::zeros(2);
            for (k, s) in sigma.iter().enumerate() {
                mean += t.weights()[k] * s;
            }
            assert_relative_eq!(mean, x, max_relative = 1e-8, epsilon = 1e-8);

            let mut cov = DMatrix::<f64>::zeros(2, 2);
            for (k, s) in sigma.iter().enumerate() {
                let d = s - &x;
                cov += t.weights()[k] * outer(&d, &d);
            }
            assert_relative_eq!(cov, p, max_relative = 1e-8, epsilon = 1e-8);
        }
    }

    #[test]
    fn affine_ut_is_exact() {
        let mut t = ut(2, 0.0);
        let x = DVector::from_vec(vec![0.5, 1.5]);
        let p = spd(2, 1.0);
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, -0.1, 1.2]);
        let b = DVector::from_vec(vec![0.2, -0.4]);
        let (mean, cov) = t.transform(&x, &p, |s| &a * s + &b).unwrap();
        let pio = t.crosscov().unwrap();

        assert_relative_eq!(mean, &a * &x + &b, max_relative = 1e-8, epsilon = 1e-8);
        assert_relative_eq!(cov, &a * &p * a.transpose(), max_relative = 1e-8, epsilon = 1e-8);
        assert_relative_eq!(pio, &p * a.transpose(), max_relative = 1e-8, epsilon = 1e-8);
    }

    #[test]
    fn diff_before_forward_is_not_transformed() {
        let mut t = ut(2, 0.0);
        let di_dq = DMatrix::<f64>::zeros(1, 2);
        let err = t.sigma_points_diff(&di_dq, &[DMatrix::zeros(2, 2)]).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NotTransformed);
    }

    #[test]
    fn transform_diff_matches_central_difference() {
        let ni = 2;
        let nq = 1;
        let h = 1e-5;

        let x0 = DVector::from_vec(vec![0.4, -0.3]);
        let p0 = spd(ni, 4.0);
        let dx_dir = DVector::from_vec(vec![0.05, -0.02]);
        let dp_dir = spd(ni, 9.0) * 0.01;

        let f = |s: &DVector<f64>| DVector::from_vec(vec![s[0] * s[0] + s[1], s[0] * s[1], s[1] * s[1]]);
        let df_di = |s: &DVector<f64>| {
            DMatrix::from_row_slice(2, 3, &[2.0 * s[0], s[1], 0.0, 1.0, s[0], 2.0 * s[1]])
        };
        let di_dq = DMatrix::from_row_slice(nq, ni, &[dx_dir[0], dx_dir[1]]);

        let mut t_plus = ut(ni, 0.0);
        let x_plus = &x0 + &dx_dir * h;
        let p_plus = &p0 + &dp_dir * h;
        let (o_plus, _) = t_plus.transform(&x_plus, &p_plus, f).unwrap();

        let mut t_minus = ut(ni, 0.0);
        let x_minus = &x0 - &dx_dir * h;
        let p_minus = &p0 - &dp_dir * h;
        let (o_minus, _) = t_minus.transform(&x_minus, &p_minus, f).unwrap();

        let fd_do_dq = (o_plus - o_minus) / (2.0 * h);

        let mut t0 = ut(ni, 0.0);
        t0.transform(&x0, &p0, f).unwrap();
        let (do_dq, _) = t0
            .transform_diff(|_| DMatrix::zeros(nq, 3), df_di, &di_dq, &[dp_dir.clone()])
            .unwrap();

        assert_relative_eq!(do_dq.row(0).transpose(), fd_do_dq, max_relative = 1e-3, epsilon = 1e-5);
    }
}
