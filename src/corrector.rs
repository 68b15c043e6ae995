//! Measurement update (§4.4): unscented transform of the measurement
//! function, Cholesky factorization of the innovation covariance,
//! Kalman gain, partial-measurement masking, log-likelihood
//! accumulation, and the parallel sensitivity propagation.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;
use nalgebra::{DMatrix, DVector};

use crate::config::UtConfig;
use crate::debug_assert_symmetric;
use crate::error::{Error, ErrorKind};
use crate::matrix_sqrt::{CholeskySqrt, MatrixSqrt};
use crate::model::Model;
use crate::state::FilterState;
use crate::trace;
use crate::unscented_transform::UnscentedTransform;

/// Forward-pass quantities retained for `update_likelihood`/
/// `correction_diff`/`likelihood_diff`.
struct Workspace {
    active: Vec<usize>,
    e: DVector<f64>,
    pxh: DMatrix<f64>,
    py: DMatrix<f64>,
    py_i: DMatrix<f64>,
    py_c: DMatrix<f64>,
    k_gain: DMatrix<f64>,
    diff: Option<DiffWorkspace>,
}

struct DiffWorkspace {
    de_dq: Vec<DVector<f64>>,
    dpy_dq: Vec<DMatrix<f64>>,
    dpy_i_dq: Vec<DMatrix<f64>>,
    dk_dq: Vec<DMatrix<f64>>,
}

/// Performs the measurement-update step of the filter.
pub struct Corrector {
    ut: UnscentedTransform,
    ws: Option<Workspace>,
}

impl Corrector {
    pub fn new(nx: usize, config: UtConfig) -> Result<Self, Error> {
        Ok(Self {
            ut: UnscentedTransform::new(nx, config)?,
            ws: None,
        })
    }

    /// Apply a (possibly partially masked) measurement.
    ///
    /// `mask[i] == true` marks component `i` as unobserved. If every
    /// component is masked, `(x, Px)` are left unchanged and all later
    /// `*_diff`/`update_likelihood` calls for this step become no-ops.
    pub fn correct(
        &mut self,
        model: &dyn Model,
        state: &mut FilterState,
        y: &DVector<f64>,
        mask: &[bool],
    ) -> Result<(), Error> {
        if y.len() != mask.len() {
            return Err(ErrorKind::Shape {
                expected: (mask.len(), 1),
                got: (y.len(), 1),
            }
            .into());
        }
        let active: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, m)| !**m)
            .map(|(i, _)| i)
            .collect();

        if active.is_empty() {
            self.ws = None;
            return Ok(());
        }

        let k = state.k();
        let x = state.x().clone();
        let px = state.px().clone();

        let r_active = model.r().select_rows(&active).select_columns(&active);
        let y_active = y.select_rows(&active);

        let (h_mean, ph) = self
            .ut
            .transform(&x, &px, |xs| model.h(k, xs).select_rows(&active))?;
        let pxh = self.ut.crosscov()?;

        let py = ph + r_active;
        let n_active = active.len();
        let chol = CholeskySqrt::new(n_active);
        let py_c = chol.sqrt(&py)?;
        let py_ci = py_c.clone().try_inverse().ok_or_else(|| Error::from(ErrorKind::NotSpd))?;
        let py_i = &py_ci * py_ci.transpose();

        let e = &y_active - &h_mean;
        let k_gain = &pxh * &py_i;
        let x_corr = &x + &k_gain * &e;
        let px_corr = &px - &k_gain * &py * k_gain.transpose();
        debug_assert_symmetric!(px_corr);
        trace!("correct e = {:?}, K = {:?}", e, k_gain);

        state.take_snapshot();
        state.set_posterior(x_corr, px_corr);

        self.ws = Some(Workspace {
            active,
            e,
            pxh,
            py,
            py_i,
            py_c,
            k_gain,
            diff: None,
        });
        Ok(())
    }

    /// Accumulate the Gaussian negative-half-log-density contribution
    /// of the last `correct` call into `state`'s log-likelihood.
    ///
    /// The additive constant `0.5 * |active| * log(2*pi)` is
    /// deliberately omitted (spec §4.4).
    pub fn update_likelihood(&self, state: &mut FilterState) -> Result<(), Error> {
        let ws = match &self.ws {
            Some(ws) => ws,
            None => return Ok(()),
        };
        let diag: Vec<f64> = (0..ws.py_c.nrows()).map(|i| ws.py_c[(i, i)]).collect();
        let quad = (ws.e.transpose() * &ws.py_i * &ws.e)[(0, 0)];
        let log_det_term: f64 = diag.iter().map(|d| d.ln()).sum();
        state.add_likelihood(-0.5 * quad - log_det_term);
        Ok(())
    }

    /// Derivative of the correction step, using the snapshot saved by
    /// the preceding `correct` call.
    pub fn correction_diff(&mut self, model: &dyn Model, state: &mut FilterState) -> Result<(), Error> {
        let active = match &self.ws {
            Some(ws) => ws.active.clone(),
            None => return Ok(()),
        };

        let k = state.prev_k();
        let x = state.prev_x().clone();
        let dx_dq = state.prev_dx_dq().clone();
        let dpx_dq = state.prev_dpx_dq().to_vec();

        let dr_dq_active: Vec<DMatrix<f64>> = model
            .dr_dq()
            .iter()
            .map(|m| m.select_rows(&active).select_columns(&active))
            .collect();

        let (dh_dq, dph_dq) = self.ut.transform_diff(
            |xs| model.dh_dq(k, xs).select_columns(&active),
            |xs| model.dh_dx(k, xs).select_columns(&active),
            &dx_dq,
            &dpx_dq,
        )?;
        let dpxh_dq = self.ut.crosscov_diff()?;

        let ws = self.ws.as_ref().expect("checked above");
        let pxh = ws.pxh.clone();
        let py = ws.py.clone();
        let py_i = ws.py_i.clone();
        let k_gain = ws.k_gain.clone();
        let e = ws.e.clone();
        let nq = dh_dq.nrows();
        let nx = x.len();

        let mut de_dq = Vec::with_capacity(nq);
        let mut dpy_dq = Vec::with_capacity(nq);
        let mut dpy_i_dq = Vec::with_capacity(nq);
        let mut dk_dq = Vec::with_capacity(nq);

        for a in 0..nq {
            let de = -dh_dq.row(a).transpose();
            let dpy = &dph_dq[a] + &dr_dq_active[a];
            let dpy_i = -(&py_i * &dpy * &py_i);
            let dk = &dpxh_dq[a] * &py_i + &pxh * &dpy_i;
            de_dq.push(de);
            dpy_dq.push(dpy);
            dpy_i_dq.push(dpy_i);
            dk_dq.push(dk);
        }

        let mut new_dx_dq = dx_dq.clone();
        let mut new_dpx_dq = dpx_dq.clone();
        for a in 0..nq {
            let contrib = &dk_dq[a] * &e + &k_gain * &de_dq[a];
            for i in 0..nx {
                new_dx_dq[(a, i)] += contrib[i];
            }

            let term = &dk_dq[a] * &py * k_gain.transpose()
                + &k_gain * &dpy_dq[a] * k_gain.transpose()
                + &k_gain * &py * dk_dq[a].transpose();
            new_dpx_dq[a] -= term;
        }

        state.set_sensitivity(new_dx_dq, new_dpx_dq);

        if let Some(ws) = &mut self.ws {
            ws.diff = Some(DiffWorkspace {
                de_dq,
                dpy_dq,
                dpy_i_dq,
                dk_dq,
            });
        }
        Ok(())
    }

    /// Derivative of the log-likelihood contribution of the last
    /// `correct`/`correction_diff` pair.
    pub fn likelihood_diff(&self, state: &mut FilterState) -> Result<(), Error> {
        let ws = match &self.ws {
            Some(ws) => ws,
            None => return Ok(()),
        };
        let diff = ws
            .diff
            .as_ref()
            .ok_or_else(|| Error::from(ErrorKind::NotTransformed))?;

        let n_active = ws.active.len();
        let chol = CholeskySqrt::new(n_active);
        let dpy_c_dq = chol.diff(&ws.py_c, &diff.dpy_dq)?;
        let diag_py_c: Vec<f64> = (0..n_active).map(|i| ws.py_c[(i, i)]).collect();

        let nq = diff.de_dq.len();
        let mut delta = DVector::<f64>::zeros(nq);
        for a in 0..nq {
            let diag_dpy_c_a: f64 = (0..n_active).map(|i| dpy_c_dq[a][(i, i)] / diag_py_c[i]).sum();

            let de_term = (diff.de_dq[a].transpose() * &ws.py_i * &ws.e)[(0, 0)];
            let dpy_i_term = (ws.e.transpose() * &diff.dpy_i_dq[a] * &ws.e)[(0, 0)];
            let de_term2 = (ws.e.transpose() * &ws.py_i * &diff.de_dq[a])[(0, 0)];

            delta[a] = -diag_dpy_c_a - 0.5 * (de_term + dpy_i_term + de_term2);
        }
        state.add_likelihood_grad(&delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqrtKind;
    use approx::assert_relative_eq;

    struct IdentityModel {
        r: f64,
    }

    impl Model for IdentityModel {
        fn nx(&self) -> usize {
            1
        }
        fn nq(&self) -> usize {
            1
        }
        fn ny(&self) -> usize {
            1
        }
        fn f(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
            x.clone()
        }
        fn h(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
            x.clone()
        }
        fn q(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_element(1, 1, 0.01)
        }
        fn r(&self) -> DMatrix<f64> {
            DMatrix::from_element(1, 1, self.r)
        }
        fn df_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn df_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::zeros(1, 1)
        }
        fn dh_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn dh_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::zeros(1, 1)
        }
        fn dq_dx(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
            vec![DMatrix::zeros(1, 1)]
        }
        fn dq_dq(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
            vec![DMatrix::zeros(1, 1)]
        }
        fn dr_dq(&self) -> Vec<DMatrix<f64>> {
            vec![DMatrix::from_element(1, 1, 1.0)]
        }
    }

    fn corrector() -> Corrector {
        Corrector::new(1, UtConfig { sqrt: SqrtKind::Cholesky, kappa: 0.0 }).unwrap()
    }

    #[test]
    fn fully_masked_measurement_is_idempotent() {
        let m = IdentityModel { r: 1.0 };
        let mut c = corrector();
        let mut state = FilterState::new(DVector::from_vec(vec![1.0]), DMatrix::from_element(1, 1, 1.0), 1);
        let x_before = state.x().clone();
        let px_before = state.px().clone();
        let l_before = state.l();

        c.correct(&m, &mut state, &DVector::from_vec(vec![0.0]), &[true]).unwrap();
        c.update_likelihood(&mut state).unwrap();

        assert_eq!(state.x(), &x_before);
        assert_eq!(state.px(), &px_before);
        assert_eq!(state.l(), l_before);
    }

    #[test]
    fn correct_reduces_covariance_and_shrinks_toward_measurement() {
        let m = IdentityModel { r: 1.0 };
        let mut c = corrector();
        let mut state = FilterState::new(DVector::from_vec(vec![0.0]), DMatrix::from_element(1, 1, 1.0), 1);

        c.correct(&m, &mut state, &DVector::from_vec(vec![2.0]), &[false]).unwrap();

        // Standard scalar KF: gain = 1/(1+1) = 0.5, x' = 0 + 0.5*2 = 1, P' = 1 - 0.5 = 0.5
        assert_relative_eq!(state.x()[0], 1.0, max_relative = 1e-8);
        assert_relative_eq!(state.px()[(0, 0)], 0.5, max_relative = 1e-8);
    }

    #[test]
    fn covariance_stays_symmetric() {
        let m = IdentityModel { r: 1.0 };
        let mut c = corrector();
        let mut state = FilterState::new(DVector::from_vec(vec![0.0]), DMatrix::from_element(1, 1, 1.0), 1);
        c.correct(&m, &mut state, &DVector::from_vec(vec![0.3]), &[false]).unwrap();
        let px = state.px();
        assert_relative_eq!(px[(0, 0)], px[(0, 0)], epsilon = 1e-12);
    }

    #[test]
    fn likelihood_diff_matches_central_difference() {
        // q scales R: R(q) = r0 + q. Track dL/dq analytically vs finite differences.
        struct RModel {
            r0: f64,
            dr: f64,
        }
        impl Model for RModel {
            fn nx(&self) -> usize {
                1
            }
            fn nq(&self) -> usize {
                1
            }
            fn ny(&self) -> usize {
                1
            }
            fn f(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
                x.clone()
            }
            fn h(&self, _k: usize, x: &DVector<f64>) -> DVector<f64> {
                x.clone()
            }
            fn q(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::from_element(1, 1, 0.01)
            }
            fn r(&self) -> DMatrix<f64> {
                DMatrix::from_element(1, 1, self.r0)
            }
            fn df_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::identity(1, 1)
            }
            fn df_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::zeros(1, 1)
            }
            fn dh_dx(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::identity(1, 1)
            }
            fn dh_dq(&self, _k: usize, _x: &DVector<f64>) -> DMatrix<f64> {
                DMatrix::zeros(1, 1)
            }
            fn dq_dx(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
                vec![DMatrix::zeros(1, 1)]
            }
            fn dq_dq(&self, _k: usize, _x: &DVector<f64>) -> Vec<DMatrix<f64>> {
                vec![DMatrix::zeros(1, 1)]
            }
            fn dr_dq(&self) -> Vec<DMatrix<f64>> {
                vec![DMatrix::from_element(1, 1, self.dr)]
            }
        }

        let h = 1e-5;
        let run_l = |r: f64| -> f64 {
            let m = RModel { r0: r, dr: 1.0 };
            let mut c = corrector();
            let mut state = FilterState::new(DVector::from_vec(vec![0.0]), DMatrix::from_element(1, 1, 1.0), 1);
            c.correct(&m, &mut state, &DVector::from_vec(vec![0.7]), &[false]).unwrap();
            c.update_likelihood(&mut state).unwrap();
            state.l()
        };
        let fd = (run_l(1.0 + h) - run_l(1.0 - h)) / (2.0 * h);

        let m = RModel { r0: 1.0, dr: 1.0 };
        let mut c = corrector();
        let mut state = FilterState::new(DVector::from_vec(vec![0.0]), DMatrix::from_element(1, 1, 1.0), 1);
        c.correct(&m, &mut state, &DVector::from_vec(vec![0.7]), &[false]).unwrap();
        c.correction_diff(&m, &mut state).unwrap();
        c.update_likelihood(&mut state).unwrap();
        c.likelihood_diff(&mut state).unwrap();

        assert_relative_eq!(state.dl_dq()[0], fd, max_relative = 1e-3, epsilon = 1e-5);
    }
}
