//! One-step state propagation (§4.3): unscented transform of the
//! drift function, addition of process noise, and the parallel
//! sensitivity propagation.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};
use nalgebra::DMatrix;

use crate::config::UtConfig;
use crate::debug_assert_symmetric;
use crate::error::Error;
use crate::model::Model;
use crate::state::FilterState;
use crate::unscented_transform::UnscentedTransform;

/// Propagates a [`FilterState`] one time step forward using a
/// [`Model`]'s drift function `f` and process-noise covariance `Q`.
pub struct Predictor {
    ut: UnscentedTransform,
}

impl Predictor {
    pub fn new(nx: usize, config: UtConfig) -> Result<Self, Error> {
        Ok(Self {
            ut: UnscentedTransform::new(nx, config)?,
        })
    }

    /// Propagate `state` one step: `k <- k+1`, `x <- f_mean`,
    /// `Px <- Pf + Q`. Saves the pre-step `(x, Px, dx/dq, dPx/dq)` for
    /// a later [`Predictor::prediction_diff`] call.
    pub fn predict(&mut self, model: &dyn Model, state: &mut FilterState) -> Result<(), Error> {
        let k = state.k();
        let x = state.x().clone();
        let px = state.px().clone();

        let (f_mean, pf) = self.ut.transform(&x, &px, |xs| model.f(k, xs))?;
        let q = model.q(k, &x);
        let px_new = pf + q;
        debug_assert_symmetric!(px_new);

        state.take_snapshot();
        state.advance_k();
        state.set_posterior(f_mean, px_new);
        Ok(())
    }

    /// Derivative of the prediction step, using the snapshot saved by
    /// the preceding [`Predictor::predict`] call.
    pub fn prediction_diff(&mut self, model: &dyn Model, state: &mut FilterState) -> Result<(), Error> {
        let k = state.prev_k();
        let x = state.prev_x().clone();
        let dx_dq = state.prev_dx_dq().clone();
        let dpx_dq = state.prev_dpx_dq().to_vec();
        let nq = dx_dq.nrows();

        let dq_dq = model.dq_dq(k, &x);
        let dq_dx = model.dq_dx(k, &x);
        let nx = x.len();
        let mut dq_total = vec![DMatrix::<f64>::zeros(nx, nx); nq];
        for a in 0..nq {
            let mut m = dq_dq[a].clone();
            for i in 0..nx {
                m += dx_dq[(a, i)] * &dq_dx[i];
            }
            dq_total[a] = m;
        }

        let (df_dq, dpf_dq) = self.ut.transform_diff(
            |xs| model.df_dq(k, xs),
            |xs| model.df_dx(k, xs),
            &dx_dq,
            &dpx_dq,
        )?;

        let new_dpx_dq: Vec<DMatrix<f64>> = dpf_dq
            .into_iter()
            .zip(dq_total.into_iter())
            .map(|(a, b)| a + b)
            .collect();

        state.set_sensitivity(df_dq, new_dpx_dq);
        Ok(())
    }
}
