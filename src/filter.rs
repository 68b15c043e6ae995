//! The top-level filtering driver (§4.6): composes a [`Predictor`] and
//! a [`Corrector`] around one [`FilterState`], and enforces the call
//! order a prediction-error-method gradient pass requires.
//!
//! A single time step walks `Quiescent -> Corrected -> [CorrDiffed] ->
//! Predicted -> [PredDiffed] -> Quiescent`. The `*_diff` calls are
//! optional; skipping them is how plain filtering (no gradient) stays
//! cheap. Calling a step out of order is a programmer error, not a
//! numerical one, so it raises [`ErrorKind::OutOfOrder`] rather than
//! silently producing nonsense.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;
use nalgebra::{DMatrix, DVector};

use crate::config::FilterConfig;
use crate::corrector::Corrector;
use crate::error::{Error, ErrorKind};
use crate::model::Model;
use crate::predictor::Predictor;
use crate::state::FilterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Quiescent,
    Corrected,
    CorrDiffed,
    Predicted,
    PredDiffed,
}

/// One observation in a filtered sequence: the measurement vector and
/// a mask of which of its components are unobserved at this step.
pub struct Observation<'a> {
    pub y: &'a DVector<f64>,
    pub mask: &'a [bool],
}

/// Drives a [`Model`] through a sequence of predict/correct steps,
/// optionally propagating first-order sensitivities with respect to
/// the model's parameter vector `q`.
pub struct Filter {
    predictor: Predictor,
    corrector: Corrector,
    state: FilterState,
    step: Step,
}

impl Filter {
    /// Build a filter seeded at `(x0, Px0)` with `nq` tracked
    /// parameters.
    pub fn new(model: &dyn Model, x0: DVector<f64>, px0: DMatrix<f64>, config: FilterConfig) -> Result<Self, Error> {
        let nx = model.nx();
        if x0.len() != nx || px0.nrows() != nx || px0.ncols() != nx {
            return Err(ErrorKind::Shape {
                expected: (nx, nx),
                got: (px0.nrows(), px0.ncols()),
            }
            .into());
        }
        config.validate(nx)?;
        Ok(Self {
            predictor: Predictor::new(nx, config.pred_ut)?,
            corrector: Corrector::new(nx, config.corr_ut)?,
            state: FilterState::new(x0, px0, model.nq()),
            step: Step::Quiescent,
        })
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    fn expect(&self, allowed: &[Step], expected: &'static str) -> Result<(), Error> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(ErrorKind::OutOfOrder { expected }.into())
        }
    }

    /// Apply a (possibly partially masked) measurement.
    pub fn correct(&mut self, model: &dyn Model, y: &DVector<f64>, mask: &[bool]) -> Result<(), Error> {
        self.expect(
            &[Step::Quiescent, Step::Predicted, Step::PredDiffed],
            "correct after construction, predict, or prediction_diff",
        )?;
        self.corrector.correct(model, &mut self.state, y, mask)?;
        self.corrector.update_likelihood(&mut self.state)?;
        self.step = Step::Corrected;
        Ok(())
    }

    /// Derivative of the last [`Filter::correct`] call.
    pub fn correction_diff(&mut self, model: &dyn Model) -> Result<(), Error> {
        self.expect(&[Step::Corrected], "correction_diff after correct")?;
        self.corrector.correction_diff(model, &mut self.state)?;
        self.corrector.likelihood_diff(&mut self.state)?;
        self.step = Step::CorrDiffed;
        Ok(())
    }

    /// Advance the state one time step.
    pub fn predict(&mut self, model: &dyn Model) -> Result<(), Error> {
        self.expect(&[Step::Corrected, Step::CorrDiffed], "predict after correct or correction_diff")?;
        self.predictor.predict(model, &mut self.state)?;
        self.step = Step::Predicted;
        Ok(())
    }

    /// Derivative of the last [`Filter::predict`] call.
    pub fn prediction_diff(&mut self, model: &dyn Model) -> Result<(), Error> {
        self.expect(&[Step::Predicted], "prediction_diff after predict")?;
        self.predictor.prediction_diff(model, &mut self.state)?;
        self.step = Step::PredDiffed;
        Ok(())
    }

    /// Run one correct/predict cycle without derivatives. `predict` is
    /// skipped on the last observation: there is nothing downstream of
    /// it to roll the state forward into.
    fn step_filter(&mut self, model: &dyn Model, obs: &Observation, is_last: bool) -> Result<(), Error> {
        self.correct(model, obs.y, obs.mask)?;
        if !is_last {
            self.predict(model)?;
        }
        Ok(())
    }

    /// Run one correct/predict cycle with derivatives, same last-step
    /// guard as [`Filter::step_filter`].
    fn step_gradient(&mut self, model: &dyn Model, obs: &Observation, is_last: bool) -> Result<(), Error> {
        self.correct(model, obs.y, obs.mask)?;
        self.correction_diff(model)?;
        if !is_last {
            self.predict(model)?;
            self.prediction_diff(model)?;
        }
        Ok(())
    }

    /// Filter a full sequence of observations, returning the posterior
    /// state estimate and covariance at each step. The trailing
    /// `predict` past the last observation is skipped, leaving the
    /// filter's internal state at that last observation's posterior.
    pub fn filter(&mut self, model: &dyn Model, observations: &[Observation]) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>), Error> {
        let nx = model.nx();
        let n = observations.len();
        let mut xs = DMatrix::<f64>::zeros(n, nx);
        let mut pxs = Vec::with_capacity(n);
        for (row, obs) in observations.iter().enumerate() {
            self.correct(model, obs.y, obs.mask)?;
            xs.row_mut(row).copy_from(&self.state.x().transpose());
            pxs.push(self.state.px().clone());
            if row + 1 < n {
                self.predict(model)?;
            }
        }
        Ok((xs, pxs))
    }

    /// The prediction-error-method merit (final accumulated
    /// log-likelihood) for a full sequence of observations.
    pub fn pem_merit(&mut self, model: &dyn Model, observations: &[Observation]) -> Result<f64, Error> {
        let n = observations.len();
        for (i, obs) in observations.iter().enumerate() {
            self.step_filter(model, obs, i + 1 == n)?;
        }
        Ok(self.state.l())
    }

    /// The gradient of [`Filter::pem_merit`] with respect to `q`.
    pub fn pem_gradient(&mut self, model: &dyn Model, observations: &[Observation]) -> Result<DVector<f64>, Error> {
        let n = observations.len();
        for (i, obs) in observations.iter().enumerate() {
            self.step_gradient(model, obs, i + 1 == n)?;
        }
        Ok(self.state.dl_dq().clone())
    }
}
