use std::fmt;
use std::marker::PhantomData;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};

use super::{FitKind, Transformer, TransformerParameters, check_kind, check_samples, domain_of};
use crate::error::{CalibrationError, Result};

/// A closed-form model with an algebraic inverse.
pub trait CurveModel: fmt::Debug + Send + Sync + 'static {
    const KIND: FitKind;
    const N_PARAMS: usize;

    fn func_to(x: f64, p: &[f64]) -> f64;

    /// Inverse of `func_to`; `None` where no x maps to `y`.
    fn func_from(y: f64, p: &[f64]) -> Option<f64>;

    /// Starting point for the optimizer.
    fn initial_guess(x: &[f64], y: &[f64]) -> Vec<f64>;
}

/// Transformer whose parameters are found by non-linear least squares
/// (`levenberg_marquardt` with a forward-difference Jacobian).
#[derive(Debug, Clone)]
pub struct CurveFitTransformer<M: CurveModel> {
    expire: Option<u64>,
    parameters: Option<TransformerParameters>,
    _model: PhantomData<M>,
}

impl<M: CurveModel> Default for CurveFitTransformer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: CurveModel> CurveFitTransformer<M> {
    pub fn new() -> Self {
        Self {
            expire: None,
            parameters: None,
            _model: PhantomData,
        }
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.expire = expire;
        self
    }

    fn coefficients(&self) -> Result<&[f64]> {
        self.parameters
            .as_ref()
            .map(TransformerParameters::coefficients)
            .ok_or(CalibrationError::NotFitted)
    }
}

/// Residuals `f(x_i, p) - y_i` with a forward-difference Jacobian.
struct CurveProblem<'a> {
    f: fn(f64, &[f64]) -> f64,
    x: &'a [f64],
    y: &'a [f64],
    p: DVector<f64>,
}

impl CurveProblem<'_> {
    fn eval(&self, p: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.x.len(),
            self.x.iter().zip(self.y).map(|(xi, yi)| (self.f)(*xi, p) - yi),
        )
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for CurveProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, p: &DVector<f64>) {
        self.p.copy_from(p);
    }

    fn params(&self) -> DVector<f64> {
        self.p.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.eval(self.p.as_slice());
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let base = self.eval(self.p.as_slice());
        let mut jac = DMatrix::zeros(self.x.len(), self.p.len());
        for j in 0..self.p.len() {
            let h = 1e-7 * self.p[j].abs().max(1e-3);
            let mut ph = self.p.clone();
            ph[j] += h;
            let col = (self.eval(ph.as_slice()) - &base) / h;
            jac.set_column(j, &col);
        }
        jac.iter().all(|v| v.is_finite()).then_some(jac)
    }
}

/// Minimize the sum of squared residuals of `f` starting from `p0`.
pub(crate) fn levenberg_marquardt(
    f: fn(f64, &[f64]) -> f64,
    x: &[f64],
    y: &[f64],
    p0: Vec<f64>,
) -> std::result::Result<Vec<f64>, String> {
    let problem = CurveProblem {
        f,
        x,
        y,
        p: DVector::from_vec(p0),
    };
    if problem.residuals().is_none() {
        return Err("initial guess produces non-finite residuals".into());
    }
    let (problem, report) = LevenbergMarquardt::new().minimize(problem);
    // out of evaluations or stuck at a local minimum still leaves usable parameters
    let converged = report.termination.was_successful()
        || matches!(
            report.termination,
            TerminationReason::LostPatience | TerminationReason::NoImprovementPossible(_)
        );
    if !converged {
        return Err(format!("optimizer stopped: {:?}", report.termination));
    }
    if problem.p.iter().all(|v| v.is_finite()) && report.objective_function.is_finite() {
        Ok(problem.p.iter().copied().collect())
    } else {
        Err("optimizer did not converge".into())
    }
}

impl<M: CurveModel> Transformer for CurveFitTransformer<M> {
    fn kind(&self) -> FitKind {
        M::KIND
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        self.parameters.as_ref()
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()> {
        check_kind(M::KIND, &parameters)?;
        self.parameters = Some(parameters);
        Ok(())
    }

    fn convert_to(&self, x: f64) -> Result<f64> {
        let v = M::func_to(x, self.coefficients()?);
        if v.is_finite() {
            Ok(v)
        } else {
            Err(CalibrationError::InvalidParameters(format!(
                "{} model is not finite at x = {x}",
                M::KIND
            )))
        }
    }

    fn convert_from(&self, y: f64) -> Result<f64> {
        M::func_from(y, self.coefficients()?)
            .filter(|v| v.is_finite())
            .ok_or(CalibrationError::NoRealRoot(y))
    }

    fn min_samples(&self) -> usize {
        M::N_PARAMS
    }

    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        check_samples(x, y, M::N_PARAMS)?;
        let p = levenberg_marquardt(M::func_to, x, y, M::initial_guess(x, y)).map_err(|reason| {
            CalibrationError::Fit {
                channel: None,
                samples: x.len(),
                reason,
            }
        })?;
        let params = TransformerParameters::new(M::KIND, None, p)?.with_expire(self.expire);
        Ok(match domain_of(x) {
            Some((lo, hi)) => params.with_domain(lo, hi),
            None => params,
        })
    }
}

/// Four-parameter logistic in base 10:
/// `y = a + (b - a) / (1 + 10^((c - x) d))`.
#[derive(Debug, Clone, Copy)]
pub struct SigmoidModel;

impl CurveModel for SigmoidModel {
    const KIND: FitKind = FitKind::Sigmoid;
    const N_PARAMS: usize = 4;

    fn func_to(x: f64, p: &[f64]) -> f64 {
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        a + (b - a) / (1.0 + 10f64.powf((c - x) * d))
    }

    fn func_from(y: f64, p: &[f64]) -> Option<f64> {
        let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
        if d == 0.0 || y == a {
            return None;
        }
        let ratio = (b - a) / (y - a) - 1.0;
        if ratio <= 0.0 {
            return None;
        }
        Some(c - ratio.log10() / d)
    }

    fn initial_guess(x: &[f64], y: &[f64]) -> Vec<f64> {
        let lo = y.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (x_lo, x_hi) = domain_of(x).unwrap_or((0.0, 1.0));
        let span = (x_hi - x_lo).abs().max(f64::EPSILON);
        let half = 0.5 * (lo + hi);
        let c = x
            .iter()
            .zip(y)
            .min_by(|(_, a), (_, b)| (*a - half).abs().total_cmp(&(*b - half).abs()))
            .map_or(0.5 * (x_lo + x_hi), |(xi, _)| *xi);

        // y rises with x when the sample at the largest x is above the one at the smallest
        let at = |target: f64| {
            x.iter()
                .zip(y)
                .min_by(|(a, _), (b, _)| (*a - target).abs().total_cmp(&(*b - target).abs()))
                .map_or(0.0, |(_, yi)| *yi)
        };
        let rising = at(x_hi) >= at(x_lo);
        let margin = 0.05 * (hi - lo).abs().max(f64::EPSILON);
        let (a, b) = if rising {
            (lo - margin, hi + margin)
        } else {
            (hi + margin, lo - margin)
        };
        vec![a, b, c, 4.0 / span]
    }
}

pub type SigmoidTransformer = CurveFitTransformer<SigmoidModel>;
