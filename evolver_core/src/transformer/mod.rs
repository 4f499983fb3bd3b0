//! Reversible value transformers and their fitted parameters.
//!
//! A transformer maps x to y (`convert_to`) and back (`convert_from`). Every
//! fitting transformer follows one direction rule: `fit(x, y)` produces
//! parameters with `convert_to(x) ≈ y`.

mod curve_fit;
mod lstsq;
mod poly;
mod rate;
mod roots;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::status::Status;

pub use curve_fit::{CurveFitTransformer, CurveModel, SigmoidModel, SigmoidTransformer};
pub use poly::{LinearTransformer, PolyFitTransformer};
pub use rate::{NoOpTransformer, RateTransformer};
pub use roots::real_roots;

/// Family of a transformer and its parameter layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitKind {
    /// Degree-1 polynomial: `[c0, c1]`.
    Linear,
    /// Polynomial of a given degree: `[c0, c1, ..., c_degree]`.
    Poly,
    /// Four-parameter logistic `[a, b, c, d]`.
    Sigmoid,
    /// Proportional `[rate]`.
    Rate,
    /// Identity, no coefficients.
    #[serde(rename = "noop")]
    NoOp,
}

impl fmt::Display for FitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Linear => "linear",
            Self::Poly => "poly",
            Self::Sigmoid => "sigmoid",
            Self::Rate => "rate",
            Self::NoOp => "noop",
        };
        f.write_str(s)
    }
}

impl FitKind {
    /// Number of coefficients required for this kind.
    pub fn expected_len(self, degree: Option<usize>) -> Result<usize> {
        match (self, degree) {
            (Self::Linear, None | Some(1)) => Ok(2),
            (Self::Linear, Some(d)) => Err(CalibrationError::InvalidParameters(format!(
                "linear transformers have degree 1, got {d}"
            ))),
            (Self::Poly, Some(d)) => d.checked_add(1).ok_or_else(|| {
                CalibrationError::InvalidParameters(format!("degree {d} is too large"))
            }),
            (Self::Poly, None) => Err(CalibrationError::InvalidParameters(
                "poly parameters need a degree".into(),
            )),
            (Self::Sigmoid, _) => Ok(4),
            (Self::Rate, _) => Ok(1),
            (Self::NoOp, _) => Ok(0),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawParameters {
    kind: FitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    degree: Option<usize>,
    coefficients: Vec<f64>,
    created: DateTime<Utc>,
    #[serde(default)]
    expire: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<(f64, f64)>,
}

/// Fitted parameters of one transformer. Replaced wholesale by a refit.
///
/// The coefficient count always matches the kind (`degree + 1` for
/// polynomials); this is checked on construction and when loading from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameters", into = "RawParameters")]
pub struct TransformerParameters {
    kind: FitKind,
    degree: Option<usize>,
    coefficients: Vec<f64>,
    created: DateTime<Utc>,
    expire: Option<u64>,
    domain: Option<(f64, f64)>,
}

impl TryFrom<RawParameters> for TransformerParameters {
    type Error = CalibrationError;

    fn try_from(raw: RawParameters) -> Result<Self> {
        let p = Self::new(raw.kind, raw.degree, raw.coefficients)?
            .with_created(raw.created)
            .with_expire(raw.expire);
        Ok(match raw.domain {
            Some((lo, hi)) => p.with_domain(lo, hi),
            None => p,
        })
    }
}

impl From<TransformerParameters> for RawParameters {
    fn from(p: TransformerParameters) -> Self {
        Self {
            kind: p.kind,
            degree: p.degree,
            coefficients: p.coefficients,
            created: p.created,
            expire: p.expire,
            domain: p.domain,
        }
    }
}

impl TransformerParameters {
    /// Validate and wrap coefficients. `created` is now; no expiry, no domain.
    pub fn new(kind: FitKind, degree: Option<usize>, coefficients: Vec<f64>) -> Result<Self> {
        let expected = kind.expected_len(degree)?;
        if coefficients.len() != expected {
            return Err(CalibrationError::InvalidParameters(format!(
                "{kind} parameters need {expected} coefficients, got {}",
                coefficients.len()
            )));
        }
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(CalibrationError::InvalidParameters(
                "coefficients must be finite".into(),
            ));
        }
        let degree = match kind {
            FitKind::Linear => Some(1),
            FitKind::Poly => degree,
            _ => None,
        };
        Ok(Self {
            kind,
            degree,
            coefficients,
            created: Utc::now(),
            expire: None,
            domain: None,
        })
    }

    #[must_use]
    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.expire = expire;
        self
    }

    /// Record the x range the parameters were fitted on.
    #[must_use]
    pub fn with_domain(mut self, lo: f64, hi: f64) -> Self {
        self.domain = Some((lo.min(hi), lo.max(hi)));
        self
    }

    pub fn kind(&self) -> FitKind {
        self.kind
    }

    pub fn degree(&self) -> Option<usize> {
        self.degree
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn expire(&self) -> Option<u64> {
        self.expire
    }

    pub fn domain(&self) -> Option<(f64, f64)> {
        self.domain
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Status {
        Status::compute(self.created, self.expire, now)
    }
}

/// A reversible mapping whose parameters can be fitted from paired samples.
pub trait Transformer: fmt::Debug + Send {
    fn kind(&self) -> FitKind;

    /// Current parameters; `None` until fitted or loaded.
    fn parameters(&self) -> Option<&TransformerParameters>;

    /// Replace the parameters wholesale. Fails if the kind does not match.
    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()>;

    fn convert_to(&self, x: f64) -> Result<f64>;

    fn convert_from(&self, y: f64) -> Result<f64>;

    /// Fewest samples `fit` accepts.
    fn min_samples(&self) -> usize;

    /// Fit new parameters so that `convert_to(x) ≈ y`. Leaves `self` untouched.
    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters>;

    /// Fit and install the result. The new `created` is strictly later than
    /// the previous one.
    fn refit(&mut self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        let mut fitted = self.fit(x, y)?;
        if let Some(old) = self.parameters()
            && fitted.created() <= old.created()
        {
            fitted = fitted.with_created(old.created() + Duration::nanoseconds(1));
        }
        self.set_parameters(fitted.clone())?;
        Ok(fitted)
    }

    fn status_at(&self, now: DateTime<Utc>) -> Option<Status> {
        self.parameters().map(|p| p.status_at(now))
    }

    fn status(&self) -> Option<Status> {
        self.status_at(Utc::now())
    }
}

/// Builds fresh transformers for per-channel slots.
pub type TransformerFactory = Arc<dyn Fn() -> Box<dyn Transformer> + Send + Sync>;

/// Declarative description of a transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerSpec {
    pub kind: FitKind,
    pub degree: Option<usize>,
    /// Lifetime of fitted parameters in seconds; `None` never expires.
    pub expire: Option<u64>,
    /// Initial coefficients, if any.
    pub coefficients: Option<Vec<f64>>,
}

impl TransformerSpec {
    pub fn new(kind: FitKind) -> Self {
        Self {
            kind,
            degree: None,
            expire: None,
            coefficients: None,
        }
    }

    pub fn poly(degree: usize) -> Self {
        Self {
            degree: Some(degree),
            ..Self::new(FitKind::Poly)
        }
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.expire = expire;
        self
    }

    /// A factory that builds this spec. Fails early if the spec is invalid.
    pub fn factory(&self) -> Result<TransformerFactory> {
        build_transformer(self)?;
        let spec = self.clone();
        Ok(Arc::new(move || {
            build_transformer(&spec).unwrap_or_else(|_| Box::new(NoOpTransformer::new()))
        }))
    }
}

/// Build a transformer from its description.
pub fn build_transformer(spec: &TransformerSpec) -> Result<Box<dyn Transformer>> {
    let mut t: Box<dyn Transformer> = match spec.kind {
        FitKind::Linear => {
            if spec.degree.is_some_and(|d| d != 1) {
                return Err(CalibrationError::InvalidParameters(
                    "linear transformers have degree 1".into(),
                ));
            }
            Box::new(LinearTransformer::new().with_expire(spec.expire))
        }
        FitKind::Poly => {
            let degree = spec.degree.ok_or_else(|| {
                CalibrationError::InvalidParameters("poly transformers need a degree".into())
            })?;
            Box::new(PolyFitTransformer::new(degree).with_expire(spec.expire))
        }
        FitKind::Sigmoid => Box::new(SigmoidTransformer::new().with_expire(spec.expire)),
        FitKind::Rate => Box::new(RateTransformer::new().with_expire(spec.expire)),
        FitKind::NoOp => Box::new(NoOpTransformer::new()),
    };
    if let Some(c) = &spec.coefficients {
        let p = TransformerParameters::new(spec.kind, spec.degree, c.clone())?
            .with_expire(spec.expire);
        t.set_parameters(p)?;
    }
    Ok(t)
}

/// Rebuild a transformer around persisted parameters.
pub fn transformer_from_parameters(parameters: TransformerParameters) -> Result<Box<dyn Transformer>> {
    let spec = TransformerSpec {
        kind: parameters.kind(),
        degree: parameters.degree(),
        expire: parameters.expire(),
        coefficients: None,
    };
    let mut t = build_transformer(&spec)?;
    t.set_parameters(parameters)?;
    Ok(t)
}

/// Validate paired samples before fitting.
pub(crate) fn check_samples(x: &[f64], y: &[f64], min: usize) -> Result<()> {
    if x.len() != y.len() {
        return Err(CalibrationError::Fit {
            channel: None,
            samples: x.len().min(y.len()),
            reason: format!("x has {} samples but y has {}", x.len(), y.len()),
        });
    }
    if x.len() < min {
        return Err(CalibrationError::InsufficientData {
            channel: None,
            needed: min,
            got: x.len(),
        });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(CalibrationError::Fit {
            channel: None,
            samples: x.len(),
            reason: "samples must be finite".into(),
        });
    }
    Ok(())
}

/// Inclusive range covered by `x`.
pub(crate) fn domain_of(x: &[f64]) -> Option<(f64, f64)> {
    let lo = x.iter().copied().reduce(f64::min)?;
    let hi = x.iter().copied().reduce(f64::max)?;
    Some((lo, hi))
}

/// Ensure parameters handed to `set_parameters` belong to this transformer.
pub(crate) fn check_kind(expected: FitKind, p: &TransformerParameters) -> Result<()> {
    if p.kind() == expected {
        Ok(())
    } else {
        Err(CalibrationError::InvalidParameters(format!(
            "expected {expected} parameters, got {}",
            p.kind()
        )))
    }
}
