use nalgebra::DVector;

use super::lstsq::{lstsq, vandermonde};
use super::roots::{horner, real_roots};
use super::{FitKind, Transformer, TransformerParameters, check_kind, check_samples, domain_of};
use crate::error::{CalibrationError, Result};

/// Polynomial `y = c0 + c1 x + ... + c_d x^d` fitted by least squares.
///
/// `convert_from` solves `p(x) = y`. When several real solutions exist the
/// one inside the fitted domain closest to its midpoint wins; failing that,
/// the solution closest to the midpoint (or to 0.0 without a domain). Ties go
/// to the smaller root.
#[derive(Debug, Clone)]
pub struct PolyFitTransformer {
    degree: usize,
    expire: Option<u64>,
    parameters: Option<TransformerParameters>,
}

impl PolyFitTransformer {
    pub fn new(degree: usize) -> Self {
        Self {
            degree,
            expire: None,
            parameters: None,
        }
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.expire = expire;
        self
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    fn coefficients(&self) -> Result<&[f64]> {
        self.parameters
            .as_ref()
            .map(TransformerParameters::coefficients)
            .ok_or(CalibrationError::NotFitted)
    }

    fn fit_coefficients(&self, x: &[f64], y: &[f64]) -> Result<Vec<f64>> {
        check_samples(x, y, self.degree + 1)?;
        lstsq(vandermonde(x, self.degree), &DVector::from_column_slice(y))
            .map(|c| c.iter().copied().collect())
            .map_err(|reason| CalibrationError::Fit {
                channel: None,
                samples: x.len(),
                reason,
            })
    }
}

/// Choose among candidate roots as documented on `PolyFitTransformer`.
fn select_root(roots: &[f64], domain: Option<(f64, f64)>) -> Option<f64> {
    let (mid, inside): (f64, Vec<f64>) = match domain {
        Some((lo, hi)) => {
            let slack = 1e-9 * (hi - lo).abs().max(1.0);
            (
                0.5 * (lo + hi),
                roots
                    .iter()
                    .copied()
                    .filter(|r| *r >= lo - slack && *r <= hi + slack)
                    .collect(),
            )
        }
        None => (0.0, Vec::new()),
    };
    let pool = if inside.is_empty() { roots } else { &inside };
    // roots arrive sorted ascending, so strict comparison keeps the smaller on ties
    pool.iter().copied().fold(None, |best: Option<f64>, r| match best {
        Some(b) if (b - mid).abs() <= (r - mid).abs() => Some(b),
        _ => Some(r),
    })
}

impl Transformer for PolyFitTransformer {
    fn kind(&self) -> FitKind {
        FitKind::Poly
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        self.parameters.as_ref()
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()> {
        check_kind(FitKind::Poly, &parameters)?;
        if parameters.degree() != Some(self.degree) {
            return Err(CalibrationError::InvalidParameters(format!(
                "expected degree {} parameters, got {:?}",
                self.degree,
                parameters.degree()
            )));
        }
        self.parameters = Some(parameters);
        Ok(())
    }

    fn convert_to(&self, x: f64) -> Result<f64> {
        Ok(horner(self.coefficients()?, x))
    }

    fn convert_from(&self, y: f64) -> Result<f64> {
        let mut c = self.coefficients()?.to_vec();
        if let Some(c0) = c.first_mut() {
            *c0 -= y;
        }
        let roots = real_roots(&c);
        let domain = self.parameters.as_ref().and_then(TransformerParameters::domain);
        select_root(&roots, domain).ok_or(CalibrationError::NoRealRoot(y))
    }

    fn min_samples(&self) -> usize {
        self.degree + 1
    }

    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        let coefficients = self.fit_coefficients(x, y)?;
        let p = TransformerParameters::new(FitKind::Poly, Some(self.degree), coefficients)?
            .with_expire(self.expire);
        Ok(match domain_of(x) {
            Some((lo, hi)) => p.with_domain(lo, hi),
            None => p,
        })
    }
}

/// Straight line `y = c0 + c1 x` with an exact inverse.
#[derive(Debug, Clone)]
pub struct LinearTransformer {
    inner: PolyFitTransformer,
    parameters: Option<TransformerParameters>,
}

impl Default for LinearTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearTransformer {
    pub fn new() -> Self {
        Self {
            inner: PolyFitTransformer::new(1),
            parameters: None,
        }
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.inner = self.inner.with_expire(expire);
        self
    }

    fn line(&self) -> Result<(f64, f64)> {
        match self.parameters.as_ref().map(TransformerParameters::coefficients) {
            Some([c0, c1]) => Ok((*c0, *c1)),
            _ => Err(CalibrationError::NotFitted),
        }
    }
}

impl Transformer for LinearTransformer {
    fn kind(&self) -> FitKind {
        FitKind::Linear
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        self.parameters.as_ref()
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()> {
        check_kind(FitKind::Linear, &parameters)?;
        self.parameters = Some(parameters);
        Ok(())
    }

    fn convert_to(&self, x: f64) -> Result<f64> {
        let (c0, c1) = self.line()?;
        Ok(c1.mul_add(x, c0))
    }

    fn convert_from(&self, y: f64) -> Result<f64> {
        let (c0, c1) = self.line()?;
        if c1 == 0.0 {
            return Err(CalibrationError::NoRealRoot(y));
        }
        Ok((y - c0) / c1)
    }

    fn min_samples(&self) -> usize {
        2
    }

    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        let coefficients = self.inner.fit_coefficients(x, y)?;
        let p = TransformerParameters::new(FitKind::Linear, None, coefficients)?
            .with_expire(self.inner.expire);
        Ok(match domain_of(x) {
            Some((lo, hi)) => p.with_domain(lo, hi),
            None => p,
        })
    }
}
