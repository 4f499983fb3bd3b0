use chrono::Utc;

use super::{FitKind, Transformer, TransformerParameters, check_kind, check_samples, domain_of};
use crate::error::{CalibrationError, Result};

/// Proportional transformer `y = rate * x`, e.g. pump run time to volume.
#[derive(Debug, Clone, Default)]
pub struct RateTransformer {
    expire: Option<u64>,
    parameters: Option<TransformerParameters>,
}

impl RateTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_expire(mut self, expire: Option<u64>) -> Self {
        self.expire = expire;
        self
    }

    fn rate(&self) -> Result<f64> {
        match self.parameters.as_ref().map(TransformerParameters::coefficients) {
            Some([rate]) => Ok(*rate),
            _ => Err(CalibrationError::NotFitted),
        }
    }
}

impl Transformer for RateTransformer {
    fn kind(&self) -> FitKind {
        FitKind::Rate
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        self.parameters.as_ref()
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()> {
        check_kind(FitKind::Rate, &parameters)?;
        self.parameters = Some(parameters);
        Ok(())
    }

    fn convert_to(&self, x: f64) -> Result<f64> {
        Ok(self.rate()? * x)
    }

    fn convert_from(&self, y: f64) -> Result<f64> {
        let rate = self.rate()?;
        if rate == 0.0 {
            return Err(CalibrationError::NoRealRoot(y));
        }
        Ok(y / rate)
    }

    fn min_samples(&self) -> usize {
        1
    }

    /// Least squares through the origin: `rate = Σxy / Σx²`.
    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        check_samples(x, y, 1)?;
        let sxx: f64 = x.iter().map(|v| v * v).sum();
        if sxx == 0.0 {
            return Err(CalibrationError::Fit {
                channel: None,
                samples: x.len(),
                reason: "all x samples are zero".into(),
            });
        }
        let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
        let p = TransformerParameters::new(FitKind::Rate, None, vec![sxy / sxx])?
            .with_expire(self.expire);
        Ok(match domain_of(x) {
            Some((lo, hi)) => p.with_domain(lo, hi),
            None => p,
        })
    }
}

/// Identity transformer. Always "fitted"; fitting only refreshes `created`.
#[derive(Debug, Clone)]
pub struct NoOpTransformer {
    parameters: TransformerParameters,
}

impl Default for NoOpTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl NoOpTransformer {
    pub fn new() -> Self {
        Self {
            parameters: identity_parameters(),
        }
    }
}

fn identity_parameters() -> TransformerParameters {
    TransformerParameters {
        kind: FitKind::NoOp,
        degree: None,
        coefficients: Vec::new(),
        created: Utc::now(),
        expire: None,
        domain: None,
    }
}

impl Transformer for NoOpTransformer {
    fn kind(&self) -> FitKind {
        FitKind::NoOp
    }

    fn parameters(&self) -> Option<&TransformerParameters> {
        Some(&self.parameters)
    }

    fn set_parameters(&mut self, parameters: TransformerParameters) -> Result<()> {
        check_kind(FitKind::NoOp, &parameters)?;
        self.parameters = parameters;
        Ok(())
    }

    fn convert_to(&self, x: f64) -> Result<f64> {
        Ok(x)
    }

    fn convert_from(&self, y: f64) -> Result<f64> {
        Ok(y)
    }

    fn min_samples(&self) -> usize {
        0
    }

    fn fit(&self, x: &[f64], y: &[f64]) -> Result<TransformerParameters> {
        check_samples(x, y, 0)?;
        Ok(identity_parameters())
    }
}
