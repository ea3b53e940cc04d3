//! Confidence limits of the sampling distributions used to judge a fit.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

use crate::error::StatsError;
use crate::fit::significant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
    ChiSquare,
    ReducedChiSquare,
    Gaussian,
    Student,
}

impl Distribution {
    pub fn label(self) -> &'static str {
        match self {
            Distribution::ChiSquare => "Chi²",
            Distribution::ReducedChiSquare => "Reduced Chi²",
            Distribution::Gaussian => "Gaussian",
            Distribution::Student => "Student t",
        }
    }

    fn needs_dof(self) -> bool {
        !matches!(self, Distribution::Gaussian)
    }

    fn needs_spread(self) -> bool {
        matches!(self, Distribution::Gaussian | Distribution::Student)
    }
}

/// Which side(s) of the distribution the confidence level covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Limits {
    /// Central interval, equal tails on both sides.
    TwoSided,
    /// Only a lower limit; the interval is open above.
    Lower,
    /// Only an upper limit; the interval is open below.
    Upper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub distribution: Distribution,
    pub limits: Limits,
    /// A probability in `(0, 1)`, or a percentage in `(1, 100)`.
    pub confidence: f64,
    pub dof: Option<f64>,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interval {
    pub distribution: Distribution,
    pub limits: Limits,
    pub confidence: f64,
    pub dof: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Request {
    /// Confidence as a probability.
    fn probability(&self) -> Result<f64, StatsError> {
        let level = self.confidence;
        let probability = if level > 1.0 && level < 100.0 {
            level / 100.0
        } else {
            level
        };
        if probability > 0.0 && probability < 1.0 {
            Ok(probability)
        } else {
            Err(StatsError::Confidence(level))
        }
    }

    fn validated_dof(&self) -> Result<Option<f64>, StatsError> {
        if !self.distribution.needs_dof() {
            return Ok(None);
        }
        match self.dof {
            Some(dof) if dof > 0.0 && dof.is_finite() => Ok(Some(dof)),
            other => Err(StatsError::DegreesOfFreedom(other.unwrap_or(0.0))),
        }
    }

    fn quantile(&self, dof: Option<f64>, p: f64) -> Result<f64, StatsError> {
        let dof = dof.unwrap_or(1.0);
        let value = match self.distribution {
            Distribution::ChiSquare => chi_squared(dof)?.inverse_cdf(p),
            Distribution::ReducedChiSquare => chi_squared(dof)?.inverse_cdf(p) / dof,
            Distribution::Gaussian => Normal::new(self.mean, self.std)
                .map_err(|err| StatsError::Distribution(err.to_string()))?
                .inverse_cdf(p),
            Distribution::Student => {
                let t = StudentsT::new(0.0, 1.0, dof)
                    .map_err(|err| StatsError::Distribution(err.to_string()))?;
                self.mean + self.std * t.inverse_cdf(p)
            }
        };
        Ok(value)
    }
}

/// Limits holding `confidence` of the probability mass of the requested
/// distribution.
pub fn interval(request: &Request) -> Result<Interval, StatsError> {
    let probability = request.probability()?;
    let dof = request.validated_dof()?;
    if request.distribution.needs_spread() && !(request.std > 0.0) {
        return Err(StatsError::StdDev(request.std));
    }

    let (lower, upper) = match request.limits {
        Limits::TwoSided => {
            let tail = (1.0 - probability) / 2.0;
            (
                Some(request.quantile(dof, tail)?),
                Some(request.quantile(dof, 1.0 - tail)?),
            )
        }
        Limits::Lower => (Some(request.quantile(dof, 1.0 - probability)?), None),
        Limits::Upper => (None, Some(request.quantile(dof, probability)?)),
    };

    Ok(Interval {
        distribution: request.distribution,
        limits: request.limits,
        confidence: probability,
        dof,
        lower,
        upper,
    })
}

/// Probability of a chi-square at least this large with `dof` degrees of
/// freedom.
pub fn chi_square_p_value(chi_square: f64, dof: usize) -> Option<f64> {
    if dof == 0 || !chi_square.is_finite() {
        return None;
    }
    ChiSquared::new(dof as f64)
        .ok()
        .map(|dist| dist.sf(chi_square.max(0.0)))
}

fn chi_squared(dof: f64) -> Result<ChiSquared, StatsError> {
    ChiSquared::new(dof).map_err(|err| StatsError::Distribution(err.to_string()))
}

impl Interval {
    pub fn render(&self) -> String {
        let side = match self.limits {
            Limits::TwoSided => "two-sided",
            Limits::Lower => "lower limit only",
            Limits::Upper => "upper limit only",
        };
        let mut heading = self.distribution.label().to_string();
        if let Some(dof) = self.dof {
            heading.push_str(&format!(" (dof = {})", significant(dof, 6)));
        }

        let mut lines = vec![format!(
            "{}, {}% confidence, {}",
            heading,
            significant(self.confidence * 100.0, 6),
            side
        )];
        let bound = |value: Option<f64>, open: &str| {
            value.map_or(open.to_string(), |v| significant(v, 8))
        };
        lines.push(format!("  lower = {}", bound(self.lower, "-inf")));
        lines.push(format!("  upper = {}", bound(self.upper, "inf")));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn request(distribution: Distribution, limits: Limits) -> Request {
        Request {
            distribution,
            limits,
            confidence: 0.95,
            dof: Some(1.0),
            mean: 0.0,
            std: 1.0,
        }
    }

    #[test]
    fn gaussian_two_sided_interval() {
        let out = interval(&request(Distribution::Gaussian, Limits::TwoSided)).unwrap();
        assert_relative_eq!(out.lower.unwrap(), -1.959964, epsilon = 1e-5);
        assert_relative_eq!(out.upper.unwrap(), 1.959964, epsilon = 1e-5);
        assert_eq!(out.dof, None);
    }

    #[test]
    fn gaussian_lower_limit_uses_mean_and_std() {
        let req = Request {
            mean: 10.0,
            std: 2.0,
            ..request(Distribution::Gaussian, Limits::Lower)
        };
        let out = interval(&req).unwrap();
        assert_relative_eq!(out.lower.unwrap(), 10.0 - 2.0 * 1.644854, epsilon = 1e-5);
        assert!(out.upper.is_none());
    }

    #[test]
    fn chi_square_limits() {
        let out = interval(&request(Distribution::ChiSquare, Limits::TwoSided)).unwrap();
        assert_relative_eq!(out.lower.unwrap(), 0.000982069, max_relative = 1e-3);
        assert_relative_eq!(out.upper.unwrap(), 5.023886, max_relative = 1e-4);

        let req = Request {
            dof: Some(2.0),
            ..request(Distribution::ReducedChiSquare, Limits::Upper)
        };
        let out = interval(&req).unwrap();
        assert!(out.lower.is_none());
        assert_relative_eq!(out.upper.unwrap(), 5.991465 / 2.0, max_relative = 1e-4);
    }

    #[test]
    fn student_interval_is_wider_than_gaussian() {
        let req = Request {
            dof: Some(10.0),
            confidence: 95.0,
            ..request(Distribution::Student, Limits::TwoSided)
        };
        let out = interval(&req).unwrap();
        assert_relative_eq!(out.confidence, 0.95);
        assert_relative_eq!(out.upper.unwrap(), 2.228139, max_relative = 1e-5);
        assert_relative_eq!(out.lower.unwrap(), -2.228139, max_relative = 1e-5);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let req = Request {
            std: 0.0,
            ..request(Distribution::Gaussian, Limits::TwoSided)
        };
        assert_eq!(interval(&req).unwrap_err(), StatsError::StdDev(0.0));

        let req = Request {
            dof: None,
            ..request(Distribution::ChiSquare, Limits::TwoSided)
        };
        assert_eq!(interval(&req).unwrap_err(), StatsError::DegreesOfFreedom(0.0));

        let req = Request {
            confidence: 100.0,
            ..request(Distribution::Gaussian, Limits::TwoSided)
        };
        assert_eq!(interval(&req).unwrap_err(), StatsError::Confidence(100.0));
    }

    #[test]
    fn p_value_of_the_critical_chi_square() {
        assert_relative_eq!(chi_square_p_value(3.841459, 1).unwrap(), 0.05, max_relative = 1e-5);
        assert_relative_eq!(chi_square_p_value(0.0, 3).unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(chi_square_p_value(1.0, 0), None);
    }

    #[test]
    fn rendered_interval_names_open_sides() {
        let out = interval(&request(Distribution::ChiSquare, Limits::Upper)).unwrap();
        let text = out.render();
        assert!(text.starts_with("Chi² (dof = 1), 95% confidence, upper limit only"));
        assert!(text.contains("lower = -inf"));
    }
}
