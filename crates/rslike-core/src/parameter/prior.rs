use crate::errors::{RslikeError, RslikeResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Shape of a prior or reference distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "lowercase")]
pub enum Distribution {
    /// Constant density over the limits (improper if the limits are infinite).
    Flat,
    Uniform { low: f64, high: f64 },
    Normal { loc: f64, scale: f64 },
}

/// A one-dimensional prior: a distribution restricted to `limits`.
///
/// Normal priors with finite limits are truncated and renormalised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterPrior {
    pub dist: Distribution,
    pub limits: (f64, f64),
}

impl Default for ParameterPrior {
    fn default() -> Self {
        Self::flat()
    }
}

impl ParameterPrior {
    pub fn new(dist: Distribution, limits: (f64, f64)) -> RslikeResult<Self> {
        let prior = Self { dist, limits };
        prior.validate()?;
        Ok(prior)
    }

    /// Improper flat prior over the real line.
    pub fn flat() -> Self {
        Self {
            dist: Distribution::Flat,
            limits: (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn uniform(low: f64, high: f64) -> RslikeResult<Self> {
        Self::new(Distribution::Uniform { low, high }, (low, high))
    }

    pub fn normal(loc: f64, scale: f64) -> RslikeResult<Self> {
        Self::new(
            Distribution::Normal { loc, scale },
            (f64::NEG_INFINITY, f64::INFINITY),
        )
    }

    /// Restrict the prior to `limits`.
    pub fn with_limits(self, limits: (f64, f64)) -> RslikeResult<Self> {
        Self::new(self.dist, limits)
    }

    fn validate(&self) -> RslikeResult<()> {
        let (low, high) = self.limits;
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(RslikeError::Configuration(format!(
                "prior limits must satisfy low < high, got ({}, {})",
                low, high
            )));
        }
        match self.dist {
            Distribution::Flat => Ok(()),
            Distribution::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(RslikeError::Configuration(format!(
                        "uniform distribution requires finite low < high, got ({}, {})",
                        low, high
                    )));
                }
                Ok(())
            }
            Distribution::Normal { loc, scale } => {
                if !loc.is_finite() || !(scale > 0.0) || !scale.is_finite() {
                    return Err(RslikeError::Configuration(format!(
                        "normal distribution requires finite loc and scale > 0, got loc={}, scale={}",
                        loc, scale
                    )));
                }
                Ok(())
            }
        }
    }

    /// Effective lower and upper bounds, intersecting the distribution support with the limits.
    fn support(&self) -> (f64, f64) {
        let (low, high) = self.limits;
        match self.dist {
            Distribution::Uniform {
                low: ulow,
                high: uhigh,
            } => (low.max(ulow), high.min(uhigh)),
            _ => (low, high),
        }
    }

    pub fn is_limited(&self) -> bool {
        let (low, high) = self.limits;
        low.is_finite() || high.is_finite()
    }

    /// A proper prior can be normalised and sampled from.
    pub fn is_proper(&self) -> bool {
        match self.dist {
            Distribution::Flat => {
                let (low, high) = self.limits;
                low.is_finite() && high.is_finite()
            }
            _ => true,
        }
    }

    fn standard_normal() -> Normal {
        // Parameters are valid constants.
        Normal::new(0.0, 1.0).unwrap_or_else(|_| unreachable!())
    }

    /// Mass of a normal distribution enclosed in the limits.
    fn normal_mass(&self, loc: f64, scale: f64) -> (f64, f64) {
        let std_normal = Self::standard_normal();
        let (low, high) = self.limits;
        let a = std_normal.cdf((low - loc) / scale);
        let b = std_normal.cdf((high - loc) / scale);
        (a, b)
    }

    /// Log probability density at `x`; `-inf` outside the support.
    pub fn logpdf(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        let (low, high) = self.support();
        if x < low || x > high {
            return f64::NEG_INFINITY;
        }
        match self.dist {
            Distribution::Flat => {
                if self.is_proper() {
                    -(high - low).ln()
                } else {
                    0.0
                }
            }
            Distribution::Uniform { .. } => -(high - low).ln(),
            Distribution::Normal { loc, scale } => {
                let z = (x - loc) / scale;
                let mut logpdf = -0.5 * z * z - scale.ln() - LN_SQRT_2PI;
                if self.is_limited() {
                    let (a, b) = self.normal_mass(loc, scale);
                    logpdf -= (b - a).ln();
                }
                logpdf
            }
        }
    }

    /// Draw one value.
    ///
    /// Fails for improper priors.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> RslikeResult<f64> {
        match self.dist {
            Distribution::Flat | Distribution::Uniform { .. } => {
                if !self.is_proper() {
                    return Err(RslikeError::Configuration(
                        "cannot sample from an improper flat prior".to_string(),
                    ));
                }
                let (low, high) = self.support();
                Ok(rng.gen_range(low..high))
            }
            Distribution::Normal { loc, scale } => {
                // Inverse transform restricted to the limits
                let (a, b) = self.normal_mass(loc, scale);
                let u: f64 = a + (b - a) * rng.gen::<f64>();
                let z = Self::standard_normal().inverse_cdf(u.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON));
                let (low, high) = self.limits;
                Ok((loc + scale * z).clamp(low, high))
            }
        }
    }

    /// Central value: the location of a normal, the middle of a proper flat/uniform prior.
    pub fn center(&self) -> f64 {
        match self.dist {
            Distribution::Normal { loc, .. } => loc,
            _ => {
                let (low, high) = self.support();
                if low.is_finite() && high.is_finite() {
                    0.5 * (low + high)
                } else if low.is_finite() {
                    low
                } else if high.is_finite() {
                    high
                } else {
                    0.0
                }
            }
        }
    }

    /// Standard deviation, infinite for improper priors.
    ///
    /// Truncation is ignored for normal priors.
    pub fn std(&self) -> f64 {
        match self.dist {
            Distribution::Normal { scale, .. } => scale,
            _ => {
                if !self.is_proper() {
                    return f64::INFINITY;
                }
                let (low, high) = self.support();
                (high - low) / 12f64.sqrt()
            }
        }
    }

    /// Precision and mean of the Gaussian part of the prior.
    ///
    /// Flat and uniform priors carry no Gaussian information and return zero precision.
    pub fn gaussian_precision(&self) -> (f64, f64) {
        match self.dist {
            Distribution::Normal { loc, scale } => (1.0 / (scale * scale), loc),
            _ => (0.0, self.center()),
        }
    }

    /// Rescale the width of the prior around its center by `scale`.
    pub fn affine_transform(&self, scale: f64) -> RslikeResult<Self> {
        if !(scale > 0.0) {
            return Err(RslikeError::Configuration(format!(
                "affine transform scale must be positive, got {}",
                scale
            )));
        }
        let center = self.center();
        let transform = |x: f64| center + scale * (x - center);
        let dist = match self.dist {
            Distribution::Flat => Distribution::Flat,
            Distribution::Uniform { low, high } => Distribution::Uniform {
                low: transform(low),
                high: transform(high),
            },
            Distribution::Normal { loc, scale: sigma } => Distribution::Normal {
                loc,
                scale: sigma * scale,
            },
        };
        let (low, high) = self.limits;
        Self::new(dist, (transform(low), transform(high)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn uniform_logpdf() {
        let prior = ParameterPrior::uniform(0.0, 4.0).unwrap();
        assert_relative_eq!(prior.logpdf(1.0), -(4f64.ln()));
        assert_eq!(prior.logpdf(-1.0), f64::NEG_INFINITY);
        assert_eq!(prior.logpdf(5.0), f64::NEG_INFINITY);
        assert!(prior.is_proper());
    }

    #[test]
    fn flat_is_improper() {
        let prior = ParameterPrior::flat();
        assert!(!prior.is_proper());
        assert_eq!(prior.logpdf(1e10), 0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(prior.sample(&mut rng).is_err());
    }

    #[test]
    fn normal_logpdf() {
        let prior = ParameterPrior::normal(1.0, 2.0).unwrap();
        let expected = -0.5 * 0.25 - 2f64.ln() - LN_SQRT_2PI;
        assert_relative_eq!(prior.logpdf(2.0), expected, epsilon = 1e-12);
    }

    #[test]
    fn truncated_normal_is_normalised() {
        // Half normal: the density doubles
        let prior = ParameterPrior::normal(0.0, 1.0)
            .unwrap()
            .with_limits((0.0, f64::INFINITY))
            .unwrap();
        let expected = -LN_SQRT_2PI + 2f64.ln();
        assert_relative_eq!(prior.logpdf(0.0), expected, epsilon = 1e-9);
        assert_eq!(prior.logpdf(-0.1), f64::NEG_INFINITY);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..1000 {
            let x = prior.sample(&mut rng).unwrap();
            assert!(x >= 0.0);
        }
    }

    #[test]
    fn invalid_priors() {
        assert!(ParameterPrior::uniform(1.0, 0.0).is_err());
        assert!(ParameterPrior::normal(0.0, -1.0).is_err());
        assert!(ParameterPrior::new(Distribution::Flat, (1.0, 1.0)).is_err());
    }

    #[test]
    fn affine_transform_scales_width() {
        let prior = ParameterPrior::uniform(-1.0, 3.0).unwrap();
        let scaled = prior.affine_transform(0.5).unwrap();
        assert_eq!(scaled.center(), 1.0);
        assert_eq!(
            scaled.dist,
            Distribution::Uniform {
                low: 0.0,
                high: 2.0
            }
        );

        let normal = ParameterPrior::normal(2.0, 0.1).unwrap();
        assert_relative_eq!(normal.affine_transform(3.0).unwrap().std(), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn samples_stay_in_support() {
        let prior = ParameterPrior::uniform(2.0, 3.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..100 {
            let x = prior.sample(&mut rng).unwrap();
            assert!((2.0..3.0).contains(&x));
        }
    }

    #[test]
    fn deserialize_from_toml() {
        let prior: ParameterPrior = toml::from_str(
            r#"
            limits = [0.0, 1.0]
            [dist]
            dist = "normal"
            loc = 0.5
            scale = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(prior.dist, Distribution::Normal { loc: 0.5, scale: 0.1 });
    }
}
