//! Consistency models.
//!
//! - `frequentist`: generalized least squares over the reduced incidence
//!   design, fixed or random effects.
//! - `heterogeneity`: tau² estimators and the design-by-treatment Q split.
//! - `bayes`: hierarchical model fit by Metropolis-within-Gibbs.
//! - `diagnostics`: R-hat and effective sample size.

use std::f64::consts::SQRT_2;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::erf::erf;

pub mod bayes;
pub mod diagnostics;
pub mod frequentist;
pub mod heterogeneity;

pub use bayes::{
    fit_bayes, BayesOptions, PosteriorSample, PosteriorSummary, SamplerDiagnostics,
    SamplerObserver, SamplerPhase, SamplerProgress,
};
pub use frequentist::{fit_consistency, EdgeResidual, FitOptions, Heterogeneity, PooledResult};
pub use heterogeneity::{decompose_heterogeneity, DesignQ, HeterogeneityDecomposition, QStatistic};

pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Two-sided critical value of the standard normal for a confidence level.
pub(crate) fn z_critical(level: f64) -> f64 {
    Normal::new(0.0, 1.0)
        .map(|n| n.inverse_cdf(0.5 + level / 2.0))
        .unwrap_or(1.959_963_984_540_054)
}

pub(crate) fn two_sided_p(z: f64) -> f64 {
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// Point estimate with a normal-approximation interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub estimate: f64,
    pub se: f64,
    pub lower: f64,
    pub upper: f64,
    pub z: f64,
    pub p_value: f64,
}

impl Estimate {
    pub fn new(estimate: f64, se: f64, level: f64) -> Self {
        let half = z_critical(level) * se;
        let z = if se > 0.0 { estimate / se } else { 0.0 };
        Self {
            estimate,
            se,
            lower: estimate - half,
            upper: estimate + half,
            z,
            p_value: two_sided_p(z),
        }
    }
}

/// Effect of one treatment relative to the reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentEstimate {
    pub treatment: String,
    pub label: String,
    #[serde(flatten)]
    pub estimate: Estimate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_value_matches_table() {
        assert!((z_critical(0.95) - 1.959_964).abs() < 1e-5);
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn estimate_interval_is_symmetric() {
        let e = Estimate::new(0.5, 0.1, 0.95);
        assert!((e.upper - e.estimate - (e.estimate - e.lower)).abs() < 1e-12);
        assert!(e.p_value < 1e-5);
    }
}
