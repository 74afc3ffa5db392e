//! Analysis configuration.
//!
//! Every knob an analysis run needs is resolved here once, before any model
//! is fitted. Configs deserialize from TOML with per-field defaults, so a
//! minimal file only names what differs from `AnalysisConfig::default()`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contrast::EffectMeasure;
use crate::error::{NmaError, Result};
use crate::model::bayes::BayesOptions;
use crate::model::frequentist::FitOptions;
use crate::ranking::RankDirection;

/// Fixed- or random-effects pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Fixed,
    Random,
}

/// Estimator for the between-study variance tau².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TauEstimator {
    /// Closed-form moment estimator.
    #[default]
    DerSimonianLaird,
    /// Restricted maximum likelihood, iterated by Fisher scoring.
    Reml,
    /// Caller-supplied value.
    Fixed(f64),
}

impl TauEstimator {
    pub fn label(&self) -> &'static str {
        match self {
            TauEstimator::DerSimonianLaird => "DerSimonian-Laird",
            TauEstimator::Reml => "REML",
            TauEstimator::Fixed(_) => "fixed",
        }
    }
}

/// Study-level covariate for Bayesian meta-regression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Covariate {
    pub name: String,
    /// Value per study id; studies without a value are centred at 0.
    pub values: BTreeMap<String, f64>,
    /// Subtract the mean of the supplied values before fitting.
    #[serde(default = "default_true")]
    pub center: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    // -- Data ---------------------------------------------------------------

    /// Effect measure used by the contrast builder. Required for arm-level input.
    pub effect_measure: Option<EffectMeasure>,
    /// Reference treatment. Defaults to the first treatment in canonical order.
    pub reference: Option<String>,
    /// Preferred baseline arm when building contrasts (falls back to `reference`).
    pub baseline: Option<String>,

    // -- Frequentist model --------------------------------------------------

    pub model_kind: ModelKind,
    pub tau_estimator: TauEstimator,
    /// Step budget for likelihood-based tau² iteration.
    pub tau_max_iter: usize,
    /// Absolute tolerance on tau² between iterations.
    pub tau_tol: f64,
    /// Confidence level for intervals in league tables and reports.
    pub level: f64,

    // -- Bayesian model -----------------------------------------------------

    /// Upper bound of the Uniform(0, tau_max) prior on tau.
    pub tau_max: f64,
    pub covariate: Option<Covariate>,
    pub bayes: BayesSettings,

    // -- Ranking ------------------------------------------------------------

    pub rank_direction: RankDirection,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            effect_measure: None,
            reference: None,
            baseline: None,
            model_kind: ModelKind::Fixed,
            tau_estimator: TauEstimator::DerSimonianLaird,
            tau_max_iter: 100,
            tau_tol: 1e-10,
            level: 0.95,
            tau_max: 5.0,
            covariate: None,
            bayes: BayesSettings::default(),
            rank_direction: RankDirection::SmallerIsBetter,
        }
    }
}

/// Sampler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesSettings {
    /// Independent chains (at least 2 so R-hat is defined).
    pub chains: usize,
    /// Warm-up iterations discarded per chain.
    pub warmup: usize,
    /// Retained iterations per chain (before thinning).
    pub samples: usize,
    pub thin: usize,
    /// Standard deviation of the Normal(0, sd²) prior on treatment effects and beta.
    pub prior_sd: f64,
    /// R-hat above this flags the run as non-converged.
    pub r_hat_threshold: f64,
    /// Emit a progress snapshot every this many iterations (0 disables).
    pub progress_every: usize,
    pub seed: u64,
}

impl Default for BayesSettings {
    fn default() -> Self {
        Self {
            chains: 3,
            warmup: 1_000,
            samples: 2_000,
            thin: 1,
            prior_sd: 10.0,
            r_hat_threshold: 1.1,
            progress_every: 0,
            seed: 1337,
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: AnalysisConfig = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| NmaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.level > 0.0 && self.level < 1.0) {
            return Err(NmaError::InvalidConfig(format!(
                "level must be in (0, 1), got {}",
                self.level
            )));
        }
        if !(self.tau_max.is_finite() && self.tau_max > 0.0) {
            return Err(NmaError::InvalidConfig(format!(
                "tau_max must be positive, got {}",
                self.tau_max
            )));
        }
        if self.tau_max_iter == 0 {
            return Err(NmaError::InvalidConfig("tau_max_iter must be >= 1".into()));
        }
        if let TauEstimator::Fixed(v) = self.tau_estimator {
            if !(v.is_finite() && v >= 0.0) {
                return Err(NmaError::InvalidConfig(format!(
                    "fixed tau² must be >= 0, got {v}"
                )));
            }
        }
        let b = &self.bayes;
        if b.chains < 2 {
            return Err(NmaError::InvalidConfig(
                "bayes.chains must be >= 2 for convergence diagnostics".into(),
            ));
        }
        if b.samples < 4 || b.thin == 0 || b.samples / b.thin < 4 {
            return Err(NmaError::InvalidConfig(
                "bayes.samples / bayes.thin must leave at least 4 draws per chain".into(),
            ));
        }
        if !(b.prior_sd.is_finite() && b.prior_sd > 0.0) {
            return Err(NmaError::InvalidConfig("bayes.prior_sd must be positive".into()));
        }
        if b.r_hat_threshold <= 1.0 {
            return Err(NmaError::InvalidConfig(
                "bayes.r_hat_threshold must exceed 1".into(),
            ));
        }
        Ok(())
    }

    /// Options for the frequentist consistency model.
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            reference: self.reference.clone(),
            model_kind: self.model_kind,
            tau_estimator: self.tau_estimator,
            max_iter: self.tau_max_iter,
            tol: self.tau_tol,
            level: self.level,
        }
    }

    /// Options for the Bayesian consistency model.
    pub fn bayes_options(&self) -> BayesOptions {
        BayesOptions {
            reference: self.reference.clone(),
            model_kind: self.model_kind,
            tau_max: self.tau_max,
            covariate: self.covariate.clone(),
            chains: self.bayes.chains,
            warmup: self.bayes.warmup,
            samples: self.bayes.samples,
            thin: self.bayes.thin,
            prior_sd: self.bayes.prior_sd,
            r_hat_threshold: self.bayes.r_hat_threshold,
            progress_every: self.bayes.progress_every,
            seed: self.bayes.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_keeps_defaults() {
        let cfg = AnalysisConfig::from_toml_str("model_kind = \"random\"\n").unwrap();
        assert_eq!(cfg.model_kind, ModelKind::Random);
        assert_eq!(cfg.tau_estimator, TauEstimator::DerSimonianLaird);
        assert_eq!(cfg.bayes.chains, 3);
    }

    #[test]
    fn rejects_single_chain() {
        let err = AnalysisConfig::from_toml_str("[bayes]\nchains = 1\n").unwrap_err();
        assert!(matches!(err, NmaError::InvalidConfig(_)));
    }
}
