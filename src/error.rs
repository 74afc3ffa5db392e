//! Error and warning types for the synthesis engine.
//!
//! Structural problems with the whole network abort a run (`NmaError`).
//! Convergence problems never abort: they are attached to the result as
//! `AnalysisWarning`s so callers can decide whether to trust the output.

use serde::Serialize;
use thiserror::Error;

/// Errors that abort an analysis step.
#[derive(Debug, Error)]
pub enum NmaError {
    /// Self-comparison, non-positive variance or a non-finite effect.
    #[error("degenerate comparison in study '{study_id}': {reason}")]
    DegenerateEdge { study_id: String, reason: String },

    /// A study needs at least two arms (or one contrast) to contribute evidence.
    #[error("study '{study_id}' has {arms} arm(s); at least 2 are required")]
    InsufficientArms { study_id: String, arms: usize },

    /// Arm-level summary statistics that cannot produce a contrast.
    #[error("invalid arm '{treatment}' in study '{study_id}': {reason}")]
    InvalidArm {
        study_id: String,
        treatment: String,
        reason: String,
    },

    /// Pooling requested on a network with more than one component.
    #[error("network is disconnected into {} components: {}", .components.len(), format_components(.components))]
    DisconnectedNetwork { components: Vec<Vec<String>> },

    #[error("network has no comparisons")]
    EmptyNetwork,

    /// Removing evidence (node-split, leave-one-out) left nothing to estimate from.
    #[error("{what} is not estimable: {reason}")]
    NonEstimable { what: String, reason: String },

    #[error("unknown treatment '{0}'")]
    UnknownTreatment(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("analysis cancelled")]
    Cancelled,
}

fn format_components(components: &[Vec<String>]) -> String {
    components
        .iter()
        .map(|c| format!("{{{}}}", c.join(", ")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl NmaError {
    pub(crate) fn degenerate(study_id: &str, reason: impl Into<String>) -> Self {
        NmaError::DegenerateEdge {
            study_id: study_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn non_estimable(what: impl Into<String>, reason: impl Into<String>) -> Self {
        NmaError::NonEstimable {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// Convergence problems of iterative estimators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ConvergenceWarning {
    /// Likelihood-based tau² iteration hit its step budget.
    TauIteration {
        estimator: String,
        iterations: usize,
        last_change: f64,
    },
    /// Potential scale reduction above the accepted threshold.
    RHat {
        parameter: String,
        r_hat: f64,
        threshold: f64,
    },
}

/// Non-fatal conditions attached to a fitted result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisWarning {
    /// No redundant evidence (df <= 0); tau² was fixed to zero.
    NoRedundantEvidence { df: i64 },
    /// Normal equations needed a ridge to factorize.
    IllConditioned { ridge: f64 },
    Convergence(ConvergenceWarning),
}

impl std::fmt::Display for AnalysisWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisWarning::NoRedundantEvidence { df } => write!(
                f,
                "no redundant evidence (df = {df}); between-study variance fixed to 0"
            ),
            AnalysisWarning::IllConditioned { ridge } => {
                write!(f, "ill-conditioned normal equations (ridge {ridge:e} applied)")
            }
            AnalysisWarning::Convergence(ConvergenceWarning::TauIteration {
                estimator,
                iterations,
                last_change,
            }) => write!(
                f,
                "{estimator} tau² did not converge in {iterations} iterations (last change {last_change:e})"
            ),
            AnalysisWarning::Convergence(ConvergenceWarning::RHat {
                parameter,
                r_hat,
                threshold,
            }) => write!(
                f,
                "R-hat for {parameter} is {r_hat:.3} (> {threshold}); chains have not converged"
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, NmaError>;
