#![forbid(unsafe_code)]

//! # nma-engine
//!
//! Network meta-analysis: pool pairwise treatment comparisons from many
//! (possibly multi-arm) studies into one consistent set of relative effects.
//!
//! Each study comparison is an edge observing the difference of two
//! unobserved treatment effects. Pinning a reference treatment to zero turns
//! the network into a generalized least-squares problem (fixed or random
//! effects), or into a hierarchical model fit by MCMC. On top of a fit the
//! crate provides P-score / SUCRA ranking, node-splitting inconsistency
//! checks, and leave-one-out and cumulative re-fits.
//!
//! ```text
//! ArmRecord ──build_contrasts──▶ StudyRecord ──▶ EvidenceNetwork
//!                                                   │
//!                         fit_consistency / fit_bayes
//!                                                   ▼
//!                      PooledResult / PosteriorSample ──▶ ranking, node-split,
//!                                                         robustness, report
//! ```

pub mod config;
pub mod contrast;
pub mod error;
pub mod model;
pub mod network;
pub mod nodesplit;
pub mod pipeline;
pub mod ranking;
pub mod report;
pub mod robustness;

pub use config::{AnalysisConfig, BayesSettings, Covariate, ModelKind, TauEstimator};
pub use contrast::{build_contrasts, ArmOutcome, ArmRecord, ContrastSet, EffectMeasure};
pub use error::{AnalysisWarning, ConvergenceWarning, NmaError, Result};
pub use model::{
    decompose_heterogeneity, fit_bayes, fit_consistency, BayesOptions, Estimate, FitOptions,
    Heterogeneity, PooledResult, PosteriorSample, PosteriorSummary, SamplerObserver,
    SamplerProgress, TreatmentEstimate,
};
pub use network::{canonicalize, CanonicalEdge, EvidenceNetwork, StudyRecord, Treatment};
pub use nodesplit::{
    node_split, node_split_bayes, node_split_pair, NodeSplitEstimate, NodeSplitReport,
    SplitOutcome,
};
pub use pipeline::{analyze, run_analysis, run_arm_analysis, AnalysisRun};
pub use ranking::{p_scores, sucra, RankDirection, Ranking};
pub use report::{build_report, render_summary_text, with_bayes, AnalysisReport, ReportOptions};
pub use robustness::{
    cumulative, leave_one_out, CumulativeOrder, CumulativeStep, LeaveOneOutRow, RefitOutcome,
};
