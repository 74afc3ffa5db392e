//! End-to-end analysis: records → network → pooled fit → ranking → node-split → report.
//!
//! Every stage returns a new value; nothing is mutated after it is built.

use tracing::info;

use crate::config::AnalysisConfig;
use crate::contrast::{build_contrasts, ArmRecord};
use crate::error::{NmaError, Result};
use crate::model::{decompose_heterogeneity, fit_consistency, HeterogeneityDecomposition, PooledResult};
use crate::network::{EvidenceNetwork, StudyRecord};
use crate::nodesplit::{node_split, NodeSplitReport};
use crate::ranking::{p_scores, Ranking};
use crate::report::{build_report, AnalysisReport, ReportOptions};

/// Intermediate values of one frequentist run.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub network: EvidenceNetwork,
    pub pooled: PooledResult,
    pub ranking: Ranking,
    pub node_split: NodeSplitReport,
    pub decomposition: HeterogeneityDecomposition,
}

impl AnalysisRun {
    pub fn report(&self, cfg: &AnalysisConfig, opts: &ReportOptions) -> AnalysisReport {
        build_report(
            &self.network,
            &self.pooled,
            &self.ranking,
            Some(&self.node_split),
            Some(&self.decomposition),
            cfg.effect_measure,
            opts,
        )
    }
}

/// Fit, rank and split a network.
pub fn analyze(network: EvidenceNetwork, cfg: &AnalysisConfig) -> Result<AnalysisRun> {
    cfg.validate()?;
    network.ensure_connected()?;
    info!(
        studies = network.num_studies(),
        treatments = network.num_treatments(),
        comparisons = network.edges().len(),
        "starting analysis"
    );

    let fit_opts = cfg.fit_options();
    let pooled = fit_consistency(&network, &fit_opts)?;
    let ranking = p_scores(&pooled, cfg.rank_direction);
    let node_split = node_split(&network, &fit_opts)?;
    let decomposition = decompose_heterogeneity(&network)?;

    info!(
        q = pooled.heterogeneity.q,
        tau2 = pooled.heterogeneity.tau2,
        warnings = pooled.warnings.len(),
        "analysis finished"
    );
    Ok(AnalysisRun {
        network,
        pooled,
        ranking,
        node_split,
        decomposition,
    })
}

/// Analyse contrast-level records.
pub fn run_analysis(records: Vec<StudyRecord>, cfg: &AnalysisConfig) -> Result<AnalysisReport> {
    let network = EvidenceNetwork::from_records(records)?;
    Ok(analyze(network, cfg)?.report(cfg, &ReportOptions::default()))
}

/// Analyse arm-level records; the config must name an effect measure.
pub fn run_arm_analysis(arms: &[ArmRecord], cfg: &AnalysisConfig) -> Result<AnalysisReport> {
    let measure = cfg.effect_measure.ok_or_else(|| {
        NmaError::InvalidConfig("effect_measure is required for arm-level data".into())
    })?;
    let baseline = cfg.baseline.as_deref().or(cfg.reference.as_deref());
    let contrasts = build_contrasts(arms, measure, baseline)?;
    let network = EvidenceNetwork::from_contrasts(contrasts)?;
    Ok(analyze(network, cfg)?.report(cfg, &ReportOptions::default()))
}
