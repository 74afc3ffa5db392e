//! Report assembly for one analysis run.
//!
//! `AnalysisReport` is the hand-off value for presentation layers; the
//! summary text is what an external summarizer gets to read.

use serde::Serialize;

use crate::config::{ModelKind, TauEstimator};
use crate::contrast::EffectMeasure;
use crate::model::{HeterogeneityDecomposition, PooledResult, PosteriorSample, PosteriorSummary};
use crate::network::EvidenceNetwork;
use crate::nodesplit::{NodeSplitReport, SplitOutcome};
use crate::ranking::{RankEntry, Ranking};

#[derive(Debug, Clone, Serialize)]
pub struct ReportOptions {
    pub include_league_table: bool,
    pub include_residuals: bool,
    /// Keep only the best `top_n` ranked treatments (all when `None`).
    pub top_n: Option<usize>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            include_league_table: true,
            include_residuals: false,
            top_n: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub studies: usize,
    pub treatments: usize,
    pub comparisons: usize,
    pub reference: String,
    pub model_kind: ModelKind,
    pub tau_estimator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect_measure: Option<EffectMeasure>,
    pub q: f64,
    pub df: i64,
    pub p_value: Option<f64>,
    pub tau2: f64,
    pub i2: Option<f64>,
    pub degraded: bool,
    pub excluded_studies: Vec<String>,
}

/// One effect against the reference, on the display scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEffect {
    pub treatment: String,
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeagueCell {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

/// `cells[i][j]` is treatment i versus treatment j on the display scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeagueTable {
    pub treatments: Vec<String>,
    pub scale: String,
    pub cells: Vec<Vec<Option<LeagueCell>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BayesSection {
    pub effects: Vec<PosteriorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tau: Option<PosteriorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta: Option<PosteriorSummary>,
    pub converged: bool,
    pub chains: usize,
    pub draws_per_chain: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub network_fingerprint: String,
    pub summary: ReportSummary,
    pub effects: Vec<ReportEffect>,
    pub ranking: Vec<RankEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_split: Option<NodeSplitReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<HeterogeneityDecomposition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league_table: Option<LeagueTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residuals: Option<Vec<crate::model::EdgeResidual>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bayes: Option<BayesSection>,
    pub warnings: Vec<String>,
}

fn scale_label(measure: Option<EffectMeasure>) -> String {
    match measure {
        Some(m) if m.is_ratio() => format!("{} (exponentiated)", m.label()),
        Some(m) => m.label().to_string(),
        None => "additive".to_string(),
    }
}

fn display(measure: Option<EffectMeasure>, value: f64) -> f64 {
    measure.map_or(value, |m| m.display_scale(value))
}

/// All pairwise effects with confidence intervals.
pub fn league_table(pooled: &PooledResult, measure: Option<EffectMeasure>) -> LeagueTable {
    let n = pooled.treatments.len();
    let cells = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        return None;
                    }
                    let est = crate::model::Estimate::new(
                        pooled.effect_matrix[i][j],
                        pooled.se_matrix[i][j],
                        pooled.level,
                    );
                    Some(LeagueCell {
                        estimate: display(measure, est.estimate),
                        lower: display(measure, est.lower),
                        upper: display(measure, est.upper),
                    })
                })
                .collect()
        })
        .collect();
    LeagueTable {
        treatments: pooled.labels.clone(),
        scale: scale_label(measure),
        cells,
    }
}

pub fn build_report(
    network: &EvidenceNetwork,
    pooled: &PooledResult,
    ranking: &Ranking,
    node_split: Option<&NodeSplitReport>,
    decomposition: Option<&HeterogeneityDecomposition>,
    measure: Option<EffectMeasure>,
    opts: &ReportOptions,
) -> AnalysisReport {
    let h = &pooled.heterogeneity;
    let summary = ReportSummary {
        studies: pooled.k,
        treatments: pooled.treatments.len(),
        comparisons: pooled.n_edges,
        reference: pooled.labels[pooled.reference_index()].clone(),
        model_kind: pooled.model_kind,
        tau_estimator: tau_label(pooled.tau_estimator),
        effect_measure: measure,
        q: h.q,
        df: h.df,
        p_value: h.p_value,
        tau2: h.tau2,
        i2: h.i2,
        degraded: pooled.degraded,
        excluded_studies: pooled.excluded_studies.clone(),
    };

    let effects = pooled
        .effects_vs_reference()
        .into_iter()
        .map(|e| ReportEffect {
            treatment: e.label,
            estimate: display(measure, e.estimate.estimate),
            lower: display(measure, e.estimate.lower),
            upper: display(measure, e.estimate.upper),
            p_value: e.estimate.p_value,
        })
        .collect();

    let mut ranked = ranking.entries.clone();
    if let Some(n) = opts.top_n {
        ranked.truncate(n);
    }

    AnalysisReport {
        network_fingerprint: network.fingerprint(),
        summary,
        effects,
        ranking: ranked,
        node_split: node_split.cloned(),
        decomposition: decomposition.cloned(),
        league_table: opts
            .include_league_table
            .then(|| league_table(pooled, measure)),
        residuals: opts.include_residuals.then(|| pooled.residuals.clone()),
        bayes: None,
        warnings: pooled.warnings.iter().map(|w| w.to_string()).collect(),
    }
}

/// Attach a posterior fit to an existing report.
pub fn with_bayes(mut report: AnalysisReport, posterior: &PosteriorSample) -> AnalysisReport {
    report.warnings.extend(posterior.warnings.iter().map(|w| w.to_string()));
    report.bayes = Some(BayesSection {
        effects: posterior.summary(),
        tau: posterior.tau_summary(),
        beta: posterior.beta_summary(),
        converged: posterior.converged(),
        chains: posterior.chains,
        draws_per_chain: posterior.draws_per_chain,
    });
    report
}

fn tau_label(estimator: TauEstimator) -> String {
    match estimator {
        TauEstimator::Fixed(v) => format!("fixed ({v})"),
        other => other.label().to_string(),
    }
}

fn fmt_opt(value: Option<f64>, digits: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.digits$}"))
}

/// Plain-text (markdown) summary of the statistics in a report.
pub fn render_summary_text(report: &AnalysisReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    out.push_str("# Network Meta-Analysis Summary\n\n");
    out.push_str(&format!("- Network fingerprint: `{}`\n", report.network_fingerprint));
    out.push_str(&format!(
        "- Studies/treatments/comparisons: {}/{}/{}\n",
        s.studies, s.treatments, s.comparisons
    ));
    out.push_str(&format!("- Reference: {}\n", s.reference));
    let model = match s.model_kind {
        ModelKind::Fixed => "fixed effect".to_string(),
        ModelKind::Random => format!("random effects ({})", s.tau_estimator),
    };
    out.push_str(&format!("- Model: {model}\n"));
    if let Some(measure) = s.effect_measure {
        out.push_str(&format!("- Effect measure: {}\n", measure.label()));
    }
    out.push_str(&format!(
        "- Heterogeneity: Q = {:.3} (df {}, p = {}), tau² = {:.4}, I² = {}\n",
        s.q,
        s.df,
        fmt_opt(s.p_value, 4),
        s.tau2,
        s.i2.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
    ));
    if s.degraded {
        out.push_str("- Numerically degraded fit (ridge applied)\n");
    }
    if !s.excluded_studies.is_empty() {
        out.push_str(&format!("- Excluded studies: {}\n", s.excluded_studies.join(", ")));
    }

    out.push_str(&format!("\n## Effects vs {}\n\n", s.reference));
    for e in &report.effects {
        out.push_str(&format!(
            "- {}: {:.3} [{:.3}, {:.3}] (p = {:.4})\n",
            e.treatment, e.estimate, e.lower, e.upper, e.p_value
        ));
    }

    out.push_str("\n## Ranking\n\n");
    for entry in &report.ranking {
        out.push_str(&format!(
            "{}. {} (score {:.3})\n",
            entry.rank, entry.label, entry.score
        ));
    }

    if let Some(ns) = &report.node_split {
        out.push_str("\n## Node-splitting\n\n");
        for row in &ns.rows {
            match &row.outcome {
                SplitOutcome::Estimated(est) => out.push_str(&format!(
                    "- {} vs {}: direct {:.3}, indirect {:.3}, difference {:.3} (p = {:.4})\n",
                    row.label_b,
                    row.label_a,
                    est.direct.estimate,
                    est.indirect.estimate,
                    est.difference.estimate,
                    est.difference.p_value
                )),
                SplitOutcome::NotEstimable { reason } => out.push_str(&format!(
                    "- {} vs {}: not estimable ({})\n",
                    row.label_b, row.label_a, reason
                )),
            }
        }
    }

    if let Some(d) = &report.decomposition {
        out.push_str("\n## Q decomposition\n\n");
        out.push_str(&format!(
            "- Within designs: Q = {:.3} (df {}, p = {})\n",
            d.within_designs.q,
            d.within_designs.df,
            fmt_opt(d.within_designs.p_value, 4)
        ));
        out.push_str(&format!(
            "- Between designs: Q = {:.3} (df {}, p = {})\n",
            d.between_designs.q,
            d.between_designs.df,
            fmt_opt(d.between_designs.p_value, 4)
        ));
    }

    if let Some(b) = &report.bayes {
        out.push_str(&format!(
            "\n## Bayesian fit ({} chains x {} draws, converged: {})\n\n",
            b.chains, b.draws_per_chain, b.converged
        ));
        for e in b.effects.iter().chain(b.tau.iter()).chain(b.beta.iter()) {
            out.push_str(&format!(
                "- {}: mean {:.3}, 95% CrI [{:.3}, {:.3}]\n",
                e.parameter, e.mean, e.lower, e.upper
            ));
        }
    }

    if !report.warnings.is_empty() {
        out.push_str("\n## Warnings\n\n");
        for w in &report.warnings {
            out.push_str(&format!("- {w}\n"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_scale_is_labelled() {
        assert_eq!(
            scale_label(Some(EffectMeasure::LogOddsRatio)),
            "log odds ratio (exponentiated)"
        );
        assert_eq!(scale_label(None), "additive");
        assert!((display(Some(EffectMeasure::LogRiskRatio), 0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn missing_values_render_as_na() {
        assert_eq!(fmt_opt(None, 3), "n/a");
        assert_eq!(fmt_opt(Some(0.5), 2), "0.50");
    }
}
