//! Node-splitting inconsistency checks.
//!
//! For a pair with direct evidence, the direct estimate pools only that
//! pair's edges and the indirect estimate comes from the rest of the network.
//! Disagreement between the two is evidence of inconsistency.

use std::sync::atomic::AtomicBool;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::config::{ModelKind, TauEstimator};
use crate::error::{NmaError, Result};
use crate::model::bayes::{fit_bayes, BayesOptions, PosteriorSummary};
use crate::model::frequentist::{fit_consistency, FitOptions};
use crate::model::Estimate;
use crate::network::{EvidenceNetwork, Treatment};

/// Direct vs indirect evidence for one pair, as `d(b) - d(a)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSplitEstimate {
    pub direct: Estimate,
    pub indirect: Estimate,
    /// `direct - indirect` with its z-test.
    pub difference: Estimate,
    pub direct_studies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SplitOutcome {
    Estimated(NodeSplitEstimate),
    NotEstimable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSplitRow {
    pub treatment_a: String,
    pub treatment_b: String,
    pub label_a: String,
    pub label_b: String,
    pub outcome: SplitOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSplitReport {
    pub model_kind: ModelKind,
    /// Between-study variance shared by every split (0 for fixed effect).
    pub tau2: f64,
    pub rows: Vec<NodeSplitRow>,
}

impl NodeSplitReport {
    pub fn estimated(&self) -> impl Iterator<Item = (&NodeSplitRow, &NodeSplitEstimate)> {
        self.rows.iter().filter_map(|r| match &r.outcome {
            SplitOutcome::Estimated(est) => Some((r, est)),
            SplitOutcome::NotEstimable { .. } => None,
        })
    }
}

fn full_network_tau2(network: &EvidenceNetwork, opts: &FitOptions) -> Result<f64> {
    match opts.model_kind {
        ModelKind::Fixed => Ok(0.0),
        ModelKind::Random => Ok(fit_consistency(network, opts)?.heterogeneity.tau2),
    }
}

fn split_with_tau(
    network: &EvidenceNetwork,
    a: &Treatment,
    b: &Treatment,
    opts: &FitOptions,
    tau2: f64,
) -> Result<NodeSplitEstimate> {
    let what = format!("node split {} vs {}", network.label(a), network.label(b));
    let direct_studies = network.direct_edges(a, b).count();
    if direct_studies == 0 {
        return Err(NmaError::non_estimable(what, "no direct comparison"));
    }

    let indirect_net = network.without_pair(a, b);
    if !indirect_net.same_component(a, b) {
        return Err(NmaError::non_estimable(
            what,
            "no indirect path once the direct comparisons are removed",
        ));
    }

    let sub_opts = FitOptions {
        reference: Some(a.to_string()),
        tau_estimator: TauEstimator::Fixed(tau2),
        ..opts.clone()
    };
    let direct = fit_consistency(&network.only_pair(a, b), &sub_opts)?
        .relative_effect(b.as_str(), a.as_str())?;
    let indirect = fit_consistency(&indirect_net, &sub_opts)?
        .relative_effect(b.as_str(), a.as_str())?;

    let diff = direct.estimate - indirect.estimate;
    let se = (direct.se * direct.se + indirect.se * indirect.se).sqrt();
    Ok(NodeSplitEstimate {
        direct,
        indirect,
        difference: Estimate::new(diff, se, opts.level),
        direct_studies,
    })
}

/// Split one pair. Random-effects runs use the full-network tau² for both parts.
pub fn node_split_pair(
    network: &EvidenceNetwork,
    treatment_a: &str,
    treatment_b: &str,
    opts: &FitOptions,
) -> Result<NodeSplitEstimate> {
    let a = network.resolve(treatment_a)?;
    let b = network.resolve(treatment_b)?;
    network.ensure_connected()?;
    let tau2 = full_network_tau2(network, opts)?;
    split_with_tau(network, &a, &b, opts, tau2)
}

/// Split every pair with direct evidence.
pub fn node_split(network: &EvidenceNetwork, opts: &FitOptions) -> Result<NodeSplitReport> {
    network.ensure_connected()?;
    let tau2 = full_network_tau2(network, opts)?;
    let pairs = network.direct_pairs();

    let rows = pairs
        .par_iter()
        .map(|(a, b)| {
            let outcome = match split_with_tau(network, a, b, opts, tau2) {
                Ok(est) => SplitOutcome::Estimated(est),
                Err(NmaError::NonEstimable { reason, .. }) => {
                    debug!(a = %a, b = %b, %reason, "node split not estimable");
                    SplitOutcome::NotEstimable { reason }
                }
                Err(err) => return Err(err),
            };
            Ok(NodeSplitRow {
                treatment_a: a.to_string(),
                treatment_b: b.to_string(),
                label_a: network.label(a).to_string(),
                label_b: network.label(b).to_string(),
                outcome,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NodeSplitReport {
        model_kind: opts.model_kind,
        tau2,
        rows,
    })
}

// ---------------------------------------------------------------------
//  Bayesian variant
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BayesNodeSplit {
    pub treatment_a: String,
    pub treatment_b: String,
    pub direct: PosteriorSummary,
    pub indirect: PosteriorSummary,
    pub difference: PosteriorSummary,
    /// `2 * min(P(diff > 0), P(diff < 0))`.
    pub p_value: f64,
    pub converged: bool,
}

/// Split one pair with two independent posterior fits.
pub fn node_split_bayes(
    network: &EvidenceNetwork,
    treatment_a: &str,
    treatment_b: &str,
    opts: &BayesOptions,
    cancel: Option<&AtomicBool>,
) -> Result<BayesNodeSplit> {
    let a = network.resolve(treatment_a)?;
    let b = network.resolve(treatment_b)?;
    let what = format!("node split {} vs {}", network.label(&a), network.label(&b));
    if network.direct_edges(&a, &b).next().is_none() {
        return Err(NmaError::non_estimable(what, "no direct comparison"));
    }
    let indirect_net = network.without_pair(&a, &b);
    if !indirect_net.same_component(&a, &b) {
        return Err(NmaError::non_estimable(
            what,
            "no indirect path once the direct comparisons are removed",
        ));
    }

    let sub_opts = BayesOptions {
        reference: Some(a.to_string()),
        ..opts.clone()
    };
    let direct = fit_bayes(&network.only_pair(&a, &b), &sub_opts, None, cancel)?;
    let indirect = fit_bayes(&indirect_net, &sub_opts, None, cancel)?;

    let pick = |post: &crate::model::PosteriorSample| -> Result<Vec<f64>> {
        let i = post
            .index_of(b.as_str())
            .ok_or_else(|| NmaError::UnknownTreatment(b.to_string()))?;
        let j = post
            .index_of(a.as_str())
            .ok_or_else(|| NmaError::UnknownTreatment(a.to_string()))?;
        Ok(post.relative_draws(i, j))
    };
    let direct_draws = pick(&direct)?;
    let indirect_draws = pick(&indirect)?;
    let diff: Vec<f64> = direct_draws
        .iter()
        .zip(&indirect_draws)
        .map(|(d, i)| d - i)
        .collect();

    let n = diff.len().max(1) as f64;
    let above = diff.iter().filter(|&&x| x > 0.0).count() as f64 / n;
    let below = diff.iter().filter(|&&x| x < 0.0).count() as f64 / n;

    Ok(BayesNodeSplit {
        treatment_a: a.to_string(),
        treatment_b: b.to_string(),
        direct: PosteriorSummary::from_draws("direct", &direct_draws),
        indirect: PosteriorSummary::from_draws("indirect", &indirect_draws),
        difference: PosteriorSummary::from_draws("direct - indirect", &diff),
        p_value: (2.0 * above.min(below)).min(1.0),
        converged: direct.converged() && indirect.converged(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StudyRecord;

    #[test]
    fn consistent_triangle_has_zero_difference() {
        let net = EvidenceNetwork::from_records(vec![
            StudyRecord::new("s1", "A", "B", 1.0, 0.2),
            StudyRecord::new("s2", "B", "C", 0.5, 0.2),
            StudyRecord::new("s3", "A", "C", 1.5, 0.2),
        ])
        .unwrap();
        let est = node_split_pair(&net, "A", "C", &FitOptions::default()).unwrap();
        assert!(est.difference.estimate.abs() < 1e-9);
        assert!((est.difference.p_value - 1.0).abs() < 1e-9);
    }
}
