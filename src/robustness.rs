//! Leave-one-study-out and cumulative re-fits.
//!
//! Each iteration fits an independent network, so both loops run on the
//! rayon pool and results are keyed by study / prefix. An iteration that
//! cannot be fitted is recorded as `NotEstimable` and the loop goes on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::error::{NmaError, Result};
use crate::model::frequentist::{fit_consistency, FitOptions};
use crate::model::TreatmentEstimate;
use crate::network::EvidenceNetwork;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefitEstimate {
    /// Every non-reference treatment against the reference.
    pub effects: Vec<TreatmentEstimate>,
    pub tau2: f64,
    pub i2: Option<f64>,
    pub q: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefitOutcome {
    Estimated(RefitEstimate),
    NotEstimable { reason: String },
}

impl RefitOutcome {
    pub fn estimate(&self) -> Option<&RefitEstimate> {
        match self {
            RefitOutcome::Estimated(e) => Some(e),
            RefitOutcome::NotEstimable { .. } => None,
        }
    }

    pub fn is_estimable(&self) -> bool {
        self.estimate().is_some()
    }

    /// Effect of one treatment against the reference, if estimated.
    pub fn effect_of(&self, raw: &str) -> Option<f64> {
        let t = crate::network::Treatment::new(raw);
        self.estimate()?
            .effects
            .iter()
            .find(|e| e.treatment == t.as_str())
            .map(|e| e.estimate.estimate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaveOneOutRow {
    pub omitted_study: String,
    pub outcome: RefitOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeStep {
    /// 1-based number of studies included.
    pub step: usize,
    pub added_study: String,
    pub studies: Vec<String>,
    pub outcome: RefitOutcome,
}

/// Order in which studies enter a cumulative analysis.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CumulativeOrder {
    /// Order of first appearance in the network.
    #[default]
    FirstSeen,
    Alphabetical,
    /// Ascending by a per-study key (e.g. publication year); studies without a
    /// key go last. Ties are broken by study id.
    ByKey(BTreeMap<String, f64>),
}

impl CumulativeOrder {
    fn arrange(&self, studies: &[String]) -> Vec<String> {
        let mut out = studies.to_vec();
        match self {
            CumulativeOrder::FirstSeen => {}
            CumulativeOrder::Alphabetical => out.sort(),
            CumulativeOrder::ByKey(keys) => out.sort_by(|a, b| {
                let ka = keys.get(a).copied().unwrap_or(f64::INFINITY);
                let kb = keys.get(b).copied().unwrap_or(f64::INFINITY);
                ka.total_cmp(&kb).then_with(|| a.cmp(b))
            }),
        }
        out
    }
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    match cancel {
        Some(flag) if flag.load(AtomicOrdering::Relaxed) => Err(NmaError::Cancelled),
        _ => Ok(()),
    }
}

fn refit(
    network: &EvidenceNetwork,
    opts: &FitOptions,
    reference: &str,
    min_studies: usize,
) -> Result<RefitOutcome> {
    if network.num_studies() < min_studies {
        return Ok(RefitOutcome::NotEstimable {
            reason: format!("fewer than {min_studies} studies remain"),
        });
    }
    if network.resolve(reference).is_err() {
        return Ok(RefitOutcome::NotEstimable {
            reason: format!("reference '{reference}' is no longer in the network"),
        });
    }
    let opts = FitOptions {
        reference: Some(reference.to_string()),
        ..opts.clone()
    };
    match fit_consistency(network, &opts) {
        Ok(pooled) => Ok(RefitOutcome::Estimated(RefitEstimate {
            effects: pooled.effects_vs_reference(),
            tau2: pooled.heterogeneity.tau2,
            i2: pooled.heterogeneity.i2,
            q: pooled.heterogeneity.q,
        })),
        Err(err @ (NmaError::DisconnectedNetwork { .. }
        | NmaError::EmptyNetwork
        | NmaError::NonEstimable { .. }
        | NmaError::Numerical(_))) => Ok(RefitOutcome::NotEstimable {
            reason: err.to_string(),
        }),
        Err(err) => Err(err),
    }
}

fn resolved_reference(network: &EvidenceNetwork, opts: &FitOptions) -> Result<String> {
    match opts.reference.as_deref() {
        Some(raw) => Ok(network.resolve(raw)?.to_string()),
        None => network
            .treatments()
            .next()
            .map(|t| t.to_string())
            .ok_or(NmaError::EmptyNetwork),
    }
}

/// Refit once per study with that study removed.
pub fn leave_one_out(
    network: &EvidenceNetwork,
    opts: &FitOptions,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<LeaveOneOutRow>> {
    network.ensure_connected()?;
    let reference = resolved_reference(network, opts)?;

    network
        .studies()
        .par_iter()
        .map(|study| {
            check_cancel(cancel)?;
            let outcome = refit(&network.without_studies(&[study]), opts, &reference, 2)?;
            if let RefitOutcome::NotEstimable { reason } = &outcome {
                debug!(%study, %reason, "leave-one-out iteration not estimable");
            }
            Ok(LeaveOneOutRow {
                omitted_study: study.clone(),
                outcome,
            })
        })
        .collect()
}

/// Refit on growing prefixes of the ordered study list.
pub fn cumulative(
    network: &EvidenceNetwork,
    opts: &FitOptions,
    order: &CumulativeOrder,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<CumulativeStep>> {
    network.ensure_connected()?;
    let reference = resolved_reference(network, opts)?;
    let ordered = order.arrange(network.studies());

    (1..=ordered.len())
        .into_par_iter()
        .map(|step| {
            check_cancel(cancel)?;
            let prefix = &ordered[..step];
            let outcome = refit(&network.restricted_to_studies(prefix), opts, &reference, 1)?;
            Ok(CumulativeStep {
                step,
                added_study: prefix[step - 1].clone(),
                studies: prefix.to_vec(),
                outcome,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_key_puts_missing_last_and_breaks_ties_by_id() {
        let studies: Vec<String> = ["s3", "s1", "s2", "s4"].iter().map(|s| s.to_string()).collect();
        let keys = BTreeMap::from([
            ("s1".to_string(), 2001.0),
            ("s2".to_string(), 1999.0),
            ("s3".to_string(), 2001.0),
        ]);
        let order = CumulativeOrder::ByKey(keys).arrange(&studies);
        assert_eq!(order, vec!["s2", "s1", "s3", "s4"]);
    }
}
