//! Between-study variance estimators and the design-by-treatment split of Q.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::TauEstimator;
use crate::error::{AnalysisWarning, ConvergenceWarning, NmaError, Result};
use crate::network::{EvidenceNetwork, Treatment};

use super::frequentist::{
    chi_square_upper, quad_form, resolve_reference, FitOptions, GlsDesign,
};

/// `P = W - W X (Xᵀ W X)⁻¹ Xᵀ W`.
fn projection(design: &GlsDesign, w: &DMatrix<f64>, cov: &DMatrix<f64>) -> DMatrix<f64> {
    if design.n_free() == 0 {
        return w.clone();
    }
    let wx = w * &design.x;
    w - &wx * cov * wx.transpose()
}

fn trace_of_product(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    // tr(AB) without forming AB.
    let mut t = 0.0;
    for i in 0..a.nrows() {
        for k in 0..a.ncols() {
            t += a[(i, k)] * b[(k, i)];
        }
    }
    t
}

/// Moment estimator: `max(0, (Q - df) / tr(P₀ S))`.
pub(crate) fn dersimonian_laird(design: &GlsDesign, q: f64, df: i64) -> Result<f64> {
    let w0 = design.weight_matrix(0.0)?;
    let fit = design.solve(&w0)?;
    let p0 = projection(design, &w0, &fit.cov);
    let denom = trace_of_product(&p0, &design.s);
    if denom <= 0.0 {
        return Ok(0.0);
    }
    Ok(((q - df as f64) / denom).max(0.0))
}

/// Restricted maximum likelihood by Fisher scoring, started at the moment estimate.
pub(crate) fn reml(
    design: &GlsDesign,
    start: f64,
    max_iter: usize,
    tol: f64,
    warnings: &mut Vec<AnalysisWarning>,
) -> Result<f64> {
    let mut tau2 = start.max(0.0);
    let mut last_change = f64::INFINITY;

    for iteration in 1..=max_iter {
        let w = design.weight_matrix(tau2)?;
        let fit = design.solve(&w)?;
        let p = projection(design, &w, &fit.cov);
        let wr = &w * &fit.residuals;
        let ps = &p * &design.s;

        let score = -0.5 * ps.trace() + 0.5 * quad_form(&wr, &design.s);
        let info = 0.5 * trace_of_product(&ps, &ps);
        if !(info.is_finite() && info > 0.0) {
            return Err(NmaError::Numerical(
                "REML information is not positive".into(),
            ));
        }

        let next = (tau2 + score / info).max(0.0);
        last_change = (next - tau2).abs();
        tau2 = next;
        if last_change < tol {
            debug!(iteration, tau2, "REML converged");
            return Ok(tau2);
        }
    }

    warn!(max_iter, last_change, "REML tau² did not converge");
    warnings.push(AnalysisWarning::Convergence(ConvergenceWarning::TauIteration {
        estimator: TauEstimator::Reml.label().to_string(),
        iterations: max_iter,
        last_change,
    }));
    Ok(tau2)
}

pub(crate) fn estimate_tau2(
    design: &GlsDesign,
    estimator: TauEstimator,
    opts: &FitOptions,
    q: f64,
    df: i64,
    warnings: &mut Vec<AnalysisWarning>,
) -> Result<f64> {
    match estimator {
        TauEstimator::Fixed(v) => Ok(v.max(0.0)),
        TauEstimator::DerSimonianLaird => dersimonian_laird(design, q, df),
        TauEstimator::Reml => {
            let start = dersimonian_laird(design, q, df)?;
            reml(design, start, opts.max_iter, opts.tol, warnings)
        }
    }
}

// ---------------------------------------------------------------------
//  Design-by-treatment decomposition
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QStatistic {
    pub q: f64,
    pub df: i64,
    pub p_value: Option<f64>,
}

impl QStatistic {
    fn new(q: f64, df: i64) -> Self {
        Self {
            q,
            df,
            p_value: chi_square_upper(q, df),
        }
    }
}

/// Heterogeneity among studies sharing one design (set of compared treatments).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignQ {
    pub design: Vec<String>,
    pub studies: Vec<String>,
    #[serde(flatten)]
    pub stat: QStatistic,
}

/// Total Q split into within-design heterogeneity and between-design inconsistency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeterogeneityDecomposition {
    pub total: QStatistic,
    pub within_designs: QStatistic,
    pub between_designs: QStatistic,
    pub designs: Vec<DesignQ>,
}

fn fixed_q(network: &EvidenceNetwork, reference: &Treatment) -> Result<(f64, i64)> {
    let design = GlsDesign::build(network, reference)?;
    let w0 = design.weight_matrix(0.0)?;
    let fit = design.solve(&w0)?;
    Ok((quad_form(&fit.residuals, &w0), design.df()))
}

/// Split the fixed-effect Q statistic by design.
pub fn decompose_heterogeneity(network: &EvidenceNetwork) -> Result<HeterogeneityDecomposition> {
    network.ensure_connected()?;
    let reference = resolve_reference(network, None)?;
    let (q_total, df_total) = fixed_q(network, &reference)?;

    let mut by_design: BTreeMap<Vec<Treatment>, Vec<String>> = BTreeMap::new();
    for (study, design) in network.study_designs() {
        by_design.entry(design).or_default().push(study);
    }

    let mut designs = Vec::new();
    let (mut q_within, mut df_within) = (0.0, 0);
    for (design, studies) in by_design {
        let sub = network.restricted_to_studies(&studies);
        if !sub.is_connected() {
            debug!(?studies, "design does not span its treatments; skipped");
            continue;
        }
        let (q, df) = fixed_q(&sub, &design[0])?;
        q_within += q;
        df_within += df;
        designs.push(DesignQ {
            design: design.iter().map(|t| network.label(t).to_string()).collect(),
            studies,
            stat: QStatistic::new(q, df),
        });
    }

    let q_between = (q_total - q_within).max(0.0);
    let df_between = df_total - df_within;

    Ok(HeterogeneityDecomposition {
        total: QStatistic::new(q_total, df_total),
        within_designs: QStatistic::new(q_within, df_within),
        between_designs: QStatistic::new(q_between, df_between),
        designs,
    })
}
