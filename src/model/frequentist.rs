//! Frequentist consistency model.
//!
//! Each canonical edge observes the difference of two treatment effects.
//! With one treatment pinned to zero (the reference) the effects are the
//! solution of the generalized least-squares system
//!
//! ```text
//!   (Xᵀ W X) d = Xᵀ W y,    W = (V + tau² S)⁻¹
//! ```
//!
//! where `X` is the reduced incidence matrix, `V` the block-diagonal
//! within-study covariance and `S` the random-effects structure (1 on the
//! diagonal, ±1/2 between contrasts of one multi-arm study sharing an arm).

use std::collections::HashMap;

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, warn};

use crate::config::{ModelKind, TauEstimator};
use crate::error::{AnalysisWarning, NmaError, Result};
use crate::network::{EvidenceNetwork, Treatment};

use super::heterogeneity::estimate_tau2;
use super::{Estimate, TreatmentEstimate};

/// Ridge ladder tried when the normal matrix does not factorize.
const RIDGE_STEPS: usize = 4;
const RIDGE_START: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Reference treatment (raw name). Defaults to the first treatment in canonical order.
    pub reference: Option<String>,
    pub model_kind: ModelKind,
    pub tau_estimator: TauEstimator,
    /// Step budget for likelihood-based tau² iteration.
    pub max_iter: usize,
    pub tol: f64,
    /// Confidence level for reported intervals.
    pub level: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            reference: None,
            model_kind: ModelKind::Fixed,
            tau_estimator: TauEstimator::DerSimonianLaird,
            max_iter: 100,
            tol: 1e-10,
            level: 0.95,
        }
    }
}

impl FitOptions {
    pub fn fixed() -> Self {
        Self::default()
    }

    pub fn random(tau_estimator: TauEstimator) -> Self {
        Self {
            model_kind: ModelKind::Random,
            tau_estimator,
            ..Self::default()
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

// ---------------------------------------------------------------------
//  Design
// ---------------------------------------------------------------------

/// Regression design in reduced (reference-pinned) coordinates.
#[derive(Debug, Clone)]
pub(crate) struct GlsDesign {
    pub treatments: Vec<Treatment>,
    pub labels: Vec<String>,
    pub reference: usize,
    /// Column of each treatment in `x`; `None` for the reference.
    pub pos: Vec<Option<usize>>,
    /// Edge × free-treatment incidence.
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
    /// Within-study sampling covariance.
    pub v0: DMatrix<f64>,
    /// Random-effects structure.
    pub s: DMatrix<f64>,
    /// Row indices per study.
    pub blocks: Vec<Vec<usize>>,
}

fn build_pos_map(n: usize, reference: usize) -> Vec<Option<usize>> {
    let mut pos = vec![None; n];
    let mut p = 0;
    for (node, slot) in pos.iter_mut().enumerate() {
        if node != reference {
            *slot = Some(p);
            p += 1;
        }
    }
    pos
}

impl GlsDesign {
    pub fn build(network: &EvidenceNetwork, reference: &Treatment) -> Result<Self> {
        let treatments = network.treatment_list();
        let n = treatments.len();
        let index: HashMap<&Treatment, usize> =
            treatments.iter().enumerate().map(|(i, t)| (t, i)).collect();
        let reference_idx = *index
            .get(reference)
            .ok_or_else(|| NmaError::UnknownTreatment(reference.to_string()))?;
        let pos = build_pos_map(n, reference_idx);

        let edges = network.edges();
        let m = edges.len();
        let p = n.saturating_sub(1);

        let mut x = DMatrix::<f64>::zeros(m, p);
        let mut y = DVector::<f64>::zeros(m);
        let mut v0 = DMatrix::<f64>::zeros(m, m);
        let mut s = DMatrix::<f64>::zeros(m, m);

        let mut block_of: HashMap<&str, usize> = HashMap::new();
        let mut blocks: Vec<Vec<usize>> = Vec::new();

        for (k, e) in edges.iter().enumerate() {
            let ia = index[&e.treatment_a];
            let ib = index[&e.treatment_b];
            if let Some(pb) = pos[ib] {
                x[(k, pb)] += 1.0;
            }
            if let Some(pa) = pos[ia] {
                x[(k, pa)] -= 1.0;
            }
            y[k] = e.effect;
            v0[(k, k)] = e.variance();
            s[(k, k)] = 1.0;

            let b = *block_of.entry(e.study_id.as_str()).or_insert_with(|| {
                blocks.push(Vec::new());
                blocks.len() - 1
            });
            blocks[b].push(k);
        }

        // Contrasts of one study covary through the arms they share.
        for rows in &blocks {
            for (u, &r1) in rows.iter().enumerate() {
                for &r2 in &rows[u + 1..] {
                    let e1 = &edges[r1];
                    let e2 = &edges[r2];
                    let mut structural = 0.0;
                    let mut sampling = 0.0;
                    let mut sampling_known = true;
                    for t in [&e1.treatment_a, &e1.treatment_b] {
                        let sign = e1.sign_of(t) * e2.sign_of(t);
                        if sign == 0.0 {
                            continue;
                        }
                        structural += 0.5 * sign;
                        match network.arm_variance(&e1.study_id, t) {
                            Some(var) => sampling += sign * var,
                            None => sampling_known = false,
                        }
                    }
                    s[(r1, r2)] = structural;
                    s[(r2, r1)] = structural;
                    if sampling_known {
                        v0[(r1, r2)] = sampling;
                        v0[(r2, r1)] = sampling;
                    }
                }
            }
        }

        let labels = treatments
            .iter()
            .map(|t| network.label(t).to_string())
            .collect();

        Ok(Self {
            treatments,
            labels,
            reference: reference_idx,
            pos,
            x,
            y,
            v0,
            s,
            blocks,
        })
    }

    pub fn n_edges(&self) -> usize {
        self.y.len()
    }

    pub fn n_free(&self) -> usize {
        self.x.ncols()
    }

    /// Residual degrees of freedom: edges minus free treatment effects.
    pub fn df(&self) -> i64 {
        self.n_edges() as i64 - self.n_free() as i64
    }

    fn block_covariance(&self, rows: &[usize], tau2: f64) -> DMatrix<f64> {
        DMatrix::from_fn(rows.len(), rows.len(), |i, j| {
            self.v0[(rows[i], rows[j])] + tau2 * self.s[(rows[i], rows[j])]
        })
    }

    /// `W = (V + tau² S)⁻¹`, inverted block by block.
    pub fn weight_matrix(&self, tau2: f64) -> Result<DMatrix<f64>> {
        let m = self.n_edges();
        let mut w = DMatrix::<f64>::zeros(m, m);
        for rows in &self.blocks {
            let cov = self.block_covariance(rows, tau2);
            let chol = Cholesky::new(cov).ok_or_else(|| {
                NmaError::Numerical("within-study covariance is not positive definite".into())
            })?;
            let inv = chol.inverse();
            if !inv.iter().all(|v| v.is_finite()) {
                return Err(NmaError::Numerical(
                    "within-study weights are not finite (standard error too small?)".into(),
                ));
            }
            for (i, &ri) in rows.iter().enumerate() {
                for (j, &rj) in rows.iter().enumerate() {
                    w[(ri, rj)] = inv[(i, j)];
                }
            }
        }
        Ok(w)
    }

    /// Gaussian log-likelihood of residuals under `V + tau² S` (constant dropped).
    pub fn log_likelihood(&self, residuals: &DVector<f64>, tau2: f64) -> Result<f64> {
        let mut ll = 0.0;
        for rows in &self.blocks {
            let cov = self.block_covariance(rows, tau2);
            let chol = Cholesky::new(cov).ok_or_else(|| {
                NmaError::Numerical("within-study covariance is not positive definite".into())
            })?;
            let r = DVector::from_iterator(rows.len(), rows.iter().map(|&k| residuals[k]));
            let log_det: f64 = chol.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
            let quad = r.dot(&chol.solve(&r));
            ll -= 0.5 * (log_det + quad);
        }
        Ok(ll)
    }

    /// Solve the weighted normal equations.
    pub fn solve(&self, w: &DMatrix<f64>) -> Result<GlsSolution> {
        let p = self.n_free();
        let xtw = self.x.transpose() * w;
        let h = &xtw * &self.x;
        let g = &xtw * &self.y;

        if p == 0 {
            return Ok(GlsSolution {
                d: DVector::zeros(0),
                cov: DMatrix::zeros(0, 0),
                fitted: DVector::zeros(self.n_edges()),
                residuals: self.y.clone(),
                ridge: 0.0,
            });
        }

        let mut ridge_candidates = vec![0.0];
        let mut ridge = RIDGE_START;
        for _ in 0..RIDGE_STEPS {
            ridge_candidates.push(ridge);
            ridge *= 10.0;
        }

        for ridge in ridge_candidates {
            let mut h_r = h.clone();
            for i in 0..p {
                h_r[(i, i)] += ridge;
            }
            if let Some(chol) = Cholesky::new(h_r) {
                let d = chol.solve(&g);
                let cov = chol.inverse();
                if !d.iter().chain(cov.iter()).all(|v| v.is_finite()) {
                    return Err(NmaError::Numerical(
                        "normal equations produced non-finite effects".into(),
                    ));
                }
                let fitted = &self.x * &d;
                let residuals = &self.y - &fitted;
                return Ok(GlsSolution {
                    d,
                    cov,
                    fitted,
                    residuals,
                    ridge,
                });
            }
        }
        Err(NmaError::Numerical(
            "normal equations are singular; is the network connected?".into(),
        ))
    }

    /// Expand reduced effects to all treatments (reference = 0).
    pub fn full_effects(&self, d: &DVector<f64>) -> Vec<f64> {
        self.pos
            .iter()
            .map(|p| p.map_or(0.0, |c| d[c]))
            .collect()
    }

    /// Expand the reduced covariance to all treatments (reference row/column = 0).
    pub fn full_covariance(&self, cov: &DMatrix<f64>) -> DMatrix<f64> {
        let n = self.treatments.len();
        DMatrix::from_fn(n, n, |i, j| match (self.pos[i], self.pos[j]) {
            (Some(a), Some(b)) => cov[(a, b)],
            _ => 0.0,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GlsSolution {
    pub d: DVector<f64>,
    pub cov: DMatrix<f64>,
    pub fitted: DVector<f64>,
    pub residuals: DVector<f64>,
    pub ridge: f64,
}

impl GlsSolution {
    pub fn degraded(&self) -> bool {
        self.ridge > 0.0
    }
}

pub(crate) fn quad_form(r: &DVector<f64>, w: &DMatrix<f64>) -> f64 {
    r.dot(&(w * r))
}

// ---------------------------------------------------------------------
//  Result types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heterogeneity {
    pub q: f64,
    pub df: i64,
    /// Upper tail of chi-square(df); `None` when df <= 0.
    pub p_value: Option<f64>,
    /// Between-study variance; for fixed-effect fits the moment estimate, never a supplied value.
    pub tau2: f64,
    pub tau: f64,
    /// Percentage of variability beyond sampling error; `None` when undefined.
    pub i2: Option<f64>,
}

impl Heterogeneity {
    pub fn new(q: f64, df: i64, tau2: f64) -> Self {
        let p_value = chi_square_upper(q, df);
        let i2 = if df > 0 && q > 0.0 {
            Some(((q - df as f64) / q).max(0.0) * 100.0)
        } else {
            None
        };
        Self {
            q,
            df,
            p_value,
            tau2,
            tau: tau2.max(0.0).sqrt(),
            i2,
        }
    }
}

pub(crate) fn chi_square_upper(q: f64, df: i64) -> Option<f64> {
    if df <= 0 {
        return None;
    }
    ChiSquared::new(df as f64)
        .ok()
        .map(|chi| chi.sf(q.max(0.0)).clamp(0.0, 1.0))
}

/// Fit diagnostics for one edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeResidual {
    pub study_id: String,
    pub treatment_a: String,
    pub treatment_b: String,
    pub observed: f64,
    pub fitted: f64,
    pub residual: f64,
    pub standardized: f64,
}

/// Pooled consistency-model estimates. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct PooledResult {
    /// Normalized treatment identifiers, in canonical order.
    pub treatments: Vec<String>,
    pub labels: Vec<String>,
    pub reference: String,
    /// `effect_matrix[i][j] = d_i - d_j`.
    pub effect_matrix: Vec<Vec<f64>>,
    pub se_matrix: Vec<Vec<f64>>,
    /// Covariance of the effects relative to the reference.
    pub covariance: Vec<Vec<f64>>,
    pub model_kind: ModelKind,
    pub tau_estimator: TauEstimator,
    pub heterogeneity: Heterogeneity,
    /// Number of studies.
    pub k: usize,
    pub n_edges: usize,
    pub excluded_studies: Vec<String>,
    pub residuals: Vec<EdgeResidual>,
    pub warnings: Vec<AnalysisWarning>,
    pub degraded: bool,
    pub level: f64,
}

impl PooledResult {
    pub fn index_of(&self, raw: &str) -> Option<usize> {
        let t = Treatment::new(raw);
        self.treatments.iter().position(|x| x == t.as_str())
    }

    fn require(&self, raw: &str) -> Result<usize> {
        self.index_of(raw)
            .ok_or_else(|| NmaError::UnknownTreatment(raw.to_string()))
    }

    /// Effect of `treatment` relative to `versus` (`d_treatment - d_versus`).
    pub fn relative_effect(&self, treatment: &str, versus: &str) -> Result<Estimate> {
        let i = self.require(treatment)?;
        let j = self.require(versus)?;
        Ok(Estimate::new(
            self.effect_matrix[i][j],
            self.se_matrix[i][j],
            self.level,
        ))
    }

    pub fn reference_index(&self) -> usize {
        self.treatments
            .iter()
            .position(|t| t == &self.reference)
            .unwrap_or(0)
    }

    /// Every non-reference treatment against the reference.
    pub fn effects_vs_reference(&self) -> Vec<TreatmentEstimate> {
        let r = self.reference_index();
        (0..self.treatments.len())
            .filter(|&i| i != r)
            .map(|i| TreatmentEstimate {
                treatment: self.treatments[i].clone(),
                label: self.labels[i].clone(),
                estimate: Estimate::new(self.effect_matrix[i][r], self.se_matrix[i][r], self.level),
            })
            .collect()
    }

    pub fn converged(&self) -> bool {
        !self
            .warnings
            .iter()
            .any(|w| matches!(w, AnalysisWarning::Convergence(_)))
    }
}

// ---------------------------------------------------------------------
//  Fit
// ---------------------------------------------------------------------

pub(crate) fn resolve_reference(
    network: &EvidenceNetwork,
    reference: Option<&str>,
) -> Result<Treatment> {
    match reference {
        Some(raw) => network.resolve(raw),
        None => network.treatments().next().cloned().ok_or(NmaError::EmptyNetwork),
    }
}

/// Fit the consistency model to a connected network.
pub fn fit_consistency(network: &EvidenceNetwork, opts: &FitOptions) -> Result<PooledResult> {
    network.ensure_connected()?;
    let reference = resolve_reference(network, opts.reference.as_deref())?;
    let design = GlsDesign::build(network, &reference)?;
    let mut warnings = Vec::new();

    let w0 = design.weight_matrix(0.0)?;
    let fixed = design.solve(&w0)?;
    let q = quad_form(&fixed.residuals, &w0);
    let df = design.df();

    // A fixed-effect fit ignores a supplied tau², so report the moment estimate.
    let estimator = match (opts.model_kind, opts.tau_estimator) {
        (ModelKind::Fixed, TauEstimator::Fixed(_)) => TauEstimator::DerSimonianLaird,
        (_, estimator) => estimator,
    };
    let tau2 = match estimator {
        TauEstimator::Fixed(value) => value.max(0.0),
        _ if df <= 0 => {
            warn!(df, "no redundant evidence; between-study variance fixed to 0");
            warnings.push(AnalysisWarning::NoRedundantEvidence { df });
            0.0
        }
        estimator => estimate_tau2(&design, estimator, opts, q, df, &mut warnings)?,
    };

    let (solution, tau2_used) = match opts.model_kind {
        ModelKind::Fixed => (fixed, 0.0),
        ModelKind::Random => {
            let w = design.weight_matrix(tau2)?;
            (design.solve(&w)?, tau2)
        }
    };
    if solution.degraded() {
        warn!(ridge = solution.ridge, "normal equations required a ridge");
        warnings.push(AnalysisWarning::IllConditioned {
            ridge: solution.ridge,
        });
    }

    let effects = design.full_effects(&solution.d);
    let cov = design.full_covariance(&solution.cov);
    let n = effects.len();

    let mut effect_matrix = vec![vec![0.0; n]; n];
    let mut se_matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            effect_matrix[i][j] = effects[i] - effects[j];
            let var = cov[(i, i)] + cov[(j, j)] - 2.0 * cov[(i, j)];
            se_matrix[i][j] = if var.is_finite() {
                var.max(0.0).sqrt()
            } else {
                f64::NAN
            };
        }
    }

    let residuals = network
        .edges()
        .iter()
        .enumerate()
        .map(|(k, e)| {
            let var = design.v0[(k, k)] + tau2_used;
            let r = solution.residuals[k];
            EdgeResidual {
                study_id: e.study_id.clone(),
                treatment_a: e.treatment_a.to_string(),
                treatment_b: e.treatment_b.to_string(),
                observed: e.effect,
                fitted: solution.fitted[k],
                residual: r,
                standardized: r / var.sqrt(),
            }
        })
        .collect();

    let heterogeneity = Heterogeneity::new(q, df, tau2);
    debug!(
        k = network.num_studies(),
        edges = design.n_edges(),
        treatments = n,
        q = heterogeneity.q,
        df = heterogeneity.df,
        tau2 = heterogeneity.tau2,
        "fitted consistency model"
    );

    Ok(PooledResult {
        treatments: design.treatments.iter().map(|t| t.to_string()).collect(),
        labels: design.labels.clone(),
        reference: reference.to_string(),
        effect_matrix,
        se_matrix,
        covariance: (0..n)
            .map(|i| (0..n).map(|j| cov[(i, j)]).collect())
            .collect(),
        model_kind: opts.model_kind,
        tau_estimator: opts.tau_estimator,
        heterogeneity,
        k: network.num_studies(),
        n_edges: design.n_edges(),
        excluded_studies: network.excluded_studies().to_vec(),
        residuals,
        warnings,
        degraded: solution.degraded(),
        level: opts.level,
    })
}
