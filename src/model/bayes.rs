//! Bayesian consistency model.
//!
//! Treatment effects `mu` (reference pinned to 0) carry `Normal(0, prior_sd²)`
//! priors; each edge observes `mu[b] - mu[a] + beta·z + delta + noise` with
//! `delta ~ Normal(0, tau²)` and `tau ~ Uniform(0, tau_max)`. The study
//! deviations are integrated out analytically, so one sweep of a chain is
//!
//! 1. `beta | mu, tau`  exact normal draw (only with a covariate),
//! 2. `tau | mu, beta`  random-walk Metropolis, step tuned during warm-up,
//! 3. `mu | beta, tau`  exact multivariate-normal draw.
//!
//! Chains run in parallel; iterations inside a chain are sequential.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Covariate, ModelKind};
use crate::error::{AnalysisWarning, ConvergenceWarning, NmaError, Result};
use crate::network::{EvidenceNetwork, Treatment};

use super::diagnostics::{effective_sample_size, quantile, split_r_hat};
use super::frequentist::{resolve_reference, GlsDesign, GlsSolution};

const TARGET_ACCEPTANCE: f64 = 0.44;
const ADAPT_BATCH: usize = 50;

#[derive(Debug, Clone)]
pub struct BayesOptions {
    pub reference: Option<String>,
    pub model_kind: ModelKind,
    /// Upper bound of the uniform prior on tau.
    pub tau_max: f64,
    pub covariate: Option<Covariate>,
    pub chains: usize,
    pub warmup: usize,
    pub samples: usize,
    pub thin: usize,
    pub prior_sd: f64,
    pub r_hat_threshold: f64,
    /// Report progress every this many iterations per chain (0 disables).
    pub progress_every: usize,
    pub seed: u64,
}

impl Default for BayesOptions {
    fn default() -> Self {
        Self {
            reference: None,
            model_kind: ModelKind::Random,
            tau_max: 5.0,
            covariate: None,
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

impl BayesOptions {
    fn validate(&self) -> Result<()> {
        if self.chains < 2 {
            return Err(NmaError::InvalidConfig(
                "at least 2 chains are required for R-hat".into(),
            ));
        }
        if self.thin == 0 || self.samples / self.thin < 4 {
            return Err(NmaError::InvalidConfig(
                "samples / thin must leave at least 4 draws per chain".into(),
            ));
        }
        if !(self.tau_max.is_finite() && self.tau_max > 0.0) {
            return Err(NmaError::InvalidConfig("tau_max must be positive".into()));
        }
        if !(self.prior_sd.is_finite() && self.prior_sd > 0.0) {
            return Err(NmaError::InvalidConfig("prior_sd must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
//  Progress reporting
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerPhase {
    Warmup,
    Sampling,
}

/// Snapshot of one chain's state.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerProgress {
    pub chain: usize,
    pub phase: SamplerPhase,
    /// 1-based iteration within the chain, warm-up included.
    pub iteration: usize,
    pub total_iterations: usize,
    pub tau: f64,
    pub beta: Option<f64>,
    /// Current effects of every treatment relative to the reference.
    pub effects: Vec<f64>,
}

/// Receives progress from running chains. Called from worker threads.
pub trait SamplerObserver: Sync {
    fn on_progress(&self, progress: &SamplerProgress);
}

// ---------------------------------------------------------------------
//  Output
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SamplerDiagnostics {
    pub r_hat: BTreeMap<String, f64>,
    pub effective_size: BTreeMap<String, f64>,
    pub converged: bool,
    /// Metropolis acceptance rate for tau after warm-up.
    pub tau_acceptance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosteriorSummary {
    pub parameter: String,
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    /// 2.5% quantile.
    pub lower: f64,
    /// 97.5% quantile.
    pub upper: f64,
}

impl PosteriorSummary {
    pub fn from_draws(parameter: impl Into<String>, draws: &[f64]) -> Self {
        let n = draws.len().max(1) as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let var = if draws.len() > 1 {
            draws.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        let mut sorted = draws.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            parameter: parameter.into(),
            mean,
            sd: var.sqrt(),
            median: quantile(&sorted, 0.5),
            lower: quantile(&sorted, 0.025),
            upper: quantile(&sorted, 0.975),
        }
    }
}

/// Retained posterior draws, stored chain-major.
#[derive(Debug, Clone, Serialize)]
pub struct PosteriorSample {
    pub treatments: Vec<String>,
    pub labels: Vec<String>,
    pub reference: String,
    pub model_kind: ModelKind,
    /// `treatment_effects[draw][treatment]`, relative to the reference.
    pub treatment_effects: Vec<Vec<f64>>,
    /// tau² per draw (all zero for a fixed-effect model).
    pub between_study_variance: Vec<f64>,
    pub covariate: Option<String>,
    pub beta: Option<Vec<f64>>,
    pub chains: usize,
    pub draws_per_chain: usize,
    pub diagnostics: SamplerDiagnostics,
    pub warnings: Vec<AnalysisWarning>,
}

impl PosteriorSample {
    pub fn index_of(&self, raw: &str) -> Option<usize> {
        let t = Treatment::new(raw);
        self.treatments.iter().position(|x| x == t.as_str())
    }

    fn require(&self, raw: &str) -> Result<usize> {
        self.index_of(raw)
            .ok_or_else(|| NmaError::UnknownTreatment(raw.to_string()))
    }

    pub fn num_draws(&self) -> usize {
        self.treatment_effects.len()
    }

    pub fn converged(&self) -> bool {
        self.diagnostics.converged
    }

    pub fn reference_index(&self) -> usize {
        self.treatments
            .iter()
            .position(|t| t == &self.reference)
            .unwrap_or(0)
    }

    /// Draws of `d_i - d_j`.
    pub fn relative_draws(&self, i: usize, j: usize) -> Vec<f64> {
        self.treatment_effects.iter().map(|d| d[i] - d[j]).collect()
    }

    /// Effects of every non-reference treatment relative to the reference.
    pub fn summary(&self) -> Vec<PosteriorSummary> {
        let r = self.reference_index();
        (0..self.treatments.len())
            .filter(|&i| i != r)
            .map(|i| PosteriorSummary::from_draws(&self.labels[i], &self.relative_draws(i, r)))
            .collect()
    }

    pub fn relative_effect(&self, treatment: &str, versus: &str) -> Result<PosteriorSummary> {
        let i = self.require(treatment)?;
        let j = self.require(versus)?;
        Ok(PosteriorSummary::from_draws(
            format!("{} vs {}", self.labels[i], self.labels[j]),
            &self.relative_draws(i, j),
        ))
    }

    /// Posterior of tau; `None` for a fixed-effect model.
    pub fn tau_summary(&self) -> Option<PosteriorSummary> {
        if self.model_kind == ModelKind::Fixed {
            return None;
        }
        let tau: Vec<f64> = self.between_study_variance.iter().map(|v| v.sqrt()).collect();
        Some(PosteriorSummary::from_draws("tau", &tau))
    }

    pub fn beta_summary(&self) -> Option<PosteriorSummary> {
        let beta = self.beta.as_ref()?;
        let name = self.covariate.as_deref().unwrap_or("beta");
        Some(PosteriorSummary::from_draws(format!("beta[{name}]"), beta))
    }
}

// ---------------------------------------------------------------------
//  Sampler
// ---------------------------------------------------------------------

fn sample_normal(rng: &mut impl Rng, mean: f64, std: f64) -> f64 {
    if std <= 0.0 {
        return mean;
    }
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen::<f64>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + z0 * std
}

struct Model<'a> {
    design: &'a GlsDesign,
    /// Covariate column `x_study * (row sum of X)`.
    z: Option<DVector<f64>>,
    opts: &'a BayesOptions,
    start: &'a GlsSolution,
}

#[derive(Default)]
struct ChainDraws {
    effects: Vec<Vec<f64>>,
    tau: Vec<f64>,
    beta: Vec<f64>,
    accepted: usize,
    proposed: usize,
}

/// Interaction column of a shared-slope meta-regression: one `beta` is shared by
/// every non-reference treatment against the reference, so an edge between two
/// non-reference treatments gets no covariate term. Studies without a value sit
/// at the centre (0 after centering).
fn covariate_column(
    network: &EvidenceNetwork,
    design: &GlsDesign,
    covariate: &Covariate,
) -> DVector<f64> {
    let present: Vec<f64> = network
        .studies()
        .iter()
        .filter_map(|s| covariate.values.get(s).copied())
        .collect();
    if present.is_empty() {
        warn!(covariate = %covariate.name, "no study has a covariate value; beta follows its prior");
    }
    let center = if covariate.center && !present.is_empty() {
        present.iter().sum::<f64>() / present.len() as f64
    } else {
        0.0
    };
    DVector::from_iterator(
        design.n_edges(),
        network.edges().iter().enumerate().map(|(k, e)| {
            let x = covariate
                .values
                .get(&e.study_id)
                .map_or(0.0, |v| v - center);
            x * design.x.row(k).sum()
        }),
    )
}

fn draw_effects(
    design: &GlsDesign,
    w: &DMatrix<f64>,
    y: &DVector<f64>,
    prior_precision: f64,
    rng: &mut StdRng,
) -> Result<DVector<f64>> {
    let p = design.n_free();
    let xtw = design.x.transpose() * w;
    let mut precision = &xtw * &design.x;
    for j in 0..p {
        precision[(j, j)] += prior_precision;
    }
    let rhs = &xtw * y;
    let chol = Cholesky::new(precision).ok_or_else(|| {
        NmaError::Numerical("posterior precision is not positive definite".into())
    })?;
    let mean = chol.solve(&rhs);
    let xi = DVector::from_fn(p, |_, _| sample_normal(&mut *rng, 0.0, 1.0));
    let noise = chol
        .l()
        .transpose()
        .solve_upper_triangular(&xi)
        .ok_or_else(|| NmaError::Numerical("singular posterior Cholesky factor".into()))?;
    Ok(mean + noise)
}

fn residuals(design: &GlsDesign, mu: &DVector<f64>, z: Option<&DVector<f64>>, beta: f64) -> DVector<f64> {
    let mut r = &design.y - &design.x * mu;
    if let Some(z) = z {
        r -= z.scale(beta);
    }
    r
}

fn run_chain(
    model: &Model<'_>,
    chain: usize,
    observer: Option<&dyn SamplerObserver>,
    cancel: Option<&AtomicBool>,
) -> Result<ChainDraws> {
    let opts = model.opts;
    let design = model.design;
    let z = model.z.as_ref();
    let random = opts.model_kind == ModelKind::Random;
    let mut rng = StdRng::seed_from_u64(opts.seed.wrapping_add(chain as u64));

    // Over-dispersed start around the fixed-effect solution.
    let mut mu = DVector::from_fn(design.n_free(), |j, _| {
        let sd = model.start.cov[(j, j)].max(0.0).sqrt();
        sample_normal(&mut rng, model.start.d[j], 2.0 * sd)
    });
    let mut beta = if z.is_some() {
        sample_normal(&mut rng, 0.0, 1.0)
    } else {
        0.0
    };
    let mut tau = if random {
        rng.gen::<f64>() * opts.tau_max.min(2.0)
    } else {
        0.0
    };
    let mut step = 0.2 * opts.tau_max.min(1.0);
    let mut w = design.weight_matrix(tau * tau)?;
    let prior_precision = 1.0 / (opts.prior_sd * opts.prior_sd);

    let total = opts.warmup + opts.samples;
    let mut draws = ChainDraws::default();
    let (mut batch_accepted, mut batch_len) = (0usize, 0usize);

    for iter in 0..total {
        if let Some(flag) = cancel {
            if flag.load(AtomicOrdering::Relaxed) {
                debug!(chain, iter, "sampler cancelled");
                return Err(NmaError::Cancelled);
            }
        }
        let warmup = iter < opts.warmup;

        if let Some(z) = z {
            let r = &design.y - &design.x * &mu;
            let wz = &w * z;
            let precision = z.dot(&wz) + prior_precision;
            beta = sample_normal(&mut rng, wz.dot(&r) / precision, precision.sqrt().recip());
        }

        if random {
            let r = residuals(design, &mu, z, beta);
            let proposal = tau + sample_normal(&mut rng, 0.0, step);
            let accepted = if proposal > 0.0 && proposal < opts.tau_max {
                let current = design.log_likelihood(&r, tau * tau)?;
                let proposed = design.log_likelihood(&r, proposal * proposal)?;
                rng.gen::<f64>().max(1e-300).ln() < proposed - current
            } else {
                false
            };
            if accepted {
                tau = proposal;
                w = design.weight_matrix(tau * tau)?;
            }
            if warmup {
                batch_len += 1;
                batch_accepted += usize::from(accepted);
                if batch_len == ADAPT_BATCH {
                    let rate = batch_accepted as f64 / batch_len as f64;
                    step = (step * (2.0 * (rate - TARGET_ACCEPTANCE)).exp())
                        .clamp(1e-4, opts.tau_max);
                    batch_len = 0;
                    batch_accepted = 0;
                }
            } else {
                draws.proposed += 1;
                draws.accepted += usize::from(accepted);
            }
        }

        let y = match z {
            Some(z) => &design.y - z.scale(beta),
            None => design.y.clone(),
        };
        mu = draw_effects(design, &w, &y, prior_precision, &mut rng)?;

        if !warmup && (iter - opts.warmup) % opts.thin == 0 {
            draws.effects.push(design.full_effects(&mu));
            draws.tau.push(tau);
            if z.is_some() {
                draws.beta.push(beta);
            }
        }

        if let Some(obs) = observer {
            if opts.progress_every > 0 && (iter + 1) % opts.progress_every == 0 {
                obs.on_progress(&SamplerProgress {
                    chain,
                    phase: if warmup {
                        SamplerPhase::Warmup
                    } else {
                        SamplerPhase::Sampling
                    },
                    iteration: iter + 1,
                    total_iterations: total,
                    tau,
                    beta: z.map(|_| beta),
                    effects: design.full_effects(&mu),
                });
            }
        }
    }
    Ok(draws)
}

/// Fit the Bayesian consistency model.
pub fn fit_bayes(
    network: &EvidenceNetwork,
    opts: &BayesOptions,
    observer: Option<&dyn SamplerObserver>,
    cancel: Option<&AtomicBool>,
) -> Result<PosteriorSample> {
    opts.validate()?;
    network.ensure_connected()?;
    let reference = resolve_reference(network, opts.reference.as_deref())?;
    let design = GlsDesign::build(network, &reference)?;
    let start = design.solve(&design.weight_matrix(0.0)?)?;
    let model = Model {
        design: &design,
        z: opts
            .covariate
            .as_ref()
            .map(|c| covariate_column(network, &design, c)),
        opts,
        start: &start,
    };

    let chains: Vec<ChainDraws> = (0..opts.chains)
        .into_par_iter()
        .map(|c| run_chain(&model, c, observer, cancel))
        .collect::<Result<Vec<_>>>()?;

    let draws_per_chain = chains.iter().map(|c| c.effects.len()).min().unwrap_or(0);
    let n = design.treatments.len();
    let random = opts.model_kind == ModelKind::Random;

    let mut r_hat = BTreeMap::new();
    let mut effective_size = BTreeMap::new();
    let mut check = |name: String, per_chain: Vec<Vec<f64>>| {
        r_hat.insert(name.clone(), split_r_hat(&per_chain));
        effective_size.insert(name, effective_sample_size(&per_chain));
    };
    for i in (0..n).filter(|&i| i != design.reference) {
        check(
            format!("d[{}]", design.labels[i]),
            chains
                .iter()
                .map(|c| c.effects[..draws_per_chain].iter().map(|d| d[i]).collect())
                .collect(),
        );
    }
    if random {
        check(
            "tau".to_string(),
            chains.iter().map(|c| c.tau[..draws_per_chain].to_vec()).collect(),
        );
    }
    if model.z.is_some() {
        check(
            "beta".to_string(),
            chains.iter().map(|c| c.beta[..draws_per_chain].to_vec()).collect(),
        );
    }

    let mut warnings = Vec::new();
    for (parameter, &value) in &r_hat {
        if !(value <= opts.r_hat_threshold) {
            warn!(%parameter, r_hat = value, "chains have not mixed");
            warnings.push(AnalysisWarning::Convergence(ConvergenceWarning::RHat {
                parameter: parameter.clone(),
                r_hat: value,
                threshold: opts.r_hat_threshold,
            }));
        }
    }

    let (accepted, proposed) = chains
        .iter()
        .fold((0, 0), |(a, p), c| (a + c.accepted, p + c.proposed));
    let diagnostics = SamplerDiagnostics {
        r_hat,
        effective_size,
        converged: warnings.is_empty(),
        tau_acceptance: (proposed > 0).then(|| accepted as f64 / proposed as f64),
    };

    let mut treatment_effects = Vec::with_capacity(opts.chains * draws_per_chain);
    let mut between_study_variance = Vec::with_capacity(opts.chains * draws_per_chain);
    let mut beta = Vec::new();
    for c in chains {
        treatment_effects.extend(c.effects.into_iter().take(draws_per_chain));
        between_study_variance.extend(c.tau.iter().take(draws_per_chain).map(|t| t * t));
        beta.extend(c.beta.into_iter().take(draws_per_chain));
    }

    info!(
        chains = opts.chains,
        draws_per_chain,
        converged = diagnostics.converged,
        "posterior sampling finished"
    );

    Ok(PosteriorSample {
        treatments: design.treatments.iter().map(|t| t.to_string()).collect(),
        labels: design.labels.clone(),
        reference: reference.to_string(),
        model_kind: opts.model_kind,
        treatment_effects,
        between_study_variance,
        covariate: opts.covariate.as_ref().map(|c| c.name.clone()),
        beta: model.z.is_some().then_some(beta),
        chains: opts.chains,
        draws_per_chain,
        diagnostics,
        warnings,
    })
}
