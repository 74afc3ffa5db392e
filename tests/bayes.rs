use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nma_engine::{
    fit_bayes, fit_consistency, node_split_bayes, node_split_pair, sucra, AnalysisWarning,
    BayesOptions, ConvergenceWarning, Covariate, EvidenceNetwork, FitOptions, ModelKind, NmaError,
    RankDirection, SamplerObserver, SamplerProgress, StudyRecord,
};

fn rec(study: &str, a: &str, b: &str, effect: f64, se: f64) -> StudyRecord {
    StudyRecord::new(study, a, b, effect, se)
}

fn network() -> EvidenceNetwork {
    EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", -0.5, 0.1),
        rec("s2", "A", "B", -0.4, 0.12),
        rec("s3", "B", "C", 0.8, 0.15),
        rec("s4", "A", "C", 0.3, 0.15),
        rec("s5", "A", "C", 0.45, 0.2),
    ])
    .unwrap()
}

fn quick(model_kind: ModelKind) -> BayesOptions {
    BayesOptions {
        model_kind,
        chains: 2,
        warmup: 300,
        samples: 800,
        seed: 11,
        ..BayesOptions::default()
    }
}

#[test]
fn fixed_effect_posterior_matches_gls() {
    let net = network();
    let post = fit_bayes(&net, &quick(ModelKind::Fixed), None, None).unwrap();
    let gls = fit_consistency(&net, &FitOptions::fixed()).unwrap();

    assert_eq!(post.chains, 2);
    assert_eq!(post.draws_per_chain, 800);
    assert_eq!(post.num_draws(), 1600);
    assert!(post.converged(), "{:?}", post.diagnostics);
    assert!(post.tau_summary().is_none());
    assert!(post.between_study_variance.iter().all(|&v| v == 0.0));

    for (t, u) in [("B", "A"), ("C", "A"), ("C", "B")] {
        let bayes = post.relative_effect(t, u).unwrap();
        let freq = gls.relative_effect(t, u).unwrap();
        assert!((bayes.mean - freq.estimate).abs() < 0.03, "{t} vs {u}");
        assert!((bayes.sd - freq.se).abs() < 0.03, "{t} vs {u}");
        assert!(bayes.lower < bayes.median && bayes.median < bayes.upper);
    }
    for ess in post.diagnostics.effective_size.values() {
        assert!(*ess > 100.0);
    }
}

#[test]
fn random_effects_tau_respects_prior_bounds() {
    let opts = BayesOptions {
        tau_max: 2.0,
        ..quick(ModelKind::Random)
    };
    let post = fit_bayes(&network(), &opts, None, None).unwrap();
    assert!(post
        .between_study_variance
        .iter()
        .all(|&v| v > 0.0 && v < 4.0));
    assert!(post.diagnostics.r_hat.contains_key("tau"));
    let acceptance = post.diagnostics.tau_acceptance.unwrap();
    assert!(acceptance > 0.0 && acceptance < 1.0);
    let tau = post.tau_summary().unwrap();
    assert!(tau.lower >= 0.0 && tau.upper <= 2.0);
}

#[test]
fn short_chains_are_flagged_as_not_converged() {
    let opts = BayesOptions {
        warmup: 0,
        samples: 8,
        r_hat_threshold: 1.0000001,
        ..quick(ModelKind::Random)
    };
    let post = fit_bayes(&network(), &opts, None, None).unwrap();
    assert!(!post.converged());
    assert!(post.warnings.iter().any(|w| matches!(
        w,
        AnalysisWarning::Convergence(ConvergenceWarning::RHat { .. })
    )));
}

#[test]
fn same_seed_reproduces_draws() {
    let net = network();
    let opts = quick(ModelKind::Random);
    let a = fit_bayes(&net, &opts, None, None).unwrap();
    let b = fit_bayes(&net, &opts, None, None).unwrap();
    assert_eq!(a.treatment_effects, b.treatment_effects);
    assert_eq!(a.between_study_variance, b.between_study_variance);
}

#[test]
fn cancel_flag_stops_sampler() {
    let cancel = AtomicBool::new(true);
    let err = fit_bayes(&network(), &quick(ModelKind::Random), None, Some(&cancel)).unwrap_err();
    assert!(matches!(err, NmaError::Cancelled));
}

struct Counter(AtomicUsize);

impl SamplerObserver for Counter {
    fn on_progress(&self, progress: &SamplerProgress) {
        assert_eq!(progress.effects.len(), 3);
        assert!(progress.iteration <= progress.total_iterations);
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn observer_receives_periodic_progress() {
    let counter = Counter(AtomicUsize::new(0));
    let opts = BayesOptions {
        progress_every: 100,
        ..quick(ModelKind::Fixed)
    };
    fit_bayes(&network(), &opts, Some(&counter as &dyn SamplerObserver), None).unwrap();
    // (300 + 800) / 100 snapshots per chain, rounded down
    assert_eq!(counter.0.load(Ordering::Relaxed), 2 * 11);
}

#[test]
fn covariate_adds_beta_draws() {
    let values = BTreeMap::from([
        ("s1".to_string(), 1.0),
        ("s2".to_string(), 2.0),
        ("s3".to_string(), 1.5),
        ("s4".to_string(), 3.0),
        ("s5".to_string(), 2.5),
    ]);
    let opts = BayesOptions {
        covariate: Some(Covariate {
            name: "age".into(),
            values,
            center: true,
        }),
        ..quick(ModelKind::Fixed)
    };
    let post = fit_bayes(&network(), &opts, None, None).unwrap();
    assert_eq!(post.beta.as_ref().unwrap().len(), post.num_draws());
    let beta = post.beta_summary().unwrap();
    assert_eq!(beta.parameter, "beta[age]");
    assert!(beta.sd > 0.0);
    assert!(post.diagnostics.r_hat.contains_key("beta"));
}

#[test]
fn sucra_rank_probabilities_are_distributions() {
    let post = fit_bayes(&network(), &quick(ModelKind::Fixed), None, None).unwrap();
    let ranking = sucra(&post, RankDirection::SmallerIsBetter);
    let probs = ranking.rank_probabilities.as_ref().unwrap();
    for row in probs {
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
    // B is clearly below A and C
    assert_eq!(ranking.entries[0].label, "B");
    assert!(ranking.entries[0].score > 0.95);
    let n = ranking.treatments.len();
    for i in 0..n {
        for j in 0..n {
            let sum = ranking.win_probability[i][j] + ranking.win_probability[j][i];
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}

#[test]
fn bayesian_node_split_agrees_with_frequentist_direction() {
    let net = network();
    let freq = node_split_pair(&net, "B", "C", &FitOptions::fixed()).unwrap();
    let bayes = node_split_bayes(&net, "B", "C", &quick(ModelKind::Fixed), None).unwrap();
    assert!((bayes.direct.mean - freq.direct.estimate).abs() < 0.05);
    assert!((bayes.indirect.mean - freq.indirect.estimate).abs() < 0.05);
    assert!((bayes.difference.mean - freq.difference.estimate).abs() < 0.05);
    assert!((0.0..=1.0).contains(&bayes.p_value));
}
