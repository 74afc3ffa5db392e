use nma_engine::{
    build_contrasts, fit_consistency, leave_one_out, AnalysisWarning, ArmRecord, ConvergenceWarning,
    EffectMeasure, EvidenceNetwork, FitOptions, ModelKind, NmaError, RefitOutcome, StudyRecord,
    TauEstimator,
};

fn rec(study: &str, a: &str, b: &str, effect: f64, se: f64) -> StudyRecord {
    StudyRecord::new(study, a, b, effect, se)
}

fn close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

#[test]
fn spanning_tree_estimates_are_path_sums() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.5, 0.2),
        rec("s2", "B", "C", 0.3, 0.25),
        rec("s3", "B", "D", -0.2, 0.3),
    ])
    .unwrap();
    let pooled = fit_consistency(&net, &FitOptions::random(TauEstimator::DerSimonianLaird)).unwrap();

    assert_eq!(pooled.heterogeneity.df, 0);
    assert_eq!(pooled.heterogeneity.tau2, 0.0);
    assert!(pooled.heterogeneity.i2.is_none());
    assert!(pooled
        .warnings
        .contains(&AnalysisWarning::NoRedundantEvidence { df: 0 }));

    let d = |t: &str, u: &str| pooled.relative_effect(t, u).unwrap().estimate;
    assert!(close(d("B", "A"), 0.5, 1e-9));
    assert!(close(d("C", "A"), 0.8, 1e-9));
    assert!(close(d("D", "A"), 0.3, 1e-9));
    assert!(close(d("C", "D"), 0.5, 1e-9));
    assert!(close(d("A", "C"), -0.8, 1e-9));

    // se along the path adds variances
    let se = pooled.relative_effect("C", "A").unwrap().se;
    assert!(close(se, (0.2f64.powi(2) + 0.25f64.powi(2)).sqrt(), 1e-9));
}

#[test]
fn three_study_scenario_matches_inverse_variance_mean() {
    let net = EvidenceNetwork::from_records(vec![
        rec("Study1", "A", "B", 0.70, 0.20),
        rec("Study2", "A", "B", 0.30, 0.25),
        rec("Study2", "A", "C", 0.10, 0.30),
        rec("Study3", "A", "B", 1.00, 0.30),
    ])
    .unwrap();
    let pooled = fit_consistency(&net, &FitOptions::fixed().with_reference("A")).unwrap();

    let weights = [1.0 / 0.04, 1.0 / 0.0625, 1.0 / 0.09];
    let effects = [0.70, 0.30, 1.00];
    let expected: f64 =
        weights.iter().zip(effects).map(|(w, y)| w * y).sum::<f64>() / weights.iter().sum::<f64>();

    let b = pooled.relative_effect("B", "A").unwrap();
    assert!(close(b.estimate, expected, 1e-9));
    assert!(close(b.estimate, 0.6411, 1e-3));
    assert_eq!(pooled.k, 3);
    // 4 edges, 2 free effects
    assert_eq!(pooled.heterogeneity.df, 2);
    assert!(pooled.heterogeneity.q.is_finite());
    assert!(pooled.heterogeneity.q > 0.0);
    assert_eq!(pooled.reference, "a");
    assert_eq!(pooled.residuals.len(), 4);
}

#[test]
fn single_study_network_has_no_heterogeneity() {
    let net = EvidenceNetwork::from_records(vec![rec("s1", "A", "B", 0.4, 0.2)]).unwrap();
    let opts = FitOptions::random(TauEstimator::DerSimonianLaird);
    let pooled = fit_consistency(&net, &opts).unwrap();

    assert_eq!(pooled.heterogeneity.tau2, 0.0);
    assert!(pooled.heterogeneity.i2.is_none());
    assert!(pooled.heterogeneity.p_value.is_none());
    assert!(close(pooled.relative_effect("B", "A").unwrap().estimate, 0.4, 1e-12));

    let loo = leave_one_out(&net, &opts, None).unwrap();
    assert_eq!(loo.len(), 1);
    assert!(matches!(loo[0].outcome, RefitOutcome::NotEstimable { .. }));
}

#[test]
fn homogeneous_effects_collapse_random_to_fixed() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.5, 0.1),
        rec("s2", "A", "B", 0.5, 0.2),
        rec("s3", "A", "B", 0.5, 0.3),
    ])
    .unwrap();
    let fixed = fit_consistency(&net, &FitOptions::fixed()).unwrap();
    for estimator in [TauEstimator::DerSimonianLaird, TauEstimator::Reml] {
        let random = fit_consistency(&net, &FitOptions::random(estimator)).unwrap();
        assert_eq!(random.heterogeneity.tau2, 0.0);
        let f = fixed.relative_effect("B", "A").unwrap();
        let r = random.relative_effect("B", "A").unwrap();
        assert!(close(f.estimate, r.estimate, 1e-12));
        assert!(close(f.se, r.se, 1e-12));
    }
}

#[test]
fn balanced_heterogeneous_studies_match_closed_forms() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.1, 0.1),
        rec("s2", "A", "B", 0.9, 0.1),
        rec("s3", "A", "B", 0.2, 0.1),
        rec("s4", "A", "B", 1.1, 0.1),
    ])
    .unwrap();
    // sample variance 0.7475 / 3 minus within-study variance 0.01
    let expected = 0.7475 / 3.0 - 0.01;

    let dl = fit_consistency(&net, &FitOptions::random(TauEstimator::DerSimonianLaird)).unwrap();
    assert!(close(dl.heterogeneity.q, 74.75, 1e-9));
    assert!(close(dl.heterogeneity.tau2, expected, 1e-9));
    assert!(close(dl.heterogeneity.i2.unwrap(), (74.75 - 3.0) / 74.75 * 100.0, 1e-9));

    let reml = fit_consistency(&net, &FitOptions::random(TauEstimator::Reml)).unwrap();
    assert!(close(reml.heterogeneity.tau2, expected, 1e-6));
    assert!(reml.converged());

    // random-effects widens the interval
    let f = fit_consistency(&net, &FitOptions::fixed()).unwrap();
    assert!(dl.relative_effect("B", "A").unwrap().se > f.relative_effect("B", "A").unwrap().se);
}

#[test]
fn tau_iteration_budget_exhaustion_is_a_warning() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.1, 0.1),
        rec("s2", "A", "B", 0.9, 0.2),
        rec("s3", "A", "B", 0.2, 0.15),
        rec("s4", "A", "B", 1.1, 0.3),
    ])
    .unwrap();
    let opts = FitOptions {
        max_iter: 1,
        tol: 0.0,
        ..FitOptions::random(TauEstimator::Reml)
    };
    let pooled = fit_consistency(&net, &opts).unwrap();
    assert!(pooled.heterogeneity.tau2 >= 0.0);
    assert!(!pooled.converged());
    assert!(pooled.warnings.iter().any(|w| matches!(
        w,
        AnalysisWarning::Convergence(ConvergenceWarning::TauIteration { iterations: 1, .. })
    )));
}

#[test]
fn fixed_tau_is_used_as_given() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.1, 0.1),
        rec("s2", "A", "B", 0.9, 0.1),
    ])
    .unwrap();
    let pooled = fit_consistency(&net, &FitOptions::random(TauEstimator::Fixed(0.04))).unwrap();
    assert_eq!(pooled.heterogeneity.tau2, 0.04);
    let b = pooled.relative_effect("B", "A").unwrap();
    assert!(close(b.se, ((0.01 + 0.04) / 2.0f64).sqrt(), 1e-12));
    assert_eq!(pooled.model_kind, ModelKind::Random);

    // A fixed-effect fit does not use the supplied value; it reports the moment estimate.
    let fixed = FitOptions {
        tau_estimator: TauEstimator::Fixed(0.04),
        ..FitOptions::fixed()
    };
    let pooled = fit_consistency(&net, &fixed).unwrap();
    // Q = 32, df = 1, sum(w) - sum(w²)/sum(w) = 100
    assert!(close(pooled.heterogeneity.tau2, 0.31, 1e-9));
    let b = pooled.relative_effect("B", "A").unwrap();
    assert!(close(b.se, (0.01f64 / 2.0).sqrt(), 1e-12));
}

#[test]
fn vanishing_standard_error_is_a_numerical_error() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.5, 1e-160),
        rec("s2", "A", "B", 0.7, 0.2),
    ])
    .unwrap();
    assert!(matches!(
        fit_consistency(&net, &FitOptions::fixed()),
        Err(NmaError::Numerical(_))
    ));
}

#[test]
fn disconnected_network_aborts_fit() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.1, 0.1),
        rec("s2", "C", "D", 0.9, 0.1),
    ])
    .unwrap();
    assert!(matches!(
        fit_consistency(&net, &FitOptions::fixed()),
        Err(NmaError::DisconnectedNetwork { .. })
    ));
    assert!(matches!(
        fit_consistency(&net, &FitOptions::fixed().with_reference("Z")),
        Err(NmaError::DisconnectedNetwork { .. })
    ));
}

#[test]
fn unknown_reference_is_rejected() {
    let net = EvidenceNetwork::from_records(vec![rec("s1", "A", "B", 0.1, 0.1)]).unwrap();
    assert!(matches!(
        fit_consistency(&net, &FitOptions::fixed().with_reference("Z")),
        Err(NmaError::UnknownTreatment(_))
    ));
}

#[test]
fn multi_arm_covariance_recovers_arm_level_contrast() {
    let arms = vec![
        ArmRecord::continuous("trial", "Placebo", 10.0, 4.0, 50),
        ArmRecord::continuous("trial", "Low dose", 8.5, 4.0, 40),
        ArmRecord::continuous("trial", "High dose", 7.0, 5.0, 45),
    ];
    let contrasts = build_contrasts(&arms, EffectMeasure::MeanDifference, Some("Placebo")).unwrap();
    assert_eq!(contrasts.records.len(), 2);
    assert_eq!(contrasts.arm_variances.len(), 3);

    let net = EvidenceNetwork::from_contrasts(contrasts).unwrap();
    let pooled = fit_consistency(&net, &FitOptions::fixed().with_reference("placebo")).unwrap();

    let high_vs_low = pooled.relative_effect("High dose", "Low dose").unwrap();
    assert!(close(high_vs_low.estimate, -1.5, 1e-9));
    let expected_se = (16.0 / 40.0 + 25.0 / 45.0f64).sqrt();
    assert!(close(high_vs_low.se, expected_se, 1e-9));
}

#[test]
fn standardized_residuals_are_scaled_by_standard_error() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.2, 0.1),
        rec("s2", "A", "B", 0.4, 0.1),
    ])
    .unwrap();
    let pooled = fit_consistency(&net, &FitOptions::fixed()).unwrap();
    let r = &pooled.residuals[0];
    assert!(close(r.fitted, 0.3, 1e-12));
    assert!(close(r.residual, -0.1, 1e-12));
    assert!(close(r.standardized, -1.0, 1e-9));
}
