use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use nma_engine::{
    cumulative, leave_one_out, CumulativeOrder, EvidenceNetwork, FitOptions, NmaError,
    RefitOutcome, StudyRecord, TauEstimator,
};

fn rec(study: &str, a: &str, b: &str, effect: f64, se: f64) -> StudyRecord {
    StudyRecord::new(study, a, b, effect, se)
}

fn network() -> EvidenceNetwork {
    EvidenceNetwork::from_records(vec![
        rec("s1", "A", "B", 0.5, 0.2),
        rec("s2", "A", "B", 0.7, 0.2),
        rec("s3", "B", "C", 0.3, 0.25),
        rec("s4", "A", "C", 0.9, 0.3),
        rec("s5", "C", "D", -0.2, 0.3),
    ])
    .unwrap()
}

#[test]
fn leave_one_out_distinguishes_cut_studies() {
    let rows = leave_one_out(&network(), &FitOptions::fixed(), None).unwrap();
    assert_eq!(rows.len(), 5);

    let by_study: BTreeMap<_, _> = rows
        .iter()
        .map(|r| (r.omitted_study.as_str(), &r.outcome))
        .collect();

    // s1 is one of several A-B studies: still connected.
    let s1 = by_study["s1"].estimate().unwrap();
    assert!(s1.effects.iter().all(|e| e.estimate.estimate.is_finite()));
    assert_eq!(s1.effects.len(), 3);

    // s5 is the only link to D.
    match by_study["s5"] {
        RefitOutcome::NotEstimable { reason } => assert!(reason.contains("disconnected"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn leave_one_out_tracks_heterogeneity() {
    let rows = leave_one_out(
        &network(),
        &FitOptions::random(TauEstimator::DerSimonianLaird),
        None,
    )
    .unwrap();
    for row in rows.iter().filter(|r| r.outcome.is_estimable()) {
        let est = row.outcome.estimate().unwrap();
        assert!(est.tau2 >= 0.0);
        assert!(est.q.is_finite());
    }
}

#[test]
fn cumulative_adds_studies_in_requested_order() {
    let keys = BTreeMap::from([
        ("s1".to_string(), 2004.0),
        ("s2".to_string(), 2001.0),
        ("s3".to_string(), 2010.0),
        ("s4".to_string(), 2001.0),
        ("s5".to_string(), 2015.0),
    ]);
    let steps = cumulative(
        &network(),
        &FitOptions::fixed().with_reference("A"),
        &CumulativeOrder::ByKey(keys),
        None,
    )
    .unwrap();

    let added: Vec<_> = steps.iter().map(|s| s.added_study.as_str()).collect();
    assert_eq!(added, vec!["s2", "s4", "s1", "s3", "s5"]);
    assert_eq!(steps[2].studies, vec!["s2", "s4", "s1"]);

    // s2 alone: A-B only
    assert!((steps[0].outcome.effect_of("B").unwrap() - 0.7).abs() < 1e-12);
    // s2 + s4 cover A-B and A-C
    assert!(steps[1].outcome.is_estimable());
    assert!(steps[1].outcome.effect_of("D").is_none());
    assert!(steps.iter().all(|s| s.outcome.is_estimable()));
    assert!(steps[4].outcome.effect_of("D").is_some());
}

#[test]
fn cumulative_step_without_reference_is_recorded() {
    let steps = cumulative(
        &network(),
        &FitOptions::fixed().with_reference("D"),
        &CumulativeOrder::FirstSeen,
        None,
    )
    .unwrap();
    assert!(steps[..4].iter().all(|s| !s.outcome.is_estimable()));
    assert!(steps[4].outcome.is_estimable());
}

#[test]
fn cancelled_loop_returns_cancelled() {
    let cancel = AtomicBool::new(true);
    assert!(matches!(
        leave_one_out(&network(), &FitOptions::fixed(), Some(&cancel)),
        Err(NmaError::Cancelled)
    ));
    assert!(matches!(
        cumulative(
            &network(),
            &FitOptions::fixed(),
            &CumulativeOrder::Alphabetical,
            Some(&cancel)
        ),
        Err(NmaError::Cancelled)
    ));
}
