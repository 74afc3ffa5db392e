use nma_engine::{
    fit_consistency, p_scores, EvidenceNetwork, FitOptions, RankDirection, StudyRecord,
};

fn rec(study: &str, a: &str, b: &str, effect: f64, se: f64) -> StudyRecord {
    StudyRecord::new(study, a, b, effect, se)
}

fn network() -> EvidenceNetwork {
    EvidenceNetwork::from_records(vec![
        rec("s1", "Placebo", "Drug A", -0.8, 0.2),
        rec("s2", "Placebo", "Drug B", -0.3, 0.25),
        rec("s3", "Drug A", "Drug B", 0.4, 0.3),
        rec("s4", "Placebo", "Drug C", -0.5, 0.4),
    ])
    .unwrap()
}

#[test]
fn pairwise_win_probabilities_are_complementary() {
    let pooled = fit_consistency(&network(), &FitOptions::fixed()).unwrap();
    let ranking = p_scores(&pooled, RankDirection::SmallerIsBetter);
    let n = ranking.treatments.len();
    for i in 0..n {
        for j in 0..n {
            let sum = ranking.win_probability[i][j] + ranking.win_probability[j][i];
            assert!((sum - 1.0).abs() < 1e-12, "({i}, {j}) sums to {sum}");
        }
    }
    // P-scores average to 1/2.
    let mean: f64 = ranking.entries.iter().map(|e| e.score).sum::<f64>() / n as f64;
    assert!((mean - 0.5).abs() < 1e-12);
}

#[test]
fn direction_reverses_ranking() {
    let pooled = fit_consistency(&network(), &FitOptions::fixed()).unwrap();
    let smaller = p_scores(&pooled, RankDirection::SmallerIsBetter);
    let larger = p_scores(&pooled, RankDirection::LargerIsBetter);

    assert_eq!(smaller.entries[0].label, "Drug A");
    assert_eq!(smaller.entries.last().unwrap().label, "Placebo");
    assert_eq!(larger.entries[0].label, "Placebo");

    for entry in &smaller.entries {
        let other = larger.score_of(&entry.treatment).unwrap();
        assert!((entry.score + other - 1.0).abs() < 1e-12);
    }
    let ranks: Vec<usize> = smaller.entries.iter().map(|e| e.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4]);
}

#[test]
fn identical_treatments_share_a_rank() {
    let net = EvidenceNetwork::from_records(vec![
        rec("s1", "P", "X", -0.5, 0.2),
        rec("s2", "P", "Y", -0.5, 0.2),
    ])
    .unwrap();
    let pooled = fit_consistency(&net, &FitOptions::fixed()).unwrap();
    let ranking = p_scores(&pooled, RankDirection::SmallerIsBetter);
    let order: Vec<_> = ranking
        .entries
        .iter()
        .map(|e| (e.treatment.as_str(), e.rank))
        .collect();
    assert_eq!(order, vec![("x", 1), ("y", 1), ("p", 3)]);
    assert!((ranking.win_probability[1][2] - 0.5).abs() < 1e-12);
}
