//! Treatment ranking: P-scores from a pooled fit, SUCRA from posterior draws.

use serde::{Deserialize, Serialize};

use crate::model::{normal_cdf, PooledResult, PosteriorSample};
use crate::network::Treatment;

const TIE_EPS: f64 = 1e-12;

/// Which end of the effect scale is desirable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankDirection {
    #[default]
    SmallerIsBetter,
    LargerIsBetter,
}

impl RankDirection {
    fn sign(self) -> f64 {
        match self {
            RankDirection::SmallerIsBetter => -1.0,
            RankDirection::LargerIsBetter => 1.0,
        }
    }

    /// True when `x` is strictly better than `y`.
    pub fn better(self, x: f64, y: f64) -> bool {
        match self {
            RankDirection::SmallerIsBetter => x < y,
            RankDirection::LargerIsBetter => x > y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMethod {
    PScore,
    Sucra,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankEntry {
    pub treatment: String,
    pub label: String,
    /// P-score or SUCRA in [0, 1].
    pub score: f64,
    /// Competition rank (1 = best); equal scores share a rank.
    pub rank: usize,
    /// Posterior mean rank (Bayesian only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_rank: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ranking {
    pub direction: RankDirection,
    pub method: RankMethod,
    /// Best first.
    pub entries: Vec<RankEntry>,
    /// Treatment order of the matrices below.
    pub treatments: Vec<String>,
    /// `win_probability[i][j] = P(treatment i better than j)`; 0.5 on the diagonal.
    pub win_probability: Vec<Vec<f64>>,
    /// `rank_probabilities[i][r] = P(treatment i has rank r + 1)` (Bayesian only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_probabilities: Option<Vec<Vec<f64>>>,
}

impl Ranking {
    pub fn entry(&self, raw: &str) -> Option<&RankEntry> {
        let t = Treatment::new(raw);
        self.entries.iter().find(|e| e.treatment == t.as_str())
    }

    pub fn score_of(&self, raw: &str) -> Option<f64> {
        self.entry(raw).map(|e| e.score)
    }
}

fn mean_off_diagonal(row: &[f64], i: usize) -> f64 {
    if row.len() < 2 {
        return 1.0;
    }
    let sum: f64 = row
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != i)
        .map(|(_, p)| p)
        .sum();
    sum / (row.len() - 1) as f64
}

/// Order by score, assign competition ranks, list ties in treatment order.
fn rank_entries(
    treatments: &[String],
    labels: &[String],
    scores: &[f64],
    mean_ranks: Option<&[f64]>,
) -> Vec<RankEntry> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

    let mut ranks = vec![0usize; scores.len()];
    for (pos, &i) in order.iter().enumerate() {
        ranks[i] = match pos.checked_sub(1).map(|p| order[p]) {
            Some(prev) if (scores[prev] - scores[i]).abs() <= TIE_EPS => ranks[prev],
            _ => pos + 1,
        };
    }
    order.sort_by_key(|&i| (ranks[i], i));

    order
        .into_iter()
        .map(|i| RankEntry {
            treatment: treatments[i].clone(),
            label: labels[i].clone(),
            score: scores[i],
            rank: ranks[i],
            mean_rank: mean_ranks.map(|m| m[i]),
        })
        .collect()
}

fn pairwise_win(diff: f64, se: f64, direction: RankDirection) -> f64 {
    let signed = direction.sign() * diff;
    if se <= TIE_EPS {
        if signed > 0.0 {
            1.0
        } else if signed < 0.0 {
            0.0
        } else {
            0.5
        }
    } else {
        normal_cdf(signed / se)
    }
}

/// Frequentist P-scores from a pooled fit.
pub fn p_scores(pooled: &PooledResult, direction: RankDirection) -> Ranking {
    let n = pooled.treatments.len();
    let win: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        0.5
                    } else {
                        pairwise_win(pooled.effect_matrix[i][j], pooled.se_matrix[i][j], direction)
                    }
                })
                .collect()
        })
        .collect();
    let scores: Vec<f64> = win
        .iter()
        .enumerate()
        .map(|(i, row)| mean_off_diagonal(row, i))
        .collect();

    Ranking {
        direction,
        method: RankMethod::PScore,
        entries: rank_entries(&pooled.treatments, &pooled.labels, &scores, None),
        treatments: pooled.treatments.clone(),
        win_probability: win,
        rank_probabilities: None,
    }
}

/// SUCRA and rank probabilities from posterior draws.
pub fn sucra(posterior: &PosteriorSample, direction: RankDirection) -> Ranking {
    let n = posterior.treatments.len();
    let draws = posterior.num_draws().max(1) as f64;

    let mut wins = vec![vec![0.0; n]; n];
    let mut rank_counts = vec![vec![0.0; n]; n];
    for d in &posterior.treatment_effects {
        for i in 0..n {
            let mut better_than_i = 0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                if direction.better(d[i], d[j]) {
                    wins[i][j] += 1.0;
                } else if d[i] == d[j] {
                    wins[i][j] += 0.5;
                } else {
                    better_than_i += 1;
                }
            }
            rank_counts[i][better_than_i] += 1.0;
        }
    }

    let win: Vec<Vec<f64>> = wins
        .iter()
        .enumerate()
        .map(|(i, row)| {
            row.iter()
                .enumerate()
                .map(|(j, w)| if i == j { 0.5 } else { w / draws })
                .collect()
        })
        .collect();
    let rank_probabilities: Vec<Vec<f64>> = rank_counts
        .iter()
        .map(|row| row.iter().map(|c| c / draws).collect())
        .collect();
    let mean_ranks: Vec<f64> = rank_probabilities
        .iter()
        .map(|row| row.iter().enumerate().map(|(r, p)| (r + 1) as f64 * p).sum())
        .collect();
    let scores: Vec<f64> = win
        .iter()
        .enumerate()
        .map(|(i, row)| mean_off_diagonal(row, i))
        .collect();

    Ranking {
        direction,
        method: RankMethod::Sucra,
        entries: rank_entries(&posterior.treatments, &posterior.labels, &scores, Some(&mean_ranks)),
        treatments: posterior.treatments.clone(),
        win_probability: win,
        rank_probabilities: Some(rank_probabilities),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ties_share_rank_and_keep_treatment_order() {
        let t = names(&["a", "b", "c"]);
        let entries = rank_entries(&t, &t, &[0.25, 0.75, 0.75], None);
        let order: Vec<_> = entries.iter().map(|e| (e.treatment.as_str(), e.rank)).collect();
        assert_eq!(order, vec![("b", 1), ("c", 1), ("a", 3)]);
    }

    #[test]
    fn zero_se_resolves_by_sign() {
        assert_eq!(pairwise_win(-1.0, 0.0, RankDirection::SmallerIsBetter), 1.0);
        assert_eq!(pairwise_win(-1.0, 0.0, RankDirection::LargerIsBetter), 0.0);
        assert_eq!(pairwise_win(0.0, 0.0, RankDirection::LargerIsBetter), 0.5);
    }
}
