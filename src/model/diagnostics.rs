//! Convergence diagnostics for multi-chain MCMC output.

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Split each chain in half so within-chain drift shows up as between-chain variance.
fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    let mut out = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let half = chain.len() / 2;
        if half == 0 {
            continue;
        }
        out.push(&chain[..half]);
        out.push(&chain[chain.len() - half..]);
    }
    out
}

/// Split potential scale reduction factor.
///
/// Returns 1.0 for a parameter that is constant across all draws.
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let halves = split_chains(chains);
    if halves.len() < 2 {
        return f64::NAN;
    }
    let n = halves[0].len() as f64;
    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let w = mean(&halves.iter().map(|h| variance(h)).collect::<Vec<_>>());
    let b = n * variance(&means);
    if w <= 0.0 {
        return if b <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n - 1.0) / n * w + b / n;
    (var_plus / w).sqrt()
}

fn autocovariance(xs: &[f64], lag: usize) -> f64 {
    let n = xs.len();
    let m = mean(xs);
    (0..n - lag)
        .map(|t| (xs[t] - m) * (xs[t + lag] - m))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size across chains, using Geyer's initial positive sequence
/// on the multi-chain autocorrelation estimate.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    if m == 0 {
        return 0.0;
    }
    let n = chains.iter().map(Vec::len).min().unwrap_or(0);
    if n < 4 {
        return (m * n) as f64;
    }
    let total = (m * n) as f64;

    let means: Vec<f64> = chains.iter().map(|c| mean(&c[..n])).collect();
    let w = mean(&chains.iter().map(|c| variance(&c[..n])).collect::<Vec<_>>());
    let b_over_n = if m > 1 { variance(&means) } else { 0.0 };
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b_over_n;
    if var_plus <= 0.0 {
        return total;
    }

    let rho = |lag: usize| -> f64 {
        let acov = mean(
            &chains
                .iter()
                .map(|c| autocovariance(&c[..n], lag))
                .collect::<Vec<_>>(),
        );
        1.0 - (w - acov) / var_plus
    };

    // Sum consecutive pairs while positive, forcing the pair sums to be monotone.
    let mut sum = 0.0;
    let mut prev_pair = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair <= 0.0 {
            break;
        }
        let pair = pair.min(prev_pair);
        sum += pair;
        prev_pair = pair;
        lag += 2;
    }
    // sum over pairs starting at lag 0 counts rho(0) = 1 once too many.
    let tau = (2.0 * sum - 1.0).max(1.0 / total.log10().max(1.0));
    total / tau
}

/// Sample quantile with linear interpolation between order statistics.
///
/// `sorted` must be ascending.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = h.ceil() as usize;
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn quantile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&xs, 0.0), 1.0);
        assert_eq!(quantile(&xs, 1.0), 4.0);
        assert!((quantile(&xs, 0.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn independent_chains_mix() {
        let mut rng = StdRng::seed_from_u64(7);
        let chains: Vec<Vec<f64>> = (0..4)
            .map(|_| (0..500).map(|_| rng.gen::<f64>()).collect())
            .collect();
        let r = split_r_hat(&chains);
        assert!(r < 1.05, "r_hat = {r}");
        let ess = effective_sample_size(&chains);
        assert!(ess > 1000.0, "ess = {ess}");
    }

    #[test]
    fn shifted_chains_fail_r_hat() {
        let chains = vec![
            (0..100).map(|i| (i % 7) as f64 * 0.01).collect::<Vec<_>>(),
            (0..100).map(|i| 5.0 + (i % 5) as f64 * 0.01).collect::<Vec<_>>(),
        ];
        assert!(split_r_hat(&chains) > 1.5);
    }
}
