//! Contrast builder: arm-level summaries to pairwise study records.
//!
//! Each study contributes one contrast per non-baseline arm. The effect
//! measure is fixed by configuration; nothing is inferred from the data.
//! For decomposable measures the per-arm sampling variances are returned as
//! well, so the network can model the correlation between contrasts that
//! share a baseline arm.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{NmaError, Result};
use crate::network::{StudyRecord, Treatment};

/// Continuity correction added to every cell of a binary study with a zero cell.
const CONTINUITY_CORRECTION: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArmOutcome {
    Continuous { mean: f64, sd: f64, n: u64 },
    Binary { events: u64, total: u64 },
}

/// One arm of one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmRecord {
    pub study_id: String,
    pub treatment: String,
    pub outcome: ArmOutcome,
}

impl ArmRecord {
    pub fn continuous(
        study_id: impl Into<String>,
        treatment: impl Into<String>,
        mean: f64,
        sd: f64,
        n: u64,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            treatment: treatment.into(),
            outcome: ArmOutcome::Continuous { mean, sd, n },
        }
    }

    pub fn binary(
        study_id: impl Into<String>,
        treatment: impl Into<String>,
        events: u64,
        total: u64,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            treatment: treatment.into(),
            outcome: ArmOutcome::Binary { events, total },
        }
    }
}

/// Summary measure on an additive scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMeasure {
    MeanDifference,
    /// Hedges' g.
    StandardizedMeanDifference,
    /// Log ratio of means.
    RatioOfMeans,
    LogOddsRatio,
    LogRiskRatio,
}

impl EffectMeasure {
    pub fn label(&self) -> &'static str {
        match self {
            EffectMeasure::MeanDifference => "mean difference",
            EffectMeasure::StandardizedMeanDifference => "standardized mean difference",
            EffectMeasure::RatioOfMeans => "log ratio of means",
            EffectMeasure::LogOddsRatio => "log odds ratio",
            EffectMeasure::LogRiskRatio => "log risk ratio",
        }
    }

    /// Effects are log ratios and should be exponentiated for display.
    pub fn is_ratio(&self) -> bool {
        matches!(
            self,
            EffectMeasure::RatioOfMeans | EffectMeasure::LogOddsRatio | EffectMeasure::LogRiskRatio
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, EffectMeasure::LogOddsRatio | EffectMeasure::LogRiskRatio)
    }

    /// Back-transform an effect (or interval bound) for display.
    pub fn display_scale(&self, value: f64) -> f64 {
        if self.is_ratio() {
            value.exp()
        } else {
            value
        }
    }

    /// Per-arm summary and its sampling variance, for decomposable measures.
    fn arm_summary(&self, arm: &PreparedArm) -> Option<(f64, f64)> {
        match (*self, arm.outcome) {
            (EffectMeasure::MeanDifference, Outcome::Continuous { mean, sd, n }) => {
                Some((mean, sd * sd / n))
            }
            (EffectMeasure::RatioOfMeans, Outcome::Continuous { mean, sd, n }) => {
                Some((mean.ln(), sd * sd / (n * mean * mean)))
            }
            (EffectMeasure::LogOddsRatio, Outcome::Binary { events, total }) => {
                let non_events = total - events;
                Some(((events / non_events).ln(), 1.0 / events + 1.0 / non_events))
            }
            (EffectMeasure::LogRiskRatio, Outcome::Binary { events, total }) => {
                Some(((events / total).ln(), 1.0 / events - 1.0 / total))
            }
            _ => None,
        }
    }

    /// Contrast of `arm` against `base` as (effect, variance).
    fn contrast(&self, arm: &PreparedArm, base: &PreparedArm) -> Option<(f64, f64)> {
        if let EffectMeasure::StandardizedMeanDifference = self {
            return hedges_g(arm, base);
        }
        let (ya, va) = self.arm_summary(arm)?;
        let (yb, vb) = self.arm_summary(base)?;
        Some((ya - yb, va + vb))
    }
}

fn hedges_g(arm: &PreparedArm, base: &PreparedArm) -> Option<(f64, f64)> {
    let (
        Outcome::Continuous { mean: m1, sd: s1, n: n1 },
        Outcome::Continuous { mean: m2, sd: s2, n: n2 },
    ) = (arm.outcome, base.outcome)
    else {
        return None;
    };
    let df = n1 + n2 - 2.0;
    if df <= 0.0 {
        return None;
    }
    let pooled_sd = (((n1 - 1.0) * s1 * s1 + (n2 - 1.0) * s2 * s2) / df).sqrt();
    if pooled_sd <= 0.0 {
        return None;
    }
    let j = 1.0 - 3.0 / (4.0 * (n1 + n2) - 9.0);
    let g = j * (m1 - m2) / pooled_sd;
    let var = (n1 + n2) / (n1 * n2) + g * g / (2.0 * (n1 + n2));
    Some((g, var))
}

/// Arm outcome after validation and continuity correction, as floats.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Continuous { mean: f64, sd: f64, n: f64 },
    Binary { events: f64, total: f64 },
}

#[derive(Debug, Clone)]
struct PreparedArm {
    raw_label: String,
    treatment: Treatment,
    outcome: Outcome,
}

/// Sampling variance of one arm's summary measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmVariance {
    pub study_id: String,
    pub treatment: String,
    pub variance: f64,
}

/// Output of the contrast builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContrastSet {
    pub records: Vec<StudyRecord>,
    /// Empty for non-decomposable measures (standardized mean difference).
    pub arm_variances: Vec<ArmVariance>,
}

/// Build baseline contrasts for every study.
///
/// The baseline arm of a study is `baseline` when the study includes it,
/// otherwise the first arm in normalized treatment order.
pub fn build_contrasts(
    arms: &[ArmRecord],
    measure: EffectMeasure,
    baseline: Option<&str>,
) -> Result<ContrastSet> {
    let preferred = baseline.map(Treatment::new);

    let mut study_order: Vec<&str> = Vec::new();
    let mut by_study: HashMap<&str, Vec<&ArmRecord>> = HashMap::new();
    for arm in arms {
        let entry = by_study.entry(arm.study_id.as_str()).or_default();
        if entry.is_empty() {
            study_order.push(arm.study_id.as_str());
        }
        entry.push(arm);
    }

    let mut out = ContrastSet::default();
    for study_id in study_order {
        let study_arms = &by_study[study_id];
        build_study(study_id, study_arms, measure, preferred.as_ref(), &mut out)?;
    }
    Ok(out)
}

fn build_study(
    study_id: &str,
    arms: &[&ArmRecord],
    measure: EffectMeasure,
    preferred: Option<&Treatment>,
    out: &mut ContrastSet,
) -> Result<()> {
    if arms.len() < 2 {
        return Err(NmaError::InsufficientArms {
            study_id: study_id.to_string(),
            arms: arms.len(),
        });
    }

    let mut prepared = arms
        .iter()
        .map(|a| prepare_arm(a, measure))
        .collect::<Result<Vec<_>>>()?;
    prepared.sort_by(|a, b| a.treatment.cmp(&b.treatment));
    for pair in prepared.windows(2) {
        if pair[0].treatment == pair[1].treatment {
            return Err(NmaError::degenerate(
                study_id,
                format!("treatment '{}' appears in more than one arm", pair[0].raw_label),
            ));
        }
    }

    if measure.is_binary() && prepared.iter().any(has_zero_cell) {
        for arm in prepared.iter_mut() {
            if let Outcome::Binary { events, total } = &mut arm.outcome {
                *events += CONTINUITY_CORRECTION;
                *total += 2.0 * CONTINUITY_CORRECTION;
            }
        }
    }

    let base_idx = preferred
        .and_then(|p| prepared.iter().position(|a| &a.treatment == p))
        .unwrap_or(0);
    let base = &prepared[base_idx];

    for (idx, arm) in prepared.iter().enumerate() {
        if idx == base_idx {
            continue;
        }
        let (effect, variance) = measure.contrast(arm, base).ok_or_else(|| NmaError::InvalidArm {
            study_id: study_id.to_string(),
            treatment: arm.raw_label.clone(),
            reason: format!("cannot compute {} against '{}'", measure.label(), base.raw_label),
        })?;
        if !(variance.is_finite() && variance > 0.0) || !effect.is_finite() {
            return Err(NmaError::degenerate(
                study_id,
                format!(
                    "contrast '{}' vs '{}' has non-positive or non-finite variance",
                    arm.raw_label, base.raw_label
                ),
            ));
        }
        out.records.push(StudyRecord::new(
            study_id,
            base.raw_label.clone(),
            arm.raw_label.clone(),
            effect,
            variance.sqrt(),
        ));
    }

    if prepared.len() > 2 {
        for arm in &prepared {
            if let Some((_, variance)) = measure.arm_summary(arm) {
                if variance.is_finite() && variance > 0.0 {
                    out.arm_variances.push(ArmVariance {
                        study_id: study_id.to_string(),
                        treatment: arm.raw_label.clone(),
                        variance,
                    });
                }
            }
        }
    }
    Ok(())
}

fn has_zero_cell(arm: &PreparedArm) -> bool {
    match arm.outcome {
        Outcome::Binary { events, total } => events == 0.0 || events == total,
        Outcome::Continuous { .. } => false,
    }
}

fn prepare_arm(arm: &ArmRecord, measure: EffectMeasure) -> Result<PreparedArm> {
    let invalid = |reason: String| NmaError::InvalidArm {
        study_id: arm.study_id.clone(),
        treatment: arm.treatment.clone(),
        reason,
    };

    let outcome = match (&arm.outcome, measure.is_binary()) {
        (ArmOutcome::Continuous { mean, sd, n }, false) => {
            if *n == 0 {
                return Err(invalid("sample size must be positive".into()));
            }
            if !mean.is_finite() || !sd.is_finite() || *sd < 0.0 {
                return Err(invalid(format!("invalid mean/sd ({mean}, {sd})")));
            }
            if measure == EffectMeasure::RatioOfMeans && *mean <= 0.0 {
                return Err(invalid(format!(
                    "ratio of means needs a positive mean, got {mean}"
                )));
            }
            Outcome::Continuous {
                mean: *mean,
                sd: *sd,
                n: *n as f64,
            }
        }
        (ArmOutcome::Binary { events, total }, true) => {
            if *total == 0 {
                return Err(invalid("total must be positive".into()));
            }
            if events > total {
                return Err(invalid(format!("events ({events}) exceed total ({total})")));
            }
            Outcome::Binary {
                events: *events as f64,
                total: *total as f64,
            }
        }
        (_, _) => {
            return Err(invalid(format!(
                "outcome kind does not match effect measure '{}'",
                measure.label()
            )))
        }
    };

    Ok(PreparedArm {
        raw_label: arm.treatment.trim().to_string(),
        treatment: Treatment::new(&arm.treatment),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hedges_g_applies_small_sample_correction() {
        let a = PreparedArm {
            raw_label: "a".into(),
            treatment: Treatment::new("a"),
            outcome: Outcome::Continuous { mean: 1.0, sd: 1.0, n: 10.0 },
        };
        let b = PreparedArm {
            raw_label: "b".into(),
            treatment: Treatment::new("b"),
            outcome: Outcome::Continuous { mean: 0.0, sd: 1.0, n: 10.0 },
        };
        let (g, var) = hedges_g(&a, &b).unwrap();
        let j = 1.0 - 3.0 / 71.0;
        assert!((g - j).abs() < 1e-12);
        assert!((var - (0.2 + g * g / 40.0)).abs() < 1e-12);
    }

    #[test]
    fn zero_cell_detection() {
        let arm = PreparedArm {
            raw_label: "a".into(),
            treatment: Treatment::new("a"),
            outcome: Outcome::Binary { events: 0.0, total: 20.0 },
        };
        assert!(has_zero_cell(&arm));
    }
}
