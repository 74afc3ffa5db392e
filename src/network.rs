//! Evidence network: canonical comparisons between treatments.
//!
//! A multigraph with treatments as nodes and one edge per (study, pair).
//! Edges are order-canonicalized on insertion so every edge between the same
//! two treatments carries the same sign convention: an edge `(a, b, effect)`
//! with `a < b` observes `d(b) - d(a)`.
//!
//! All derived views (`without_studies`, `restricted_to_studies`,
//! `without_pair`, `only_pair`) return new networks; nothing is mutated after
//! construction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contrast::ContrastSet;
use crate::error::{NmaError, Result};

// ---------------------------------------------------------------------
//  Treatment identifiers
// ---------------------------------------------------------------------

/// Normalized treatment identifier.
///
/// Normalization lowercases, trims, and collapses every run of whitespace,
/// `_` or `-` into a single `_`, so `"Drug A"`, `"drug_a"` and `"DRUG-A"`
/// are the same treatment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Treatment(String);

impl Treatment {
    pub fn new(raw: &str) -> Self {
        Treatment(normalize_treatment(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Treatment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Treatment {
    fn from(raw: &str) -> Self {
        Treatment::new(raw)
    }
}

pub fn normalize_treatment(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

// ---------------------------------------------------------------------
//  Records and canonical edges
// ---------------------------------------------------------------------

/// One observed comparison: `effect` estimates `d(treatment_b) - d(treatment_a)`
/// on an additive scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_id: String,
    pub treatment_a: String,
    pub treatment_b: String,
    pub effect: f64,
    pub std_error: f64,
}

impl StudyRecord {
    pub fn new(
        study_id: impl Into<String>,
        treatment_a: impl Into<String>,
        treatment_b: impl Into<String>,
        effect: f64,
        std_error: f64,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            treatment_a: treatment_a.into(),
            treatment_b: treatment_b.into(),
            effect,
            std_error,
        }
    }
}

/// A comparison with `treatment_a < treatment_b` in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEdge {
    pub study_id: String,
    pub treatment_a: Treatment,
    pub treatment_b: Treatment,
    pub effect: f64,
    pub std_error: f64,
}

impl CanonicalEdge {
    pub fn variance(&self) -> f64 {
        self.std_error * self.std_error
    }

    pub fn touches(&self, t: &Treatment) -> bool {
        &self.treatment_a == t || &self.treatment_b == t
    }

    pub fn connects(&self, a: &Treatment, b: &Treatment) -> bool {
        (&self.treatment_a == a && &self.treatment_b == b)
            || (&self.treatment_a == b && &self.treatment_b == a)
    }

    /// Sign of `t` in this edge's contrast: +1 for `treatment_b`, -1 for `treatment_a`.
    pub fn sign_of(&self, t: &Treatment) -> f64 {
        if &self.treatment_b == t {
            1.0
        } else if &self.treatment_a == t {
            -1.0
        } else {
            0.0
        }
    }

    pub fn to_record(&self) -> StudyRecord {
        StudyRecord::new(
            self.study_id.clone(),
            self.treatment_a.as_str(),
            self.treatment_b.as_str(),
            self.effect,
            self.std_error,
        )
    }
}

/// Validate and order-canonicalize a record.
pub fn canonicalize(record: &StudyRecord) -> Result<CanonicalEdge> {
    let a = Treatment::new(&record.treatment_a);
    let b = Treatment::new(&record.treatment_b);
    if a.as_str().is_empty() || b.as_str().is_empty() {
        return Err(NmaError::degenerate(
            &record.study_id,
            "empty treatment identifier",
        ));
    }
    if a == b {
        return Err(NmaError::degenerate(
            &record.study_id,
            format!("self-comparison of '{a}'"),
        ));
    }
    if !(record.std_error.is_finite() && record.std_error > 0.0) {
        return Err(NmaError::degenerate(
            &record.study_id,
            format!("std_error must be positive, got {}", record.std_error),
        ));
    }
    if !record.effect.is_finite() {
        return Err(NmaError::degenerate(&record.study_id, "effect is not finite"));
    }

    let (treatment_a, treatment_b, sign) = if a < b { (a, b, 1.0) } else { (b, a, -1.0) };
    Ok(CanonicalEdge {
        study_id: record.study_id.clone(),
        treatment_a,
        treatment_b,
        effect: sign * record.effect,
        std_error: record.std_error,
    })
}

// ---------------------------------------------------------------------
//  Network
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceNetwork {
    treatments: BTreeSet<Treatment>,
    labels: BTreeMap<Treatment, String>,
    edges: Vec<CanonicalEdge>,
    /// Per-study arm variances, used for multi-arm covariance.
    arm_variances: BTreeMap<String, BTreeMap<Treatment, f64>>,
    /// Studies in first-seen order.
    studies: Vec<String>,
    /// Records skipped because they close a loop inside one study.
    redundant: Vec<StudyRecord>,
    /// Studies removed from a parent network by a derived view.
    excluded: Vec<String>,
}

impl EvidenceNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = StudyRecord>,
    {
        let mut net = Self::new();
        for record in records {
            net.add(record)?;
        }
        Ok(net)
    }

    /// Build from contrast-builder output, carrying arm variances along.
    pub fn from_contrasts(contrasts: ContrastSet) -> Result<Self> {
        let mut net = Self::new();
        for record in contrasts.records {
            net.add(record)?;
        }
        for arm in contrasts.arm_variances {
            net.set_arm_variance(&arm.study_id, &arm.treatment, arm.variance)?;
        }
        Ok(net)
    }

    /// Canonicalize and append one comparison.
    pub fn add(&mut self, record: StudyRecord) -> Result<()> {
        let edge = canonicalize(&record)?;

        if self.closes_study_loop(&edge) {
            debug!(
                study = %edge.study_id,
                a = %edge.treatment_a,
                b = %edge.treatment_b,
                "skipping redundant multi-arm comparison"
            );
            self.redundant.push(record);
            return Ok(());
        }

        for raw in [&record.treatment_a, &record.treatment_b] {
            self.labels
                .entry(Treatment::new(raw))
                .or_insert_with(|| raw.trim().to_string());
        }

        self.treatments.insert(edge.treatment_a.clone());
        self.treatments.insert(edge.treatment_b.clone());
        if !self.studies.iter().any(|s| s == &edge.study_id) {
            self.studies.push(edge.study_id.clone());
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Record the sampling variance of one arm's summary measure.
    pub fn set_arm_variance(&mut self, study_id: &str, treatment: &str, variance: f64) -> Result<()> {
        if !(variance.is_finite() && variance > 0.0) {
            return Err(NmaError::degenerate(
                study_id,
                format!("arm variance for '{treatment}' must be positive, got {variance}"),
            ));
        }
        self.arm_variances
            .entry(study_id.to_string())
            .or_default()
            .insert(Treatment::new(treatment), variance);
        Ok(())
    }

    /// True when the edge's treatments are already linked by earlier edges of
    /// the same study (duplicate pair or a loop within a multi-arm study).
    fn closes_study_loop(&self, edge: &CanonicalEdge) -> bool {
        let mut adj: HashMap<&Treatment, Vec<&Treatment>> = HashMap::new();
        for e in self.edges.iter().filter(|e| e.study_id == edge.study_id) {
            adj.entry(&e.treatment_a).or_default().push(&e.treatment_b);
            adj.entry(&e.treatment_b).or_default().push(&e.treatment_a);
        }
        if adj.is_empty() {
            return false;
        }
        let mut seen: HashSet<&Treatment> = HashSet::new();
        let mut stack = vec![&edge.treatment_a];
        while let Some(u) = stack.pop() {
            if u == &edge.treatment_b {
                return true;
            }
            if !seen.insert(u) {
                continue;
            }
            if let Some(next) = adj.get(u) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    // -- Accessors -----------------------------------------------------------

    pub fn treatments(&self) -> impl Iterator<Item = &Treatment> {
        self.treatments.iter()
    }

    pub fn treatment_list(&self) -> Vec<Treatment> {
        self.treatments.iter().cloned().collect()
    }

    pub fn num_treatments(&self) -> usize {
        self.treatments.len()
    }

    pub fn edges(&self) -> &[CanonicalEdge] {
        &self.edges
    }

    pub fn studies(&self) -> &[String] {
        &self.studies
    }

    pub fn num_studies(&self) -> usize {
        self.studies.len()
    }

    pub fn redundant_records(&self) -> &[StudyRecord] {
        &self.redundant
    }

    pub fn excluded_studies(&self) -> &[String] {
        &self.excluded
    }

    pub fn contains(&self, t: &Treatment) -> bool {
        self.treatments.contains(t)
    }

    /// Display label (first raw spelling seen) for a treatment.
    pub fn label<'a>(&'a self, t: &'a Treatment) -> &'a str {
        self.labels.get(t).map(String::as_str).unwrap_or(t.as_str())
    }

    pub fn arm_variance(&self, study_id: &str, t: &Treatment) -> Option<f64> {
        self.arm_variances.get(study_id).and_then(|m| m.get(t)).copied()
    }

    /// Resolve a raw treatment name against this network.
    pub fn resolve(&self, raw: &str) -> Result<Treatment> {
        let t = Treatment::new(raw);
        if self.treatments.contains(&t) {
            Ok(t)
        } else {
            Err(NmaError::UnknownTreatment(raw.to_string()))
        }
    }

    /// Edges touching a treatment, lazily.
    pub fn comparisons<'a>(&'a self, t: &'a Treatment) -> impl Iterator<Item = &'a CanonicalEdge> + 'a {
        self.edges.iter().filter(move |e| e.touches(t))
    }

    /// Direct comparisons between two treatments, lazily.
    pub fn direct_edges<'a>(
        &'a self,
        a: &'a Treatment,
        b: &'a Treatment,
    ) -> impl Iterator<Item = &'a CanonicalEdge> + 'a {
        self.edges.iter().filter(move |e| e.connects(a, b))
    }

    /// Treatment pairs with at least one direct comparison, in canonical order.
    pub fn direct_pairs(&self) -> Vec<(Treatment, Treatment)> {
        let pairs: BTreeSet<(Treatment, Treatment)> = self
            .edges
            .iter()
            .map(|e| (e.treatment_a.clone(), e.treatment_b.clone()))
            .collect();
        pairs.into_iter().collect()
    }

    /// Treatments compared within each study (its design), sorted.
    pub fn study_designs(&self) -> BTreeMap<String, Vec<Treatment>> {
        let mut out: BTreeMap<String, BTreeSet<Treatment>> = BTreeMap::new();
        for e in &self.edges {
            let set = out.entry(e.study_id.clone()).or_default();
            set.insert(e.treatment_a.clone());
            set.insert(e.treatment_b.clone());
        }
        out.into_iter()
            .map(|(s, set)| (s, set.into_iter().collect()))
            .collect()
    }

    // -- Topology --------------------------------------------------------------

    /// Component label per treatment (in `treatment_list` order).
    fn component_labels(&self) -> (Vec<Treatment>, Vec<usize>) {
        let nodes = self.treatment_list();
        let index: HashMap<&Treatment, usize> =
            nodes.iter().enumerate().map(|(i, t)| (t, i)).collect();
        let n = nodes.len();

        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for e in &self.edges {
            let (Some(&i), Some(&j)) = (index.get(&e.treatment_a), index.get(&e.treatment_b)) else {
                continue;
            };
            adj[i].push(j);
            adj[j].push(i);
        }

        let mut labels = vec![usize::MAX; n];
        let mut comp_id = 0;
        for start in 0..n {
            if labels[start] != usize::MAX {
                continue;
            }
            let mut stack = vec![start];
            labels[start] = comp_id;
            while let Some(u) = stack.pop() {
                for &v in &adj[u] {
                    if labels[v] == usize::MAX {
                        labels[v] = comp_id;
                        stack.push(v);
                    }
                }
            }
            comp_id += 1;
        }
        (nodes, labels)
    }

    /// Partitions of the treatment set reachable via edges, ordered by their
    /// smallest treatment.
    pub fn connected_components(&self) -> Vec<Vec<Treatment>> {
        let (nodes, labels) = self.component_labels();
        let count = labels.iter().copied().max().map_or(0, |m| m + 1);
        let mut comps: Vec<Vec<Treatment>> = vec![Vec::new(); count];
        for (node, label) in nodes.into_iter().zip(labels) {
            comps[label].push(node);
        }
        comps
    }

    pub fn is_connected(&self) -> bool {
        !self.edges.is_empty() && self.connected_components().len() == 1
    }

    pub fn same_component(&self, a: &Treatment, b: &Treatment) -> bool {
        self.connected_components()
            .iter()
            .any(|c| c.contains(a) && c.contains(b))
    }

    /// Pooling is only defined on a single, non-empty component.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.edges.is_empty() {
            return Err(NmaError::EmptyNetwork);
        }
        let comps = self.connected_components();
        if comps.len() > 1 {
            return Err(NmaError::DisconnectedNetwork {
                components: comps
                    .iter()
                    .map(|c| c.iter().map(|t| self.label(t).to_string()).collect())
                    .collect(),
            });
        }
        Ok(())
    }

    // -- Derived views ---------------------------------------------------------

    fn filtered<F>(&self, keep_edge: F, keep_treatments: bool) -> Self
    where
        F: Fn(&CanonicalEdge) -> bool,
    {
        let edges: Vec<CanonicalEdge> = self.edges.iter().filter(|&e| keep_edge(e)).cloned().collect();
        let kept_studies: HashSet<String> = edges.iter().map(|e| e.study_id.clone()).collect();

        let treatments: BTreeSet<Treatment> = if keep_treatments {
            self.treatments.clone()
        } else {
            edges
                .iter()
                .flat_map(|e| [e.treatment_a.clone(), e.treatment_b.clone()])
                .collect()
        };
        let labels = self
            .labels
            .iter()
            .filter(|(t, _)| treatments.contains(*t))
            .map(|(t, l)| (t.clone(), l.clone()))
            .collect();

        let studies: Vec<String> = self
            .studies
            .iter()
            .filter(|s| kept_studies.contains(s.as_str()))
            .cloned()
            .collect();
        let mut excluded = self.excluded.clone();
        for s in &self.studies {
            if !kept_studies.contains(s.as_str()) && !excluded.contains(s) {
                excluded.push(s.clone());
            }
        }

        Self {
            treatments,
            labels,
            edges,
            arm_variances: self
                .arm_variances
                .iter()
                .filter(|(s, _)| kept_studies.contains(s.as_str()))
                .map(|(s, m)| (s.clone(), m.clone()))
                .collect(),
            studies,
            redundant: self.redundant.clone(),
            excluded,
        }
    }

    /// Drop every edge of the given studies. The treatment set is kept, so a
    /// treatment that only those studies reached is left isolated.
    pub fn without_studies<S: AsRef<str>>(&self, studies: &[S]) -> Self {
        let drop: HashSet<&str> = studies.iter().map(|s| s.as_ref()).collect();
        self.filtered(|e| !drop.contains(e.study_id.as_str()), true)
    }

    /// Keep only the given studies; the treatment set shrinks to what they reach.
    pub fn restricted_to_studies<S: AsRef<str>>(&self, studies: &[S]) -> Self {
        let keep: HashSet<&str> = studies.iter().map(|s| s.as_ref()).collect();
        self.filtered(|e| keep.contains(e.study_id.as_str()), false)
    }

    /// Drop all direct comparisons between `a` and `b`.
    pub fn without_pair(&self, a: &Treatment, b: &Treatment) -> Self {
        self.filtered(|e| !e.connects(a, b), true)
    }

    /// Keep only the direct comparisons between `a` and `b`.
    pub fn only_pair(&self, a: &Treatment, b: &Treatment) -> Self {
        self.filtered(|e| e.connects(a, b), false)
    }

    /// Stable content hash of the canonical edge list.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.edges).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}
