//! Relevance grading
//!
//! [`Grader::grade`] compares one [`ResultSet`] with its [`ExpectedResult`]
//! and produces a [`GradeReport`]:
//! - precision@k: relevant hits in the top `k`, divided by `k`
//! - recall: relevant IDs found anywhere in the set, divided by the expected count
//! - tier-weighted score: weight of relevant hits over the weight of all expected IDs, capped at 1
//! - reciprocal rank: `1 / rank` of the first relevant hit
//! - overlap, for comparison fixtures: IDs both rankings share, divided by the
//!   length of the longer ranking (same-rank matches only under strict order)
//!
//! A failing grade is data, not an error. The grader only errors when its
//! inputs are structurally broken.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use search_relevance_core::config::{env_value, parse_value};
use search_relevance_core::{ItemId, ResultSet};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EvalError, EvalResult};
use crate::fixture::{Comparison, ExpectedResult, HIGHLY_RELEVANT, RELEVANT, ThresholdOverrides};

/// Default precision cutoffs.
pub const DEFAULT_CUTOFFS: [usize; 2] = [5, 10];
/// Weight of expected IDs that carry no tier.
pub const DEFAULT_UNTIERED_WEIGHT: f64 = 1.0;
/// Default recall floor.
pub const DEFAULT_MIN_RECALL: f64 = 0.5;
/// Default tier-weighted floor.
pub const DEFAULT_MIN_TIER_SCORE: f64 = 0.5;

/// Slack for comparing a metric with its threshold.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// Minimum metric values a query must reach to pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thresholds {
    /// Floors on precision@k, by `k`
    pub precision_at: BTreeMap<usize, f64>,
    pub recall: Option<f64>,
    pub tier_weighted: Option<f64>,
    pub reciprocal_rank: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            precision_at: BTreeMap::new(),
            recall: Some(DEFAULT_MIN_RECALL),
            tier_weighted: Some(DEFAULT_MIN_TIER_SCORE),
            reciprocal_rank: None,
        }
    }
}

impl Thresholds {
    /// Apply per-fixture overrides field by field.
    #[must_use]
    pub fn merged(&self, overrides: &ThresholdOverrides) -> Self {
        let mut precision_at = self.precision_at.clone();
        precision_at.extend(overrides.precision_at.iter().map(|(k, v)| (*k, *v)));
        Self {
            precision_at,
            recall: overrides.recall.or(self.recall),
            tier_weighted: overrides.tier_weighted.or(self.tier_weighted),
            reciprocal_rank: overrides.reciprocal_rank.or(self.reciprocal_rank),
        }
    }
}

/// Grader configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraderConfig {
    /// Precision cutoffs always reported
    pub cutoffs: Vec<usize>,
    /// Weight per tier name
    pub tier_weights: BTreeMap<String, f64>,
    pub untiered_weight: f64,
    pub thresholds: Thresholds,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            cutoffs: DEFAULT_CUTOFFS.to_vec(),
            tier_weights: BTreeMap::from([
                (HIGHLY_RELEVANT.to_owned(), 2.0),
                (RELEVANT.to_owned(), 1.0),
            ]),
            untiered_weight: DEFAULT_UNTIERED_WEIGHT,
            thresholds: Thresholds::default(),
        }
    }
}

impl GraderConfig {
    /// Load from the process environment (with `.env` fallback).
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Load from an arbitrary key lookup.
    ///
    /// Keys: `RELEVANCE_CUTOFFS` (`5,10`), `RELEVANCE_TIER_WEIGHTS`
    /// (`highly_relevant=2,relevant=1`), `RELEVANCE_MIN_RECALL`,
    /// `RELEVANCE_MIN_TIER_SCORE`, `RELEVANCE_MIN_RECIPROCAL_RANK`, and
    /// `RELEVANCE_MIN_PRECISION_AT_<k>` for each cutoff.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("RELEVANCE_CUTOFFS") {
            let cutoffs: BTreeSet<usize> = raw
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .filter(|k| *k > 0)
                .collect();
            if cutoffs.is_empty() {
                warn!(value = %raw, "ignoring RELEVANCE_CUTOFFS without a positive cutoff");
            } else {
                config.cutoffs = cutoffs.into_iter().collect();
            }
        }

        if let Some(raw) = lookup("RELEVANCE_TIER_WEIGHTS") {
            let weights = parse_tier_weights(&raw);
            if weights.is_empty() {
                warn!(value = %raw, "ignoring RELEVANCE_TIER_WEIGHTS without a usable entry");
            } else {
                config.tier_weights = weights;
            }
        }

        if let Some(v) = parse_fraction(&lookup, "RELEVANCE_MIN_RECALL") {
            config.thresholds.recall = Some(v);
        }
        if let Some(v) = parse_fraction(&lookup, "RELEVANCE_MIN_TIER_SCORE") {
            config.thresholds.tier_weighted = Some(v);
        }
        if let Some(v) = parse_fraction(&lookup, "RELEVANCE_MIN_RECIPROCAL_RANK") {
            config.thresholds.reciprocal_rank = Some(v);
        }
        for k in &config.cutoffs {
            if let Some(v) = parse_fraction(&lookup, &format!("RELEVANCE_MIN_PRECISION_AT_{k}")) {
                config.thresholds.precision_at.insert(*k, v);
            }
        }
        config
    }

    /// Weight for one expected item, `None` when its tier is unknown.
    #[must_use]
    pub fn weight_for(&self, tier: Option<&str>) -> Option<f64> {
        match tier {
            None => Some(self.untiered_weight),
            Some(t) => self.tier_weights.get(t).copied(),
        }
    }
}

fn parse_fraction(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<f64> {
    let value: f64 = parse_value(lookup, key)?;
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Some(value)
    } else {
        warn!(key, value, "ignoring threshold outside [0, 1]");
        None
    }
}

/// Parse `tier=weight` pairs; invalid or non-positive entries are skipped.
fn parse_tier_weights(raw: &str) -> BTreeMap<String, f64> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, weight) = pair.split_once('=')?;
            let name = crate::fixture::normalize_name(name);
            let weight: f64 = weight.trim().parse().ok()?;
            (!name.is_empty() && weight.is_finite() && weight > 0.0).then_some((name, weight))
        })
        .collect()
}

/// One metric compared with its threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricCheck {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
}

impl MetricCheck {
    fn new(metric: impl Into<String>, value: f64, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            threshold,
            passed: value + THRESHOLD_EPSILON >= threshold,
        }
    }
}

/// Agreement between a fixture's ranking and its comparison query's ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonCheck {
    pub term: String,
    pub overlap: f64,
    pub minimum_overlap: f64,
    /// Only IDs at the same rank were counted
    pub strict_order: bool,
    pub compared_ids: Vec<ItemId>,
    pub passed: bool,
}

impl ComparisonCheck {
    fn new(
        comparison: &Comparison,
        strict_order: bool,
        ids: &[ItemId],
        compared_ids: Vec<ItemId>,
    ) -> Self {
        let overlap = ranking_overlap(ids, &compared_ids, strict_order);
        Self {
            term: comparison.term.clone(),
            overlap,
            minimum_overlap: comparison.minimum_overlap,
            strict_order,
            compared_ids,
            passed: overlap + THRESHOLD_EPSILON >= comparison.minimum_overlap,
        }
    }
}

/// Metrics and verdict for one query. Never mutated after grading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeReport {
    pub precision_at: BTreeMap<usize, f64>,
    pub recall: f64,
    pub tier_weighted: f64,
    pub reciprocal_rank: f64,
    /// The fixture expected no IDs and compares with nothing, so every metric
    /// is vacuously 1.0
    pub degenerate: bool,
    pub checks: Vec<MetricCheck>,
    /// Forbidden IDs that were returned, in rank order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub forbidden_hits: Vec<ItemId>,
    /// Set only for strict-order fixtures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_matched: Option<bool>,
    /// Set only for comparison fixtures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonCheck>,
    pub passed: bool,
    pub actual_ids: Vec<ItemId>,
    /// Expected IDs absent from the results, in fixture order
    pub missing_ids: Vec<ItemId>,
    pub total_count: usize,
}

impl GradeReport {
    /// Names of the checks that failed, plus forbidden and order failures.
    #[must_use]
    pub fn failure_reasons(&self) -> Vec<String> {
        let mut reasons: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{} {:.3} < {:.3}", c.metric, c.value, c.threshold))
            .collect();
        if !self.forbidden_hits.is_empty() {
            let ids: Vec<&str> = self.forbidden_hits.iter().map(ItemId::as_str).collect();
            reasons.push(format!("forbidden ids returned: {}", ids.join(", ")));
        }
        if self.order_matched == Some(false) {
            reasons.push("expected ids out of order".to_owned());
        }
        if let Some(check) = self.comparison.as_ref().filter(|c| !c.passed) {
            reasons.push(format!(
                "overlap with {:?} {:.3} < {:.3}",
                check.term, check.overlap, check.minimum_overlap
            ));
        }
        reasons
    }
}

/// Grades result sets against expectations.
#[derive(Debug, Clone, Default)]
pub struct Grader {
    config: GraderConfig,
}

impl Grader {
    #[must_use]
    pub const fn new(config: GraderConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// Grade one result set.
    ///
    /// # Errors
    /// [`EvalError::SchemaViolation`] when the result set breaks its ordering
    /// contract, was produced for a different entity kind, or the expectation
    /// repeats IDs, uses an unknown tier, or needs comparison results.
    pub fn grade(&self, results: ResultSet, expected: &ExpectedResult) -> EvalResult<GradeReport> {
        self.grade_with(results, None, expected)
    }

    /// Grade a comparison fixture. `compared` answers the expectation's
    /// comparison term.
    ///
    /// # Errors
    /// As [`Grader::grade`], checked for both result sets, plus a
    /// `SchemaViolation` when the expectation has no comparison.
    pub fn grade_compared(
        &self,
        results: ResultSet,
        compared: ResultSet,
        expected: &ExpectedResult,
    ) -> EvalResult<GradeReport> {
        self.grade_with(results, Some(compared), expected)
    }

    fn grade_with(
        &self,
        results: ResultSet,
        compared: Option<ResultSet>,
        expected: &ExpectedResult,
    ) -> EvalResult<GradeReport> {
        check_results(&results, expected)?;
        if let Some(compared) = &compared {
            check_results(compared, expected)?;
        }
        expected.check().map_err(EvalError::SchemaViolation)?;
        let compared_ids: Option<Vec<ItemId>> = match (&expected.comparison, compared) {
            (Some(_), Some(compared)) => Some(compared.ids().cloned().collect()),
            (None, None) => None,
            (Some(comparison), None) => {
                return Err(EvalError::SchemaViolation(format!(
                    "no results for comparison term {:?}",
                    comparison.term
                )));
            }
            (None, Some(_)) => {
                return Err(EvalError::SchemaViolation(
                    "comparison results for an expectation without compare_with".to_owned(),
                ));
            }
        };

        let mut weights: HashMap<&ItemId, f64> = HashMap::with_capacity(expected.items.len());
        for item in &expected.items {
            let weight = self.config.weight_for(item.tier.as_deref()).ok_or_else(|| {
                EvalError::SchemaViolation(format!(
                    "expected id {} has unknown tier {:?}",
                    item.id,
                    item.tier.as_deref().unwrap_or_default()
                ))
            })?;
            weights.insert(&item.id, weight);
        }

        let thresholds = self.config.thresholds.merged(&expected.thresholds);
        let cutoffs: BTreeSet<usize> = self
            .config
            .cutoffs
            .iter()
            .chain(thresholds.precision_at.keys())
            .copied()
            .filter(|k| *k > 0)
            .collect();

        let (items, total_count) = results.into_items();
        let actual_ids: Vec<ItemId> = items.into_iter().map(|item| item.id).collect();
        let hits: Vec<bool> = actual_ids.iter().map(|id| weights.contains_key(id)).collect();

        let degenerate = expected.items.is_empty() && expected.comparison.is_none();
        let metrics = if expected.items.is_empty() {
            Metrics::uniform(&cutoffs, 1.0)
        } else if actual_ids.is_empty() {
            Metrics::uniform(&cutoffs, 0.0)
        } else {
            let found = hits.iter().filter(|h| **h).count();
            let earned: f64 = actual_ids.iter().filter_map(|id| weights.get(id)).sum();
            let possible: f64 = weights.values().sum();
            Metrics {
                precision_at: cutoffs
                    .iter()
                    .map(|k| (*k, precision_at_k(&hits, *k)))
                    .collect(),
                recall: ratio(found, expected.items.len()),
                tier_weighted: if possible > 0.0 {
                    (earned / possible).min(1.0)
                } else {
                    0.0
                },
                reciprocal_rank: hits
                    .iter()
                    .position(|h| *h)
                    .map_or(0.0, |pos| 1.0 / rank_as_f64(pos + 1)),
            }
        };
        let Metrics {
            precision_at,
            recall,
            tier_weighted,
            reciprocal_rank,
        } = metrics;

        let mut checks: Vec<MetricCheck> = thresholds
            .precision_at
            .iter()
            .map(|(k, min)| {
                let value = precision_at.get(k).copied().unwrap_or_default();
                MetricCheck::new(format!("precision@{k}"), value, *min)
            })
            .collect();
        if let Some(min) = thresholds.recall {
            checks.push(MetricCheck::new("recall", recall, min));
        }
        if let Some(min) = thresholds.tier_weighted {
            checks.push(MetricCheck::new("tier_weighted", tier_weighted, min));
        }
        if let Some(min) = thresholds.reciprocal_rank {
            checks.push(MetricCheck::new("reciprocal_rank", reciprocal_rank, min));
        }

        let forbidden: HashSet<&ItemId> = expected.forbidden.iter().collect();
        let forbidden_hits: Vec<ItemId> = actual_ids
            .iter()
            .filter(|id| forbidden.contains(id))
            .cloned()
            .collect();

        let order_matched = expected.strict_order.then(|| {
            expected.items.len() <= actual_ids.len()
                && expected
                    .relevant_ids()
                    .zip(&actual_ids)
                    .all(|(want, got)| want == got)
        });

        let returned: HashSet<&ItemId> = actual_ids.iter().collect();
        let missing_ids: Vec<ItemId> = expected
            .relevant_ids()
            .filter(|id| !returned.contains(id))
            .cloned()
            .collect();

        let comparison = expected
            .comparison
            .as_ref()
            .zip(compared_ids)
            .map(|(c, ids)| ComparisonCheck::new(c, expected.strict_order, &actual_ids, ids));

        let passed = checks.iter().all(|c| c.passed)
            && forbidden_hits.is_empty()
            && order_matched != Some(false)
            && comparison.as_ref().is_none_or(|c| c.passed);

        debug!(
            entity = %expected.entity,
            term = %expected.term,
            recall,
            tier_weighted,
            reciprocal_rank,
            degenerate,
            passed,
            "graded query"
        );

        Ok(GradeReport {
            precision_at,
            recall,
            tier_weighted,
            reciprocal_rank,
            degenerate,
            checks,
            forbidden_hits,
            order_matched,
            comparison,
            passed,
            actual_ids,
            missing_ids,
            total_count,
        })
    }
}

/// Reject result sets that break their contract or answer another entity.
fn check_results(results: &ResultSet, expected: &ExpectedResult) -> EvalResult<()> {
    results
        .validate()
        .map_err(|e| EvalError::SchemaViolation(e.to_string()))?;
    if results.query().entity() != expected.entity {
        return Err(EvalError::SchemaViolation(format!(
            "{} results graded against a {} expectation",
            results.query().entity(),
            expected.entity
        )));
    }
    Ok(())
}

/// Share of IDs two rankings agree on, over the longer ranking. Two empty
/// rankings agree completely.
fn ranking_overlap(ids: &[ItemId], other: &[ItemId], strict_order: bool) -> f64 {
    let longest = ids.len().max(other.len());
    if longest == 0 {
        return 1.0;
    }
    let shared = if strict_order {
        ids.iter().zip(other).filter(|(a, b)| a == b).count()
    } else {
        let other: HashSet<&ItemId> = other.iter().collect();
        ids.iter().filter(|id| other.contains(id)).count()
    };
    ratio(shared, longest)
}

struct Metrics {
    precision_at: BTreeMap<usize, f64>,
    recall: f64,
    tier_weighted: f64,
    reciprocal_rank: f64,
}

impl Metrics {
    fn uniform(cutoffs: &BTreeSet<usize>, value: f64) -> Self {
        Self {
            precision_at: cutoffs.iter().map(|k| (*k, value)).collect(),
            recall: value,
            tier_weighted: value,
            reciprocal_rank: value,
        }
    }
}

fn precision_at_k(hits: &[bool], k: usize) -> f64 {
    let relevant = hits.iter().take(k).filter(|h| **h).count();
    ratio(relevant, k)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[allow(clippy::cast_precision_loss)]
fn rank_as_f64(rank: usize) -> f64 {
    rank as f64
}
