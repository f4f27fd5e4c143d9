//! Relevance fixtures
//!
//! A fixture is one curated query with the IDs a good engine should return.
//! Fixture files come in two shapes:
//! - `.json`: a JSON array of fixture objects
//! - `.jsonl`: one fixture object per line (blank lines skipped)
//!
//! ```json
//! {"term": "flood defence", "entity_type": "labels",
//!  "expected": [{"id": "L12", "tier": "highly_relevant"}, "L7"],
//!  "forbidden": ["L99"], "thresholds": {"recall": 0.5, "precision_at": {"5": 0.2}},
//!  "category": "synonyms", "depth": 20}
//! ```
//!
//! A fixture may also name a second term whose results must agree with its
//! own. `expected` is optional for such fixtures:
//!
//! ```json
//! {"term": "solar power", "compare_with": "solar powered", "entity_type": "passages",
//!  "minimum_overlap": 0.8, "depth": 50, "category": "duplicates"}
//! ```
//!
//! Every structural problem is a [`EvalError::MalformedFixture`] naming the
//! file and the line or record it came from. Loading is all-or-nothing.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use search_relevance_core::{EntityKind, ItemId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EvalError, EvalResult};

/// Tier name for the strongest matches.
pub const HIGHLY_RELEVANT: &str = "highly_relevant";
/// Tier name for ordinary matches.
pub const RELEVANT: &str = "relevant";
/// Category assigned to fixtures that do not name one.
pub const UNCATEGORIZED: &str = "uncategorized";
/// Overlap a comparison fixture requires when it does not set one.
pub const DEFAULT_MINIMUM_OVERLAP: f64 = 1.0;

/// One relevant ID, optionally graded into a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedItem {
    pub id: ItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl ExpectedItem {
    #[must_use]
    pub fn untiered(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            tier: None,
        }
    }

    #[must_use]
    pub fn tiered(id: impl Into<ItemId>, tier: impl AsRef<str>) -> Self {
        Self {
            id: id.into(),
            tier: Some(normalize_name(tier.as_ref())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpectedItem {
    Bare(ItemId),
    Detailed {
        id: ItemId,
        #[serde(default)]
        tier: Option<String>,
    },
}

impl<'de> Deserialize<'de> for ExpectedItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawExpectedItem::deserialize(deserializer)? {
            RawExpectedItem::Bare(id) => Self::untiered(id),
            RawExpectedItem::Detailed { id, tier: None } => Self::untiered(id),
            RawExpectedItem::Detailed { id, tier: Some(t) } => Self::tiered(id, t),
        })
    }
}

/// Per-fixture threshold overrides. Unset fields keep the configured value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdOverrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub precision_at: BTreeMap<usize, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_weighted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reciprocal_rank: Option<f64>,
}

impl ThresholdOverrides {
    /// Check every threshold is a fraction and every cutoff is positive.
    ///
    /// # Errors
    /// Returns a description of the first offending value.
    pub fn check(&self) -> Result<(), String> {
        for (k, value) in &self.precision_at {
            if *k == 0 {
                return Err("precision cutoff must be at least 1".to_owned());
            }
            check_fraction(&format!("precision_at.{k}"), *value)?;
        }
        for (name, value) in [
            ("recall", self.recall),
            ("tier_weighted", self.tier_weighted),
            ("reciprocal_rank", self.reciprocal_rank),
        ] {
            if let Some(value) = value {
                check_fraction(name, value)?;
            }
        }
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("threshold {name} = {value} is outside [0, 1]"))
    }
}

/// A second query whose results must agree with the fixture's own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub term: String,
    /// Smallest acceptable share of IDs the two rankings have in common
    pub minimum_overlap: f64,
}

/// The ground truth a result set is graded against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpectedResult {
    pub term: String,
    pub entity: EntityKind,
    /// Relevant IDs in the order a strict-order check expects them.
    pub items: Vec<ExpectedItem>,
    /// IDs that must not appear anywhere in the results.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub forbidden: Vec<ItemId>,
    pub strict_order: bool,
    #[serde(skip_serializing_if = "is_default_overrides")]
    pub thresholds: ThresholdOverrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

fn is_default_overrides(t: &ThresholdOverrides) -> bool {
    *t == ThresholdOverrides::default()
}

impl ExpectedResult {
    #[must_use]
    pub fn new(
        entity: EntityKind,
        term: impl Into<String>,
        items: impl IntoIterator<Item = ExpectedItem>,
    ) -> Self {
        Self {
            term: term.into(),
            entity,
            items: items.into_iter().collect(),
            forbidden: Vec::new(),
            strict_order: false,
            thresholds: ThresholdOverrides::default(),
            comparison: None,
        }
    }

    #[must_use]
    pub fn with_forbidden(mut self, forbidden: impl IntoIterator<Item = ItemId>) -> Self {
        self.forbidden = forbidden.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_strict_order(mut self, strict: bool) -> Self {
        self.strict_order = strict;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: ThresholdOverrides) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Require the results for `term` to share at least `minimum_overlap`
    /// of their IDs with this expectation's results.
    #[must_use]
    pub fn with_comparison(mut self, term: impl Into<String>, minimum_overlap: f64) -> Self {
        self.comparison = Some(Comparison {
            term: term.into(),
            minimum_overlap,
        });
        self
    }

    /// Relevant IDs in fixture order.
    pub fn relevant_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.items.iter().map(|item| &item.id)
    }

    /// Structural checks shared by fixture loading and grading.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn check(&self) -> Result<(), String> {
        if self.term.trim().is_empty() {
            return Err("term is empty".to_owned());
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if !seen.insert(&item.id) {
                return Err(format!("expected id {} is listed twice", item.id));
            }
            if item.tier.as_deref().is_some_and(str::is_empty) {
                return Err(format!("expected id {} has a blank tier", item.id));
            }
        }
        let mut forbidden = HashSet::new();
        for id in &self.forbidden {
            if !forbidden.insert(id) {
                return Err(format!("forbidden id {id} is listed twice"));
            }
            if seen.contains(id) {
                return Err(format!("id {id} is both expected and forbidden"));
            }
        }
        if let Some(comparison) = &self.comparison {
            if comparison.term.trim().is_empty() {
                return Err("compare_with term is empty".to_owned());
            }
            check_fraction("minimum_overlap", comparison.minimum_overlap)?;
        }
        self.thresholds.check()
    }
}

/// A loaded, validated fixture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fixture {
    /// Position across every loaded file; fixes report order.
    pub index: usize,
    /// `source:location` the fixture was read from.
    pub origin: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Engine override for this fixture's query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Page size for this fixture's query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    pub expected: ExpectedResult,
}

impl Fixture {
    #[must_use]
    pub fn term(&self) -> &str {
        &self.expected.term
    }

    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        self.expected.entity
    }

    /// Reject tiers that have no configured weight.
    ///
    /// # Errors
    /// [`EvalError::MalformedFixture`] naming the first unknown tier.
    pub fn check_tiers(&self, tier_weights: &BTreeMap<String, f64>) -> EvalResult<()> {
        for item in &self.expected.items {
            if let Some(tier) = &item.tier
                && !tier_weights.contains_key(tier)
            {
                let known: Vec<&str> = tier_weights.keys().map(String::as_str).collect();
                let (source_name, location) = split_origin(&self.origin);
                return Err(EvalError::malformed(
                    source_name,
                    location,
                    format!(
                        "unknown tier {tier:?} for id {} (known: {})",
                        item.id,
                        known.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn split_origin(origin: &str) -> (&str, &str) {
    origin.rsplit_once(':').unwrap_or((origin, "<file>"))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFixture {
    term: String,
    entity_type: EntityKind,
    #[serde(default)]
    expected: Option<Vec<ExpectedItem>>,
    #[serde(default)]
    compare_with: Option<String>,
    #[serde(default)]
    minimum_overlap: Option<f64>,
    #[serde(default)]
    thresholds: Option<ThresholdOverrides>,
    #[serde(default)]
    forbidden: Vec<ItemId>,
    #[serde(default)]
    strict_order: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
}

impl RawFixture {
    fn into_fixture(self, index: usize, origin: String) -> Result<Fixture, String> {
        if self.depth == Some(0) {
            return Err("depth must be at least 1".to_owned());
        }
        if self.expected.is_none() && self.compare_with.is_none() {
            return Err("missing field `expected`".to_owned());
        }
        if self.minimum_overlap.is_some() && self.compare_with.is_none() {
            return Err("minimum_overlap requires compare_with".to_owned());
        }
        let comparison = self.compare_with.map(|term| Comparison {
            term: term.trim().to_owned(),
            minimum_overlap: self.minimum_overlap.unwrap_or(DEFAULT_MINIMUM_OVERLAP),
        });
        let expected = ExpectedResult {
            term: self.term.trim().to_owned(),
            entity: self.entity_type,
            items: self.expected.unwrap_or_default(),
            forbidden: self.forbidden,
            strict_order: self.strict_order,
            thresholds: self.thresholds.unwrap_or_default(),
            comparison,
        };
        expected.check()?;
        Ok(Fixture {
            index,
            origin,
            category: self
                .category
                .as_deref()
                .map(normalize_name)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| UNCATEGORIZED.to_owned()),
            description: self.description.filter(|d| !d.trim().is_empty()),
            engine: self
                .engine
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty()),
            depth: self.depth,
            expected,
        })
    }
}

/// Lowercase, trim, and replace spaces and hyphens with underscores.
#[must_use]
pub fn normalize_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// How a fixture file is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureFormat {
    /// A single JSON array
    JsonArray,
    /// One JSON object per line
    JsonLines,
}

impl FixtureFormat {
    /// `.jsonl` is JSON Lines; everything else is read as a JSON array.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("jsonl") => Self::JsonLines,
            _ => Self::JsonArray,
        }
    }
}

/// Parse fixtures from in-memory text. Indices start at `first_index`.
///
/// # Errors
/// [`EvalError::MalformedFixture`] for the first bad line or record.
pub fn parse_fixtures(
    source_name: &str,
    contents: &str,
    format: FixtureFormat,
    first_index: usize,
) -> EvalResult<Vec<Fixture>> {
    let records: Vec<(String, Value)> = match format {
        FixtureFormat::JsonLines => contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                let location = format!("line {}", n + 1);
                serde_json::from_str::<Value>(line)
                    .map(|value| (location.clone(), value))
                    .map_err(|e| EvalError::malformed(source_name, location, e.to_string()))
            })
            .collect::<EvalResult<_>>()?,
        FixtureFormat::JsonArray => {
            let values: Vec<Value> = serde_json::from_str(contents).map_err(|e| {
                EvalError::malformed(
                    source_name,
                    format!("line {}, column {}", e.line(), e.column()),
                    e.to_string(),
                )
            })?;
            values
                .into_iter()
                .enumerate()
                .map(|(i, value)| (format!("record {}", i + 1), value))
                .collect()
        }
    };

    records
        .into_iter()
        .enumerate()
        .map(|(offset, (location, value))| {
            let raw: RawFixture = serde_json::from_value(value)
                .map_err(|e| EvalError::malformed(source_name, &location, e.to_string()))?;
            let origin = format!("{source_name}:{location}");
            raw.into_fixture(first_index + offset, origin)
                .map_err(|reason| EvalError::malformed(source_name, location, reason))
        })
        .collect()
}

/// Load one fixture file.
///
/// # Errors
/// [`EvalError::MalformedFixture`] if the file cannot be read or parsed.
pub fn load_fixture_file(path: &Path, first_index: usize) -> EvalResult<Vec<Fixture>> {
    let source_name = path.display().to_string();
    let contents = fs::read_to_string(path)
        .map_err(|e| EvalError::malformed(&source_name, "<file>", e.to_string()))?;
    let fixtures = parse_fixtures(
        &source_name,
        &contents,
        FixtureFormat::from_path(path),
        first_index,
    )?;
    debug!(path = %source_name, count = fixtures.len(), "parsed fixture file");
    Ok(fixtures)
}

fn is_fixture_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json") || e.eq_ignore_ascii_case("jsonl"))
}

/// Load fixtures from files and directories, in the order given.
///
/// Directories contribute their `.json` and `.jsonl` files sorted by name.
///
/// # Errors
/// The first [`EvalError::MalformedFixture`] encountered; nothing is
/// returned unless every file loads.
pub fn load_fixtures(paths: &[PathBuf]) -> EvalResult<Vec<Fixture>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && is_fixture_file(p))
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }

    let mut fixtures = Vec::new();
    for file in &files {
        let loaded = load_fixture_file(file, fixtures.len())?;
        fixtures.extend(loaded);
    }
    info!(files = files.len(), fixtures = fixtures.len(), "loaded fixtures");
    Ok(fixtures)
}
