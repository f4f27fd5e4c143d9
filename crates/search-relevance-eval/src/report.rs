//! Run reports
//!
//! [`RunReport::build`] is the single reducer over a run's query outcomes.
//! It is pure: the same outcomes always give the same report apart from the
//! timestamps. Three renderings are provided:
//! - [`RunReport::write_json`]: the whole report as pretty JSON
//! - [`RunReport::write_jsonl`]: one line per query outcome
//! - [`Display`](std::fmt::Display): a summary table for terminals and CI logs

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use search_relevance_core::{EntityKind, ItemId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::EvalResult;
use crate::fixture::{ExpectedResult, Fixture};
use crate::grader::GradeReport;
use crate::runner::QueryOutcome;

/// Characters a run id is drawn from; no `i`, `l`, `o`, `0`, or `1`.
pub const RUN_ID_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
/// Length of a run id.
pub const RUN_ID_LEN: usize = 8;
/// Category row covering every query.
pub const OVERALL: &str = "overall";

/// The parts of a fixture that identify a run. Where the fixture was loaded
/// from is left out.
#[derive(Serialize)]
struct FixtureContent<'a> {
    category: &'a str,
    description: Option<&'a str>,
    engine: Option<&'a str>,
    depth: Option<usize>,
    expected: &'a ExpectedResult,
}

impl<'a> From<&'a Fixture> for FixtureContent<'a> {
    fn from(fixture: &'a Fixture) -> Self {
        Self {
            category: &fixture.category,
            description: fixture.description.as_deref(),
            engine: fixture.engine.as_deref(),
            depth: fixture.depth,
            expected: &fixture.expected,
        }
    }
}

/// Deterministic id for a run over `fixtures` against `engines`.
///
/// Depends on fixture content and order, never on the paths the fixtures
/// were loaded from.
///
/// # Errors
/// Propagates fixture serialization failures.
pub fn run_id(fixtures: &[Fixture], engines: &[String]) -> EvalResult<String> {
    let mut hasher = Sha256::new();
    for engine in engines {
        hasher.update(engine.as_bytes());
        hasher.update(b"\n");
    }
    for fixture in fixtures {
        hasher.update(serde_json::to_vec(&FixtureContent::from(fixture))?);
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    Ok(digest
        .iter()
        .take(RUN_ID_LEN)
        .map(|b| char::from(RUN_ID_ALPHABET[usize::from(*b) % RUN_ID_ALPHABET.len()]))
        .collect())
}

/// Mean metric values over graded queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricMeans {
    /// Queries that produced a page (the denominator)
    pub graded: usize,
    pub precision_at: BTreeMap<usize, f64>,
    pub recall: f64,
    pub tier_weighted: f64,
    pub reciprocal_rank: f64,
}

/// Pass counts for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    /// `passed / total`, 0 when `total` is 0
    pub pass_rate: f64,
}

impl CategorySummary {
    fn new(category: impl Into<String>, passed: usize, total: usize) -> Self {
        Self {
            category: category.into(),
            passed,
            failed: total - passed,
            total,
            pass_rate: fraction(passed, total),
        }
    }
}

/// Diagnosis for one failing query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub index: usize,
    pub term: String,
    pub entity: EntityKind,
    pub category: String,
    pub engine: String,
    pub reasons: Vec<String>,
    pub expected_ids: Vec<ItemId>,
    pub actual_ids: Vec<ItemId>,
    pub missing_ids: Vec<ItemId>,
}

impl FailureDetail {
    fn from_outcome(outcome: &QueryOutcome) -> Self {
        let (reasons, missing_ids) = match (outcome.grade(), outcome.failure_reason()) {
            (Some(grade), _) => (grade.failure_reasons(), grade.missing_ids.clone()),
            (None, reason) => (
                reason.map(|r| r.to_string()).into_iter().collect(),
                outcome.expected_ids.clone(),
            ),
        };
        Self {
            index: outcome.index,
            term: outcome.term.clone(),
            entity: outcome.entity,
            category: outcome.category.clone(),
            engine: outcome.engine.clone(),
            reasons,
            expected_ids: outcome.expected_ids.clone(),
            actual_ids: outcome.actual_ids().to_vec(),
            missing_ids,
        }
    }
}

/// Everything a relevance run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    /// Includes `errored`
    pub failed: usize,
    /// Queries that never produced a page
    pub errored: usize,
    /// Queries whose fixture expected nothing
    pub degenerate: usize,
    pub means: MetricMeans,
    /// `overall` first, then categories by name
    pub categories: Vec<CategorySummary>,
    pub failures: Vec<FailureDetail>,
    /// Every query in fixture order
    pub queries: Vec<QueryOutcome>,
}

impl RunReport {
    /// Reduce outcomes (already in fixture order) into a report.
    #[must_use]
    pub fn build(
        run_id: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        queries: Vec<QueryOutcome>,
    ) -> Self {
        let total = queries.len();
        let passed = queries.iter().filter(|q| q.passed).count();
        let errored = queries.iter().filter(|q| q.grade().is_none()).count();
        let degenerate = queries
            .iter()
            .filter_map(QueryOutcome::grade)
            .filter(|g| g.degenerate)
            .count();

        let mut by_category: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for q in &queries {
            let entry = by_category.entry(q.category.as_str()).or_default();
            entry.0 += usize::from(q.passed);
            entry.1 += 1;
        }
        let categories = std::iter::once(CategorySummary::new(OVERALL, passed, total))
            .chain(
                by_category
                    .into_iter()
                    .map(|(name, (p, t))| CategorySummary::new(name, p, t)),
            )
            .collect();

        let failures = queries
            .iter()
            .filter(|q| !q.passed)
            .map(FailureDetail::from_outcome)
            .collect();

        Self {
            run_id,
            started_at,
            finished_at,
            total,
            passed,
            failed: total - passed,
            errored,
            degenerate,
            means: mean_metrics(&queries),
            categories,
            failures,
            queries,
        }
    }

    #[must_use]
    pub const fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Write the full report as pretty JSON, creating parent directories.
    ///
    /// # Errors
    /// I/O or serialization failures.
    pub fn write_json(&self, path: &Path) -> EvalResult<()> {
        let mut writer = create_writer(path)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!(path = %path.display(), "wrote run report");
        Ok(())
    }

    /// Write one JSON line per query outcome, creating parent directories.
    ///
    /// # Errors
    /// I/O or serialization failures.
    pub fn write_jsonl(&self, path: &Path) -> EvalResult<()> {
        let mut writer = create_writer(path)?;
        for query in &self.queries {
            serde_json::to_writer(&mut writer, query)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        info!(path = %path.display(), queries = self.queries.len(), "wrote query outcomes");
        Ok(())
    }
}

fn create_writer(path: &Path) -> EvalResult<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn mean_metrics(queries: &[QueryOutcome]) -> MetricMeans {
    let grades: Vec<&GradeReport> = queries.iter().filter_map(QueryOutcome::grade).collect();
    if grades.is_empty() {
        return MetricMeans::default();
    }

    let mut precision_sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for grade in &grades {
        for (k, p) in &grade.precision_at {
            let entry = precision_sums.entry(*k).or_default();
            entry.0 += p;
            entry.1 += 1;
        }
    }

    MetricMeans {
        graded: grades.len(),
        precision_at: precision_sums
            .into_iter()
            .map(|(k, (sum, count))| (k, sum / count_as_f64(count)))
            .collect(),
        recall: mean(&grades, |g| g.recall),
        tier_weighted: mean(&grades, |g| g.tier_weighted),
        reciprocal_rank: mean(&grades, |g| g.reciprocal_rank),
    }
}

fn mean(grades: &[&GradeReport], metric: impl Fn(&GradeReport) -> f64) -> f64 {
    grades.iter().map(|g| metric(g)).sum::<f64>() / count_as_f64(grades.len())
}

#[allow(clippy::cast_precision_loss)]
fn count_as_f64(n: usize) -> f64 {
    n as f64
}

fn fraction(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        count_as_f64(part) / count_as_f64(whole)
    }
}

fn join_ids(ids: &[ItemId]) -> String {
    if ids.is_empty() {
        return "-".to_owned();
    }
    ids.iter().map(ItemId::as_str).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Relevance run {}: {} queries, {} passed, {} failed ({} errored)",
            self.run_id, self.total, self.passed, self.failed, self.errored
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<32} {:>7} {:>7} {:>7} {:>10}",
            "category", "passed", "failed", "total", "pass rate"
        )?;
        for c in &self.categories {
            writeln!(
                f,
                "{:<32} {:>7} {:>7} {:>7} {:>9.1}%",
                c.category,
                c.passed,
                c.failed,
                c.total,
                c.pass_rate * 100.0
            )?;
        }

        writeln!(f)?;
        write!(f, "mean over {} graded:", self.means.graded)?;
        for (k, p) in &self.means.precision_at {
            write!(f, " p@{k}={p:.3}")?;
        }
        writeln!(
            f,
            " recall={:.3} tier={:.3} rr={:.3}",
            self.means.recall, self.means.tier_weighted, self.means.reciprocal_rank
        )?;

        if self.failures.is_empty() {
            return Ok(());
        }
        writeln!(f)?;
        writeln!(f, "Failures")?;
        let mut grouped: BTreeMap<&str, Vec<&FailureDetail>> = BTreeMap::new();
        for failure in &self.failures {
            grouped.entry(failure.category.as_str()).or_default().push(failure);
        }
        for (category, failures) in grouped {
            writeln!(f, "[{category}]")?;
            for d in failures {
                writeln!(
                    f,
                    "  #{} {} {:?} via {}: {}",
                    d.index,
                    d.entity,
                    d.term,
                    d.engine,
                    d.reasons.join("; ")
                )?;
                writeln!(f, "      expected: {}", join_ids(&d.expected_ids))?;
                writeln!(f, "      actual:   {}", join_ids(&d.actual_ids))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::MetricCheck;
    use crate::runner::{FailureReason, Outcome};

    fn grade(recall: f64, passed: bool, degenerate: bool) -> GradeReport {
        GradeReport {
            precision_at: BTreeMap::from([(5, recall / 2.0)]),
            recall,
            tier_weighted: recall,
            reciprocal_rank: recall,
            degenerate,
            checks: vec![MetricCheck {
                metric: "recall".into(),
                value: recall,
                threshold: 0.5,
                passed,
            }],
            forbidden_hits: Vec::new(),
            order_matched: None,
            comparison: None,
            passed,
            actual_ids: vec![ItemId::from("a")],
            missing_ids: Vec::new(),
            total_count: 1,
        }
    }

    fn outcome(index: usize, category: &str, result: Outcome) -> QueryOutcome {
        let passed = matches!(&result, Outcome::Graded(g) if g.passed);
        QueryOutcome {
            index,
            term: format!("term {index}"),
            entity: EntityKind::Passage,
            category: category.to_owned(),
            description: None,
            engine: "jsonl".to_owned(),
            depth: 20,
            passed,
            elapsed_ms: 3,
            expected_ids: vec![ItemId::from("a"), ItemId::from("b")],
            result,
        }
    }

    fn sample() -> RunReport {
        let now = Utc::now();
        RunReport::build(
            "abcd2345".to_owned(),
            now,
            now,
            vec![
                outcome(0, "acronym", Outcome::Graded(grade(1.0, true, false))),
                outcome(1, "acronym", Outcome::Graded(grade(0.0, false, false))),
                outcome(
                    2,
                    "punctuation",
                    Outcome::Failed {
                        reason: FailureReason::Timeout,
                        message: "Search timed out after 5000ms".into(),
                    },
                ),
                outcome(3, "uncategorized", Outcome::Graded(grade(1.0, true, true))),
            ],
        )
    }

    #[test]
    fn counts_and_categories() {
        let report = sample();
        assert_eq!(report.total, 4);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errored, 1);
        assert_eq!(report.degenerate, 1);
        assert!(report.has_failures());

        let names: Vec<&str> = report.categories.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, vec![OVERALL, "acronym", "punctuation", "uncategorized"]);
        let acronym = &report.categories[1];
        assert_eq!((acronym.passed, acronym.failed, acronym.total), (1, 1, 2));
        assert!((acronym.pass_rate - 0.5).abs() < 1e-9);
        assert!((report.categories[2].pass_rate).abs() < 1e-9);
    }

    #[test]
    fn means_cover_graded_queries_only() {
        let report = sample();
        assert_eq!(report.means.graded, 3);
        assert!((report.means.recall - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.means.precision_at[&5] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn failures_carry_diagnosis() {
        let report = sample();
        assert_eq!(report.failures.len(), 2);
        let timeout = &report.failures[1];
        assert_eq!(timeout.index, 2);
        assert_eq!(timeout.reasons, vec!["Timeout".to_owned()]);
        assert!(timeout.actual_ids.is_empty());
        assert_eq!(timeout.missing_ids.len(), 2);
        assert_eq!(report.failures[0].reasons[0], "recall 0.000 < 0.500");
    }

    #[test]
    fn empty_run() {
        let now = Utc::now();
        let report = RunReport::build("abcd2345".into(), now, now, Vec::new());
        assert_eq!(report.categories.len(), 1);
        assert!((report.categories[0].pass_rate).abs() < f64::EPSILON);
        assert_eq!(report.means, MetricMeans::default());
        assert!(!report.has_failures());
    }

    #[test]
    fn table_groups_failures_by_category() {
        let table = sample().to_string();
        assert!(table.starts_with("Relevance run abcd2345: 4 queries, 2 passed, 2 failed (1 errored)"));
        assert!(table.contains("[acronym]"));
        assert!(table.contains("[punctuation]"));
        assert!(table.contains("Timeout"));
        assert!(table.contains("expected: a, b"));
        assert!(table.contains("actual:   -"));
    }

    #[test]
    fn writes_json_and_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let report = sample();
        let json_path = dir.path().join("out/report.json");
        let jsonl_path = dir.path().join("out/queries.jsonl");
        report.write_json(&json_path).unwrap();
        report.write_jsonl(&jsonl_path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json["run_id"], "abcd2345");
        assert_eq!(json["queries"][2]["result"]["reason"], "Timeout");
        assert_eq!(json["queries"][0]["result"]["status"], "graded");
        assert_eq!(json["queries"][0]["result"]["precision_at"]["5"], 0.5);

        let lines = fs::read_to_string(&jsonl_path).unwrap();
        assert_eq!(lines.lines().count(), 4);
        for line in lines.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn run_id_is_stable_and_uses_alphabet() {
        let fixtures = crate::fixture::parse_fixtures(
            "f.jsonl",
            r#"{"term": "nz", "entity_type": "passages", "expected": ["p1"]}"#,
            crate::fixture::FixtureFormat::JsonLines,
            0,
        )
        .unwrap();
        let engines = vec!["jsonl".to_owned()];
        let a = run_id(&fixtures, &engines).unwrap();
        let b = run_id(&fixtures, &engines).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), RUN_ID_LEN);
        assert!(a.bytes().all(|c| RUN_ID_ALPHABET.contains(&c)));
        let other = run_id(&fixtures, &["vespa".to_owned()]).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn run_id_ignores_fixture_location() {
        let line = r#"{"term": "nz", "entity_type": "passages", "expected": ["p1"]}"#;
        let parse = |source: &str, contents: &str| {
            crate::fixture::parse_fixtures(
                source,
                contents,
                crate::fixture::FixtureFormat::JsonLines,
                0,
            )
            .unwrap()
        };
        let engines = vec!["jsonl".to_owned()];
        let here = run_id(&parse("fixtures/passages.jsonl", line), &engines).unwrap();
        let elsewhere = run_id(
            &parse("/srv/ci/checkout/fixtures/passages.jsonl", &format!("\n\n{line}")),
            &engines,
        )
        .unwrap();
        assert_eq!(here, elsewhere);

        let changed = run_id(
            &parse("fixtures/passages.jsonl", &line.replace("p1", "p2")),
            &engines,
        )
        .unwrap();
        assert_ne!(here, changed);
    }
}
