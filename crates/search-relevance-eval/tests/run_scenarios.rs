//! End-to-end relevance runs against scripted engines.
//!
//! Covers the run-level guarantees:
//! - a timed-out or degraded query is recorded and the run still completes
//! - malformed fixtures abort before any query is issued
//! - reports are identical regardless of worker count
//! - the worker pool never exceeds its bound
//! - an engine answering the wrong query fails only that query
//! - comparison fixtures grade the overlap of two terms' rankings

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use search_relevance_core::config::{EntitySettings, RetryPolicy, SearchConfig};
use search_relevance_core::{
    Dispatcher, EngineAdapter, EngineRegistry, EntityKind, ItemId, JsonlEngine, Query,
    ResultSet, SearchError, SearchResult,
};
use search_relevance_eval::{
    EvalError, FailureReason, FixtureFormat, Grader, GraderConfig, RelevanceRunner,
    RunnerConfig, parse_fixtures,
};
use serde_json::json;

// ═══════════════════════════════════════════════════════════════════════
// Scripted engine
// ═══════════════════════════════════════════════════════════════════════

/// Interprets the query term as a script, one word at a time:
/// - `slow`: sleep 300ms before answering
/// - `sleep=N`: sleep N ms before answering
/// - `down`: fail with `EngineUnavailable`
/// - `mislabel`: answer as if the query were for labels
/// - anything else: an ID to return, in order
#[derive(Default)]
struct ScriptedEngine {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedEngine {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(query: &Query) -> SearchResult<ResultSet> {
        let mut answering = query.clone();
        let mut ids = Vec::new();
        for word in query.term().split_whitespace() {
            if word == "slow" {
                thread::sleep(Duration::from_millis(300));
            } else if word == "down" {
                return Err(SearchError::EngineUnavailable("connection refused".into()));
            } else if word == "mislabel" {
                answering = Query::new(EntityKind::Label, query.term());
            } else if let Some(ms) = word.strip_prefix("sleep=") {
                thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
            } else {
                ids.push(ItemId::from(word));
            }
        }
        let total = ids.len();
        let ranked = ids
            .into_iter()
            .take(query.page_size())
            .enumerate()
            .map(|(i, id)| (id, 100.0 - i as f64))
            .collect();
        ResultSet::from_ranked(answering, ranked, total)
    }
}

impl EngineAdapter for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn search(&self, query: &Query) -> SearchResult<ResultSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = Self::answer(query);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn runner(engine: &Arc<ScriptedEngine>, timeout: Duration, concurrency: usize) -> RelevanceRunner {
    let mut registry = EngineRegistry::new();
    let mut config = SearchConfig::default().with_retry(RetryPolicy {
        max_retries: 1,
        base_backoff: Duration::from_millis(2),
    });
    for kind in EntityKind::ALL {
        registry.register(kind, Arc::clone(engine) as Arc<dyn EngineAdapter>);
        config = config.with_entity(
            kind,
            EntitySettings {
                engine: "scripted".to_owned(),
                timeout,
                max_page_size: 100,
            },
        );
    }
    RelevanceRunner::new(
        Dispatcher::new(registry, config),
        Grader::new(GraderConfig::default()),
        RunnerConfig {
            concurrency,
            default_depth: 10,
        },
    )
}

fn comparison_line(term: &str, compare_with: &str, minimum_overlap: f64) -> String {
    json!({
        "term": term,
        "compare_with": compare_with,
        "entity_type": "passages",
        "minimum_overlap": minimum_overlap,
        "category": "duplicates",
    })
    .to_string()
}

fn fixture_line(term: &str, expected: &[&str], category: &str) -> String {
    json!({
        "term": term,
        "entity_type": "passages",
        "expected": expected,
        "category": category,
    })
    .to_string()
}

// ═══════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn timeout_is_recorded_and_run_completes() {
    let engine = Arc::new(ScriptedEngine::default());
    let text = [
        fixture_line("p1 p2", &["p1"], "basic"),
        fixture_line("slow p3", &["p3"], "basic"),
        fixture_line("p4 p5", &["p5"], "synonyms"),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::from_millis(50), 4)
        .run(&fixtures)
        .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.passed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errored, 1);
    assert_eq!(report.queries[1].failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(report.failures[0].reasons, vec!["Timeout".to_owned()]);
    assert!(report.queries[0].passed);
    assert!(report.queries[2].passed);
    // the timed-out query is not retried
    assert_eq!(engine.calls(), 3);
}

#[test]
fn degraded_engine_is_recorded_per_query() {
    let engine = Arc::new(ScriptedEngine::default());
    let text = [
        fixture_line("down", &["p1"], "outage"),
        fixture_line("p1", &["p1"], "basic"),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::ZERO, 2).run(&fixtures).unwrap();

    assert_eq!(
        report.queries[0].failure_reason(),
        Some(FailureReason::ServiceDegraded)
    );
    assert!(report.queries[1].passed);
    // one retry for the unavailable engine
    assert_eq!(engine.calls(), 3);
}

#[test]
fn malformed_fixture_aborts_before_any_query() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("a_good.jsonl");
    fs::write(&good, fixture_line("p1", &["p1"], "basic")).unwrap();
    let bad = dir.path().join("b_bad.jsonl");
    fs::write(
        &bad,
        format!("{}\n{{\"term\": \"p2\", \"entity_type\": ", fixture_line("p2", &["p2"], "basic")),
    )
    .unwrap();

    let engine = Arc::new(ScriptedEngine::default());
    let err = runner(&engine, Duration::ZERO, 4)
        .run_paths(&[dir.path().to_path_buf()])
        .unwrap_err();

    match err {
        EvalError::MalformedFixture {
            source_name,
            location,
            ..
        } => {
            assert!(source_name.ends_with("b_bad.jsonl"));
            assert_eq!(location, "line 2");
        }
        other => panic!("expected MalformedFixture, got {other:?}"),
    }
    assert_eq!(engine.calls(), 0);
}

#[test]
fn unknown_tier_aborts_before_any_query() {
    let text = [
        fixture_line("p1", &["p1"], "basic"),
        json!({"term": "p2", "entity_type": "passages", "expected": [{"id": "p2", "tier": "gold"}]})
            .to_string(),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();
    let engine = Arc::new(ScriptedEngine::default());

    let err = runner(&engine, Duration::ZERO, 4).run(&fixtures).unwrap_err();

    assert_eq!(err.error_type(), "MALFORMED_FIXTURE");
    assert_eq!(engine.calls(), 0);
}

#[test]
fn report_order_is_independent_of_concurrency() {
    let lines: Vec<String> = (0..24)
        .map(|i| {
            let delay = (24 - i) % 7;
            let term = format!("sleep={delay} x{i} y{i}");
            let expected = if i % 3 == 0 {
                vec![format!("missing{i}")]
            } else {
                vec![format!("y{i}")]
            };
            let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
            fixture_line(&term, &expected, if i % 2 == 0 { "even" } else { "odd" })
        })
        .collect();
    let fixtures =
        parse_fixtures("inline.jsonl", &lines.join("\n"), FixtureFormat::JsonLines, 0).unwrap();

    let serial = runner(&Arc::new(ScriptedEngine::default()), Duration::ZERO, 1)
        .run(&fixtures)
        .unwrap();
    let parallel = runner(&Arc::new(ScriptedEngine::default()), Duration::ZERO, 8)
        .run(&fixtures)
        .unwrap();

    assert_eq!(serial.run_id, parallel.run_id);
    assert_eq!(serial.categories, parallel.categories);
    assert_eq!(serial.means, parallel.means);
    let order: Vec<usize> = parallel.queries.iter().map(|q| q.index).collect();
    assert_eq!(order, (0..24).collect::<Vec<_>>());
    for (a, b) in serial.queries.iter().zip(&parallel.queries) {
        assert_eq!(a.term, b.term);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.grade(), b.grade());
    }
    assert_eq!(parallel.passed, 16);
}

#[test]
fn worker_pool_respects_bound() {
    let engine = Arc::new(ScriptedEngine::default());
    let text: Vec<String> = (0..12)
        .map(|i| fixture_line(&format!("sleep=20 p{i}"), &[format!("p{i}").as_str()], "basic"))
        .collect();
    let fixtures =
        parse_fixtures("inline.jsonl", &text.join("\n"), FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::ZERO, 3).run(&fixtures).unwrap();

    assert_eq!(report.passed, 12);
    assert_eq!(engine.calls(), 12);
    let peak = engine.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak in flight {peak}");
}

#[test]
fn fixture_depth_and_engine_override_reach_the_query() {
    let engine = Arc::new(ScriptedEngine::default());
    let text = [
        json!({"term": "a b c d", "entity_type": "passages", "expected": ["d"], "depth": 2})
            .to_string(),
        json!({"term": "a", "entity_type": "passages", "expected": ["a"], "engine": "vespa"})
            .to_string(),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::ZERO, 2).run(&fixtures).unwrap();

    let shallow = report.queries[0].grade().unwrap();
    assert_eq!(shallow.actual_ids.len(), 2);
    assert_eq!(shallow.total_count, 4);
    assert_eq!(shallow.missing_ids, vec![ItemId::from("d")]);
    assert_eq!(report.queries[0].depth, 2);

    assert_eq!(report.queries[1].engine, "vespa");
    assert_eq!(
        report.queries[1].failure_reason(),
        Some(FailureReason::UnknownEngine)
    );
}

#[test]
fn jsonl_engine_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("labels.jsonl");
    fs::write(
        &data,
        [
            json!({"id": "L1", "preferred_label": "Flood", "alternative_labels": ["Inundation"], "description": "Water covering land"}),
            json!({"id": "L2", "preferred_label": "Drought", "alternative_labels": [], "description": "Lack of water"}),
            json!({"id": "L3", "preferred_label": "Flood defence", "alternative_labels": ["Levee"], "description": null}),
        ]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n"),
    )
    .unwrap();
    let fixtures_path = dir.path().join("labels.json");
    fs::write(
        &fixtures_path,
        json!([
            {"term": "flood", "entity_type": "label", "expected": [{"id": "L1", "tier": "highly_relevant"}, "L3"], "category": "Exact Match"},
            {"term": "water", "entity_type": "labels", "expected": ["L1", "L2"], "forbidden": ["L3"], "strict_order": true},
        ])
        .to_string(),
    )
    .unwrap();

    let engine = JsonlEngine::from_path(EntityKind::Label, &data).unwrap();
    let registry = EngineRegistry::new().with(EntityKind::Label, Arc::new(engine));
    let runner = RelevanceRunner::new(
        Dispatcher::new(registry, SearchConfig::default()),
        Grader::default(),
        RunnerConfig::default(),
    );

    let report = runner.run_paths(&[fixtures_path]).unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.passed, 2, "{report}");
    assert_eq!(report.queries[0].category, "exact_match");
    assert_eq!(report.queries[1].category, "uncategorized");
    assert_eq!(report.run_id.len(), 8);

    let out = dir.path().join("report.json");
    report.write_json(&out).unwrap();
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(out).unwrap()).unwrap();
    assert_eq!(json["categories"][0]["category"], "overall");
    assert_eq!(json["categories"][0]["pass_rate"], 1.0);
}

#[test]
fn wrong_answer_from_engine_fails_only_that_query() {
    let engine = Arc::new(ScriptedEngine::default());
    let text = [
        fixture_line("p1 p2", &["p1"], "basic"),
        fixture_line("mislabel p3", &["p3"], "basic"),
        fixture_line("p4", &["p4"], "basic"),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::ZERO, 3).run(&fixtures).unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.passed, 2);
    assert_eq!(report.errored, 1);
    assert_eq!(
        report.queries[1].failure_reason(),
        Some(FailureReason::SchemaViolation)
    );
    assert!(report.queries[0].passed);
    assert!(report.queries[2].passed);
    // a wrong answer is not retried
    assert_eq!(engine.calls(), 3);
}

#[test]
fn comparison_fixtures_grade_ranking_overlap() {
    let engine = Arc::new(ScriptedEngine::default());
    let text = [
        comparison_line("a b c d e", "a b c x y", 0.6),
        comparison_line("a b c d e", "a b c x y", 0.8),
        comparison_line("a b", "down", 0.5),
        fixture_line("f", &["f"], "basic"),
    ]
    .join("\n");
    let fixtures = parse_fixtures("inline.jsonl", &text, FixtureFormat::JsonLines, 0).unwrap();

    let report = runner(&engine, Duration::ZERO, 2).run(&fixtures).unwrap();

    let close = report.queries[0].grade().unwrap();
    let check = close.comparison.as_ref().unwrap();
    assert!((check.overlap - 0.6).abs() < 1e-9);
    assert_eq!(check.compared_ids.len(), 5);
    assert!(report.queries[0].passed);

    assert!(!report.queries[1].passed);
    assert_eq!(
        report.failures[0].reasons,
        vec!["overlap with \"a b c x y\" 0.600 < 0.800".to_owned()]
    );

    assert_eq!(
        report.queries[2].failure_reason(),
        Some(FailureReason::ServiceDegraded)
    );
    assert!(report.queries[3].passed);
    assert_eq!(report.degenerate, 0);
    let duplicates = report
        .categories
        .iter()
        .find(|c| c.category == "duplicates")
        .unwrap();
    assert_eq!((duplicates.passed, duplicates.total), (1, 3));
    // two queries per comparison fixture, plus a retry for the one that is down
    assert_eq!(engine.calls(), 2 + 2 + 3 + 1);
}
