//! Fixture-driven relevance runs
//!
//! [`RelevanceRunner::run`] issues one query per fixture through the
//! [`Dispatcher`] on a bounded pool of scoped worker threads, then grades and
//! aggregates on the calling thread in fixture order. Worker completion order
//! never reaches the report.
//!
//! Only fixture problems abort a run, and they abort it before any query is
//! issued. A query that fails to dispatch is recorded as a failed outcome.
//! Comparison fixtures issue their second query on the same worker, with the
//! same page size and engine, once the first query has succeeded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use search_relevance_core::config::{env_value, parse_value};
use search_relevance_core::{Dispatcher, EntityKind, ItemId, Query, ResultSet, SearchError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::EvalResult;
use crate::fixture::{Fixture, load_fixtures};
use crate::grader::{GradeReport, Grader};
use crate::report::{RunReport, run_id};

/// Default number of queries in flight.
pub const DEFAULT_CONCURRENCY: usize = 8;
/// Default page size for fixtures that do not set `depth`.
pub const DEFAULT_DEPTH: usize = 20;

/// Runner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerConfig {
    /// Worker threads dispatching queries
    pub concurrency: usize,
    /// Page size used when a fixture has no `depth`
    pub default_depth: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_depth: DEFAULT_DEPTH,
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Keys: `RELEVANCE_CONCURRENCY`, `RELEVANCE_DEPTH`. Zero is ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            concurrency: parse_value(&lookup, "RELEVANCE_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            default_depth: parse_value(&lookup, "RELEVANCE_DEPTH")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.default_depth),
        }
    }
}

/// Why a query produced no grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureReason {
    InvalidQuery,
    EngineUnavailable,
    Timeout,
    ServiceDegraded,
    UnknownEngine,
    SchemaViolation,
    EngineError,
}

impl FailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidQuery => "InvalidQuery",
            Self::EngineUnavailable => "EngineUnavailable",
            Self::Timeout => "Timeout",
            Self::ServiceDegraded => "ServiceDegraded",
            Self::UnknownEngine => "UnknownEngine",
            Self::SchemaViolation => "SchemaViolation",
            Self::EngineError => "EngineError",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SearchError> for FailureReason {
    fn from(err: &SearchError) -> Self {
        match err {
            SearchError::InvalidQuery(_) => Self::InvalidQuery,
            SearchError::EngineUnavailable(_) => Self::EngineUnavailable,
            SearchError::Timeout(_) => Self::Timeout,
            SearchError::ServiceDegraded { .. } => Self::ServiceDegraded,
            SearchError::UnknownEngine { .. } => Self::UnknownEngine,
            SearchError::SchemaViolation(_) => Self::SchemaViolation,
            SearchError::Io(_) | SearchError::Serialization(_) => Self::EngineError,
        }
    }
}

/// What happened to one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The engine answered and the page was graded
    Graded(GradeReport),
    /// The query never produced a page
    Failed {
        reason: FailureReason,
        message: String,
    },
}

/// Per-query entry of a run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub index: usize,
    pub term: String,
    pub entity: EntityKind,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub engine: String,
    /// Page size the query was issued with
    pub depth: usize,
    pub passed: bool,
    pub elapsed_ms: u64,
    pub expected_ids: Vec<ItemId>,
    pub result: Outcome,
}

impl QueryOutcome {
    #[must_use]
    pub const fn grade(&self) -> Option<&GradeReport> {
        match &self.result {
            Outcome::Graded(grade) => Some(grade),
            Outcome::Failed { .. } => None,
        }
    }

    /// Failure reason for a query that never produced a page.
    #[must_use]
    pub const fn failure_reason(&self) -> Option<FailureReason> {
        match &self.result {
            Outcome::Graded(_) => None,
            Outcome::Failed { reason, .. } => Some(*reason),
        }
    }

    /// IDs the engine returned, empty when the query failed.
    #[must_use]
    pub fn actual_ids(&self) -> &[ItemId] {
        self.grade()
            .map(|g| g.actual_ids.as_slice())
            .unwrap_or_default()
    }
}

/// A query result as it comes back from a worker.
struct Dispatched {
    engine: String,
    depth: usize,
    elapsed: Duration,
    /// The fixture's page, plus the comparison page for comparison fixtures
    result: Result<(ResultSet, Option<ResultSet>), SearchError>,
}

/// Drives fixtures through a dispatcher and grades the answers.
#[derive(Debug, Clone)]
pub struct RelevanceRunner {
    dispatcher: Dispatcher,
    grader: Grader,
    config: RunnerConfig,
}

impl RelevanceRunner {
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, grader: Grader, config: RunnerConfig) -> Self {
        Self {
            dispatcher,
            grader,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Load fixture files and run them.
    ///
    /// # Errors
    /// [`EvalError::MalformedFixture`](crate::EvalError::MalformedFixture)
    /// before any query is issued, or a grader `SchemaViolation`.
    pub fn run_paths(&self, paths: &[PathBuf]) -> EvalResult<RunReport> {
        let fixtures = load_fixtures(paths)?;
        self.run(&fixtures)
    }

    /// Run already-loaded fixtures.
    ///
    /// # Errors
    /// `MalformedFixture` for a tier without a configured weight (checked
    /// before any query is issued), or a grader `SchemaViolation`.
    pub fn run(&self, fixtures: &[Fixture]) -> EvalResult<RunReport> {
        let tier_weights = &self.grader.config().tier_weights;
        for fixture in fixtures {
            fixture.check_tiers(tier_weights)?;
        }

        let started_at = Utc::now();
        info!(
            fixtures = fixtures.len(),
            concurrency = self.config.concurrency,
            "starting relevance run"
        );

        let dispatched = self.dispatch_all(fixtures);

        let mut outcomes = Vec::with_capacity(fixtures.len());
        for (fixture, query) in fixtures.iter().zip(dispatched) {
            outcomes.push(self.reduce(fixture, query)?);
        }

        let mut engines: Vec<String> = outcomes.iter().map(|o| o.engine.clone()).collect();
        engines.sort();
        engines.dedup();
        let report = RunReport::build(
            run_id(fixtures, &engines)?,
            started_at,
            Utc::now(),
            outcomes,
        );
        info!(
            run_id = %report.run_id,
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            errored = report.errored,
            "relevance run finished"
        );
        Ok(report)
    }

    /// Dispatch every fixture on at most `concurrency` workers.
    ///
    /// Results come back in fixture order.
    fn dispatch_all(&self, fixtures: &[Fixture]) -> Vec<Dispatched> {
        let workers = self.config.concurrency.max(1).min(fixtures.len());
        if workers == 0 {
            return Vec::new();
        }

        let next = AtomicUsize::new(0);
        let mut completed: Vec<(usize, Dispatched)> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        let mut done = Vec::new();
                        loop {
                            let slot = next.fetch_add(1, Ordering::Relaxed);
                            let Some(fixture) = fixtures.get(slot) else {
                                break;
                            };
                            done.push((slot, self.dispatch(fixture)));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        completed.sort_by_key(|(slot, _)| *slot);
        completed.into_iter().map(|(_, d)| d).collect()
    }

    fn dispatch(&self, fixture: &Fixture) -> Dispatched {
        let depth = fixture.depth.unwrap_or(self.config.default_depth);
        let query_for = |term: &str| {
            let query = Query::new(fixture.entity(), term).with_page_size(depth);
            match &fixture.engine {
                Some(engine) => query.with_engine(engine.clone()),
                None => query,
            }
        };
        let query = query_for(fixture.term());
        let engine = self.dispatcher.engine_name_for(&query);
        let started = Instant::now();
        let result = self.dispatcher.search(query).and_then(|results| {
            let compared = fixture
                .expected
                .comparison
                .as_ref()
                .map(|comparison| {
                    debug!(
                        index = fixture.index,
                        compare_with = %comparison.term,
                        "dispatching comparison query"
                    );
                    self.dispatcher.search(query_for(&comparison.term))
                })
                .transpose()?;
            Ok((results, compared))
        });
        Dispatched {
            engine,
            depth,
            elapsed: started.elapsed(),
            result,
        }
    }

    fn reduce(&self, fixture: &Fixture, dispatched: Dispatched) -> EvalResult<QueryOutcome> {
        let result = match dispatched.result {
            Ok((results, None)) => Outcome::Graded(self.grader.grade(results, &fixture.expected)?),
            Ok((results, Some(compared))) => Outcome::Graded(self.grader.grade_compared(
                results,
                compared,
                &fixture.expected,
            )?),
            Err(err) => {
                let reason = FailureReason::from(&err);
                warn!(
                    index = fixture.index,
                    term = fixture.term(),
                    engine = %dispatched.engine,
                    %reason,
                    error = %err,
                    "query failed"
                );
                Outcome::Failed {
                    reason,
                    message: err.to_string(),
                }
            }
        };
        let passed = matches!(&result, Outcome::Graded(grade) if grade.passed);
        debug!(index = fixture.index, term = fixture.term(), passed, "query outcome");
        Ok(QueryOutcome {
            index: fixture.index,
            term: fixture.term().to_owned(),
            entity: fixture.entity(),
            category: fixture.category.clone(),
            description: fixture.description.clone(),
            engine: dispatched.engine,
            depth: dispatched.depth,
            passed,
            elapsed_ms: u64::try_from(dispatched.elapsed.as_millis()).unwrap_or(u64::MAX),
            expected_ids: fixture.expected.relevant_ids().cloned().collect(),
            result,
        })
    }
}
