//! Relevance evaluation over pluggable search engines
//!
//! Builds on [`search_relevance_core`] to grade engines against curated
//! ground truth:
//! - [`Fixture`] / [`ExpectedResult`]: curated queries and the IDs they should find
//! - [`Grader`]: precision@k, recall, tier-weighted score, reciprocal rank,
//!   and overlap between two terms' rankings
//! - [`RelevanceRunner`]: bounded-concurrency runs with deterministic reports
//! - [`RunReport`]: counts, means, per-category breakdown, failure detail

#![forbid(unsafe_code)]

pub mod error;
pub mod fixture;
pub mod grader;
pub mod report;
pub mod runner;

pub use error::{EvalError, EvalResult};
pub use fixture::{
    Comparison, ExpectedItem, ExpectedResult, Fixture, FixtureFormat, ThresholdOverrides,
    load_fixture_file, load_fixtures, parse_fixtures,
};
pub use grader::{ComparisonCheck, GradeReport, Grader, GraderConfig, MetricCheck, Thresholds};
pub use report::{CategorySummary, FailureDetail, MetricMeans, RunReport, run_id};
pub use runner::{FailureReason, Outcome, QueryOutcome, RelevanceRunner, RunnerConfig};
