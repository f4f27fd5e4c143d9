//! Pluggable search engine adapters and query dispatch
//!
//! This crate defines the engine-abstraction layer of the relevance harness:
//! - [`EngineAdapter`]: the capability every search backend implements
//! - [`EngineRegistry`]: named adapters keyed by [`EntityKind`]
//! - [`Dispatcher`]: validation, engine selection, deadline, and retry policy
//! - [`Query`] / [`ResultSet`] / [`ResultItem`]: query and ranked-page models
//! - [`JsonlEngine`]: in-memory substring engine over JSON Lines data

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod jsonl_engine;
pub mod query;
pub mod results;

// Re-export key types
pub use config::{EntitySettings, RetryPolicy, SearchConfig, env_value};
pub use dispatcher::Dispatcher;
pub use engine::{EngineAdapter, EngineRegistry};
pub use error::{SearchError, SearchResult};
pub use jsonl_engine::{JSONL_ENGINE_NAME, JsonlEngine, SPLIT_TOKEN};
pub use query::{DEFAULT_PAGE_SIZE, EntityKind, Query};
pub use results::{ItemId, Pagination, ResultItem, ResultSet};
