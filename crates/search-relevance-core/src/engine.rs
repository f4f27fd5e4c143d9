//! Engine adapter trait and registry
//!
//! [`EngineAdapter`] is the single seam to a real search backend. Adapters are
//! stateless with respect to queries: the only side effect a call may have is
//! the remote request itself. Retry and timeout policy live in the
//! [`Dispatcher`](crate::dispatcher::Dispatcher), never in an adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{SearchError, SearchResult};
use crate::query::{EntityKind, Query};
use crate::results::ResultSet;

/// The capability every search backend implements.
///
/// Implementations:
/// - [`JsonlEngine`](crate::jsonl_engine::JsonlEngine) (in-memory substring search)
/// - anything wrapping a remote engine behind the same contract
pub trait EngineAdapter: Send + Sync {
    /// Short stable name used for registration and reports.
    fn name(&self) -> &str;

    /// Execute a query and return one ranked page.
    ///
    /// The returned set's `total_count` must count every match, not just the
    /// page, even when the page is partial.
    ///
    /// # Errors
    /// - [`SearchError::InvalidQuery`] for an empty term or bad page bounds
    /// - [`SearchError::EngineUnavailable`] when the backend cannot be reached
    /// - [`SearchError::Timeout`] when the backend gave up on the request
    fn search(&self, query: &Query) -> SearchResult<ResultSet>;
}

/// Named adapters keyed by entity kind.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<EntityKind, BTreeMap<String, Arc<dyn EngineAdapter>>>,
}

impl EngineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for one entity kind under its own name.
    ///
    /// A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, entity: EntityKind, adapter: Arc<dyn EngineAdapter>) {
        let name = adapter.name().to_owned();
        if self
            .engines
            .entry(entity)
            .or_default()
            .insert(name.clone(), adapter)
            .is_some()
        {
            tracing::warn!(%entity, engine = %name, "replaced previously registered engine");
        }
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, entity: EntityKind, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.register(entity, adapter);
        self
    }

    /// Look up an adapter by entity kind and name.
    pub fn resolve(&self, entity: EntityKind, name: &str) -> SearchResult<Arc<dyn EngineAdapter>> {
        self.engines
            .get(&entity)
            .and_then(|by_name| by_name.get(name))
            .cloned()
            .ok_or_else(|| SearchError::UnknownEngine {
                entity: entity.plural().to_owned(),
                name: name.to_owned(),
            })
    }

    /// Names registered for an entity kind, sorted.
    #[must_use]
    pub fn names(&self, entity: EntityKind) -> Vec<&str> {
        self.engines
            .get(&entity)
            .map(|by_name| by_name.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.values().all(BTreeMap::is_empty)
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (entity, by_name) in &self.engines {
            map.entry(entity, &by_name.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}
