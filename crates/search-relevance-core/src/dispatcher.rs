//! Query dispatch: engine resolution, validation, timeout, and retry.
//!
//! The [`Dispatcher`] is the only place retry policy lives. For every query it:
//! 1. validates the term and pagination bounds (`InvalidQuery`, never retried)
//! 2. resolves the engine from the query override or the entity's configured default
//! 3. calls the adapter under the entity's deadline (`Timeout`, never retried)
//! 4. retries `EngineUnavailable` with exponential backoff, then reports
//!    `ServiceDegraded` once the retries are spent
//!
//! The returned [`ResultSet`] is passed through unchanged; nothing is re-ranked.
//! A page that answers a different query, or holds more items than were
//! asked for, is a `SchemaViolation` for that query alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::engine::{EngineAdapter, EngineRegistry};
use crate::error::{SearchError, SearchResult};
use crate::query::Query;
use crate::results::ResultSet;

/// Routes queries to registered engines under the configured policy.
///
/// Clones share the per-engine count of running adapter calls.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: EngineRegistry,
    config: SearchConfig,
    pending: Arc<PendingCalls>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: EngineRegistry, config: SearchConfig) -> Self {
        Self {
            registry,
            config,
            pending: Arc::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Name of the engine that would serve `query`.
    #[must_use]
    pub fn engine_name_for(&self, query: &Query) -> String {
        query.engine().map_or_else(
            || self.config.entity(query.entity()).engine,
            ToOwned::to_owned,
        )
    }

    /// Execute one query.
    ///
    /// # Errors
    /// `InvalidQuery`, `UnknownEngine`, `Timeout`, `ServiceDegraded`,
    /// `SchemaViolation` for a page that does not answer `query`, or any other
    /// adapter error passed through unchanged.
    pub fn search(&self, query: Query) -> SearchResult<ResultSet> {
        let settings = self.config.entity(query.entity());
        query.validate(settings.max_page_size)?;

        let engine_name = self.engine_name_for(&query);
        let adapter = self.registry.resolve(query.entity(), &engine_name)?;
        let query = Arc::new(query);

        let policy = self.config.retry;
        let started = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            debug!(
                engine = %engine_name,
                entity = %query.entity(),
                term = query.term(),
                attempt = attempts,
                "dispatching query"
            );
            let outcome = self
                .pending
                .acquire(&engine_name, self.config.max_pending_calls)
                .and_then(|slot| call_with_deadline(&adapter, &query, settings.timeout, slot));
            match outcome {
                Ok(results) => {
                    if results.query() != &*query {
                        return Err(SearchError::SchemaViolation(format!(
                            "engine {engine_name} answered {} {:?} for {} {:?}",
                            results.query().entity(),
                            results.query().term(),
                            query.entity(),
                            query.term()
                        )));
                    }
                    if results.len() > query.page_size() {
                        return Err(SearchError::SchemaViolation(format!(
                            "engine {engine_name} returned {} items for a page of {}",
                            results.len(),
                            query.page_size()
                        )));
                    }
                    info!(
                        engine = %engine_name,
                        entity = %query.entity(),
                        returned = results.len(),
                        total = results.total_count(),
                        attempts,
                        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "query completed"
                    );
                    return Ok(results);
                }
                Err(err) if err.is_retryable() => {
                    if attempts > policy.max_retries {
                        warn!(
                            engine = %engine_name,
                            attempts,
                            error = %err,
                            "engine still unavailable, giving up"
                        );
                        return Err(SearchError::ServiceDegraded {
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                    let backoff = policy.backoff(attempts);
                    warn!(
                        engine = %engine_name,
                        attempt = attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "engine unavailable, retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(err) => {
                    warn!(
                        engine = %engine_name,
                        error_type = err.error_type(),
                        error = %err,
                        "query failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Running adapter calls per engine name.
#[derive(Debug, Default)]
struct PendingCalls(Mutex<HashMap<String, Arc<AtomicUsize>>>);

impl PendingCalls {
    /// Reserve a call slot on `engine`, or report the engine unavailable once
    /// `limit` calls are already running. A zero limit never refuses.
    fn acquire(&self, engine: &str, limit: usize) -> SearchResult<CallSlot> {
        let counter = {
            let mut counters = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(counters.entry(engine.to_owned()).or_default())
        };
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (limit == 0 || running < limit).then_some(running + 1)
            })
            .map_err(|running| {
                SearchError::EngineUnavailable(format!(
                    "engine {engine} still has {running} calls running"
                ))
            })?;
        Ok(CallSlot(counter))
    }
}

/// Releases its engine's call slot when dropped.
struct CallSlot(Arc<AtomicUsize>);

impl Drop for CallSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run one adapter call, abandoning it once `deadline` elapses.
///
/// A zero deadline calls the adapter inline. Otherwise the call runs on a
/// helper thread; a call that outlives the deadline keeps running detached
/// and its eventual result is dropped. `slot` is held until the adapter
/// returns, so abandoned calls still count against the engine's cap.
fn call_with_deadline(
    adapter: &Arc<dyn EngineAdapter>,
    query: &Arc<Query>,
    deadline: Duration,
    slot: CallSlot,
) -> SearchResult<ResultSet> {
    if deadline.is_zero() {
        let result = adapter.search(query);
        drop(slot);
        return result;
    }

    let (tx, rx) = mpsc::sync_channel(1);
    let worker_adapter = Arc::clone(adapter);
    let worker_query = Arc::clone(query);
    thread::Builder::new()
        .name(format!("search-{}", adapter.name()))
        .spawn(move || {
            let result = worker_adapter.search(&worker_query);
            drop(slot);
            let _ = tx.send(result);
        })
        .map_err(|e| SearchError::EngineUnavailable(format!("spawn adapter call: {e}")))?;

    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(SearchError::Timeout(deadline)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(SearchError::EngineUnavailable(
            format!("engine {} terminated without a response", adapter.name()),
        )),
    }
}
