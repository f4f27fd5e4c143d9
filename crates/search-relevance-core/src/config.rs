//! Dispatcher configuration
//!
//! Configuration is an explicit value handed to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) at construction. [`SearchConfig::from_env`]
//! reads environment variables first and falls back to a working-directory
//! `.env` file, so local runs and CI share one set of keys.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

use crate::query::EntityKind;

/// Engine name used for every entity kind unless configured otherwise.
pub const DEFAULT_ENGINE: &str = "jsonl";
/// Default per-query adapter deadline.
///
/// A call that outlives its deadline is abandoned, not cancelled: its helper
/// thread runs until the adapter returns. [`DEFAULT_MAX_PENDING_CALLS`] bounds
/// how many of those threads one engine can hold at once.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cap on adapter calls still running per engine, abandoned ones
/// included. Zero disables the cap.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 32;
/// Default page-size ceiling.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;
/// Default number of retries after an `EngineUnavailable`.
pub const DEFAULT_MAX_RETRIES: u32 = 1;
/// Default backoff before the first retry; doubles per further retry.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);

/// Environment variable for the global per-query timeout (milliseconds).
pub const TIMEOUT_MS_ENV: &str = "SEARCH_TIMEOUT_MS";
/// Environment variable for the page-size ceiling.
pub const MAX_PAGE_SIZE_ENV: &str = "SEARCH_MAX_PAGE_SIZE";
/// Environment variable for the retry count.
pub const RETRY_MAX_ENV: &str = "SEARCH_RETRY_MAX";
/// Environment variable for the base retry backoff (milliseconds).
pub const RETRY_BASE_MS_ENV: &str = "SEARCH_RETRY_BASE_MS";
/// Environment variable for the per-engine cap on running adapter calls.
pub const MAX_PENDING_CALLS_ENV: &str = "SEARCH_MAX_PENDING_CALLS";

/// Exponential backoff applied to `EngineUnavailable` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(serialize_with = "serialize_millis")]
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_RETRY_BASE,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    /// Sleep before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1_u32 << exponent)
    }
}

/// Per-entity engine selection and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySettings {
    /// Registered engine name serving this entity kind
    pub engine: String,
    /// Adapter deadline; zero disables it
    #[serde(serialize_with = "serialize_millis")]
    pub timeout: Duration,
    /// Largest accepted page size; zero disables the ceiling
    pub max_page_size: usize,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

/// Full dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchConfig {
    pub entities: BTreeMap<EntityKind, EntitySettings>,
    pub retry: RetryPolicy,
    /// Adapter calls allowed to run at once per engine; zero disables the cap
    pub max_pending_calls: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            entities: EntityKind::ALL
                .into_iter()
                .map(|kind| (kind, EntitySettings::default()))
                .collect(),
            retry: RetryPolicy::default(),
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
        }
    }
}

impl SearchConfig {
    /// Settings for one entity kind (defaults when not configured).
    #[must_use]
    pub fn entity(&self, kind: EntityKind) -> EntitySettings {
        self.entities.get(&kind).cloned().unwrap_or_default()
    }

    /// Override settings for one entity kind.
    #[must_use]
    pub fn with_entity(mut self, kind: EntityKind, settings: EntitySettings) -> Self {
        self.entities.insert(kind, settings);
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_max_pending_calls(mut self, max_pending_calls: usize) -> Self {
        self.max_pending_calls = max_pending_calls;
        self
    }

    /// Load from the process environment (with `.env` fallback).
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Load from an arbitrary key lookup.
    ///
    /// Keys: `SEARCH_TIMEOUT_MS`, `SEARCH_MAX_PAGE_SIZE`, `SEARCH_RETRY_MAX`,
    /// `SEARCH_RETRY_BASE_MS`, `SEARCH_MAX_PENDING_CALLS`, and per entity `SEARCH_<PLURAL>_ENGINE` /
    /// `SEARCH_<PLURAL>_TIMEOUT_MS`. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let global_timeout = parse_value::<u64>(&lookup, TIMEOUT_MS_ENV)
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis);
        let max_page_size =
            parse_value(&lookup, MAX_PAGE_SIZE_ENV).unwrap_or(DEFAULT_MAX_PAGE_SIZE);

        let entities = EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let upper = kind.plural().to_ascii_uppercase();
                let engine = lookup(&format!("SEARCH_{upper}_ENGINE"))
                    .map(|v| v.trim().to_owned())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| DEFAULT_ENGINE.to_owned());
                let timeout = parse_value::<u64>(&lookup, &format!("SEARCH_{upper}_TIMEOUT_MS"))
                    .map_or(global_timeout, Duration::from_millis);
                (
                    kind,
                    EntitySettings {
                        engine,
                        timeout,
                        max_page_size,
                    },
                )
            })
            .collect();

        let retry = RetryPolicy {
            max_retries: parse_value(&lookup, RETRY_MAX_ENV).unwrap_or(DEFAULT_MAX_RETRIES),
            base_backoff: parse_value::<u64>(&lookup, RETRY_BASE_MS_ENV)
                .map_or(DEFAULT_RETRY_BASE, Duration::from_millis),
        };

        Self {
            entities,
            retry,
            max_pending_calls: parse_value(&lookup, MAX_PENDING_CALLS_ENV)
                .unwrap_or(DEFAULT_MAX_PENDING_CALLS),
        }
    }
}

/// Parse a trimmed value for `key`, ignoring blanks and parse failures.
pub fn parse_value<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = trimmed, "ignoring unparseable config value");
            None
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// Helper functions for environment variable lookup

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| {
        fs::read_to_string(Path::new(".env"))
            .map(|contents| parse_dotenv_contents(&contents))
            .unwrap_or_default()
    })
}

/// Read a value from the real environment first, falling back to `.env`.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .or_else(|| dotenv_values().get(key).cloned())
}

/// Parse `KEY=value` lines, skipping comments and blanks.
///
/// Accepts an optional `export ` prefix and strips one layer of matching
/// single or double quotes around the value.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        map.insert(key.to_owned(), unquoted.to_owned());
    }
    map
}
