//! In-memory engine over JSON Lines data.
//!
//! Each line is one JSON object with an `id` (string or integer). The fields
//! that make an item findable depend on its entity kind and are joined into a
//! single lowercase string with [`SPLIT_TOKEN`] between them, so a term can
//! never match across two fields.
//!
//! Matching is a case-insensitive substring test on the whole term. The score
//! is the number of non-overlapping occurrences; equal scores keep load order.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::engine::EngineAdapter;
use crate::error::{SearchError, SearchResult};
use crate::query::{EntityKind, Query};
use crate::results::{ItemId, ResultSet};

/// Separator placed between searchable fields.
pub const SPLIT_TOKEN: &str = "<SPLIT>";

/// Registered name of [`JsonlEngine`].
pub const JSONL_ENGINE_NAME: &str = "jsonl";

/// Fields that feed the searchable string, in order.
#[must_use]
pub const fn searchable_fields(entity: EntityKind) -> &'static [&'static str] {
    match entity {
        EntityKind::Document => &["title", "description"],
        EntityKind::Passage => &["text"],
        EntityKind::Label => &["preferred_label", "alternative_labels", "description"],
    }
}

#[derive(Debug, Clone)]
struct IndexedItem {
    id: ItemId,
    searchable: String,
}

/// Substring search over items held in memory.
#[derive(Debug, Clone)]
pub struct JsonlEngine {
    entity: EntityKind,
    items: Vec<IndexedItem>,
}

impl JsonlEngine {
    /// Load a `.jsonl` file, skipping blank lines.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Serialization` for a line that is
    /// not JSON, `SchemaViolation` for an object without a usable `id`.
    pub fn from_path(entity: EntityKind, path: &Path) -> SearchResult<Self> {
        let contents = fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str::<Value>(line)?);
        }
        let engine = Self::from_records(entity, records)?;
        info!(
            entity = %entity,
            path = %path.display(),
            items = engine.len(),
            "loaded jsonl engine"
        );
        Ok(engine)
    }

    /// Build from already-parsed records.
    pub fn from_records(
        entity: EntityKind,
        records: impl IntoIterator<Item = Value>,
    ) -> SearchResult<Self> {
        let items = records
            .into_iter()
            .enumerate()
            .map(|(line, record)| {
                let id = extract_id(&record).ok_or_else(|| {
                    SearchError::SchemaViolation(format!(
                        "{entity} record {} has no string or integer id",
                        line + 1
                    ))
                })?;
                Ok(IndexedItem {
                    id,
                    searchable: build_searchable_string(entity, &record),
                })
            })
            .collect::<SearchResult<Vec<_>>>()?;
        Ok(Self { entity, items })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        self.entity
    }
}

impl EngineAdapter for JsonlEngine {
    fn name(&self) -> &str {
        JSONL_ENGINE_NAME
    }

    fn search(&self, query: &Query) -> SearchResult<ResultSet> {
        query.validate(0)?;
        if query.entity() != self.entity {
            return Err(SearchError::InvalidQuery(format!(
                "{} query sent to the {} engine",
                query.entity(),
                self.entity
            )));
        }

        let needle = query.term().to_lowercase();
        let mut matches: Vec<(usize, &IndexedItem)> = self
            .items
            .iter()
            .filter_map(|item| {
                let count = item.searchable.matches(needle.as_str()).count();
                (count > 0).then_some((count, item))
            })
            .collect();
        // stable: equal counts keep load order
        matches.sort_by(|a, b| b.0.cmp(&a.0));

        let total = matches.len();
        let page: Vec<(ItemId, f64)> = matches
            .into_iter()
            .skip(query.offset())
            .take(query.page_size())
            .map(|(count, item)| (item.id.clone(), count_to_score(count)))
            .collect();
        debug!(
            entity = %self.entity,
            term = query.term(),
            total,
            returned = page.len(),
            "jsonl search"
        );
        ResultSet::from_ranked(query.clone(), page, total)
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_to_score(count: usize) -> f64 {
    count as f64
}

fn extract_id(record: &Value) -> Option<ItemId> {
    match record.get("id")? {
        Value::String(s) if !s.trim().is_empty() => Some(ItemId::new(s.clone())),
        Value::Number(n) => Some(ItemId::new(n.to_string())),
        _ => None,
    }
}

/// Join the entity's searchable fields into one lowercase string.
///
/// Arrays of strings are sorted before joining; missing or null fields
/// contribute an empty component.
#[must_use]
pub fn build_searchable_string(entity: EntityKind, record: &Value) -> String {
    let separator = format!(" {SPLIT_TOKEN} ");
    let mut components: Vec<String> = Vec::new();
    for field in searchable_fields(entity) {
        match record.get(*field) {
            Some(Value::String(s)) => components.push(s.to_lowercase()),
            Some(Value::Array(values)) => {
                let mut parts: Vec<String> = values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect();
                parts.sort();
                components.extend(parts);
            }
            Some(Value::Null) | None => components.push(String::new()),
            Some(other) => components.push(other.to_string().to_lowercase()),
        }
    }
    components.join(&separator)
}
