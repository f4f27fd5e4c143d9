//! Search results model
//!
//! [`ResultSet`] is the output of an engine adapter. Each entry is a
//! [`ResultItem`] with a 1-based rank and an engine-defined score. A result
//! set can only be built through [`ResultSet::from_ranked`], which enforces
//! the ordering contract callers rely on:
//! - ranks are contiguous from 1 within the page
//! - scores are finite and non-increasing with rank
//! - identifiers are unique
//! - the total match count covers at least the items returned

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{SearchError, SearchResult};
use crate::query::Query;

/// Opaque item identifier. Integer IDs are normalised to their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawItemId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawItemId::deserialize(deserializer)? {
            RawItemId::Text(s) => Self(s),
            RawItemId::Signed(n) => Self(n.to_string()),
            RawItemId::Unsigned(n) => Self(n.to_string()),
        })
    }
}

/// A single search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultItem {
    /// Item identifier, unique within the result set
    pub id: ItemId,
    /// 1-based position within the page
    pub rank: usize,
    /// Relevance score (higher is better, engine-specific scale)
    pub score: f64,
}

/// Pagination metadata exposed to the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero-based page index
    pub page: usize,
    pub page_size: usize,
    /// Total number of matches across all pages
    pub total_results: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

/// An ordered page of search hits produced by one query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    query: Query,
    items: Vec<ResultItem>,
    total_count: usize,
}

impl ResultSet {
    /// Build a result set from hits already ordered best-first.
    ///
    /// Ranks are assigned from 1 in the order given.
    ///
    /// # Errors
    /// Returns [`SearchError::SchemaViolation`] if scores are not finite or
    /// increase with rank, an identifier repeats, more items are returned
    /// than the page holds, or `total_count` is smaller than the page.
    pub fn from_ranked(
        query: Query,
        hits: Vec<(ItemId, f64)>,
        total_count: usize,
    ) -> SearchResult<Self> {
        let items = hits
            .into_iter()
            .enumerate()
            .map(|(idx, (id, score))| ResultItem {
                id,
                rank: idx + 1,
                score,
            })
            .collect();
        let set = Self {
            query,
            items,
            total_count,
        };
        set.validate()?;
        Ok(set)
    }

    /// An empty page with no matches
    #[must_use]
    pub const fn empty(query: Query) -> Self {
        Self {
            query,
            items: Vec::new(),
            total_count: 0,
        }
    }

    /// Re-check every structural invariant.
    pub fn validate(&self) -> SearchResult<()> {
        if self.items.len() > self.query.page_size() {
            return Err(SearchError::SchemaViolation(format!(
                "{} items returned for a page of {}",
                self.items.len(),
                self.query.page_size()
            )));
        }
        if self.total_count < self.items.len() {
            return Err(SearchError::SchemaViolation(format!(
                "total_count {} is smaller than the {} items returned",
                self.total_count,
                self.items.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.items.len());
        let mut previous: Option<f64> = None;
        for (idx, item) in self.items.iter().enumerate() {
            if item.rank != idx + 1 {
                return Err(SearchError::SchemaViolation(format!(
                    "rank {} at position {} (ranks must be contiguous from 1)",
                    item.rank,
                    idx + 1
                )));
            }
            if !item.score.is_finite() {
                return Err(SearchError::SchemaViolation(format!(
                    "non-finite score for {}",
                    item.id
                )));
            }
            if let Some(prev) = previous
                && item.score > prev
            {
                return Err(SearchError::SchemaViolation(format!(
                    "score {} at rank {} exceeds score {prev} at rank {}",
                    item.score, item.rank, idx
                )));
            }
            if !seen.insert(&item.id) {
                return Err(SearchError::SchemaViolation(format!(
                    "duplicate id {}",
                    item.id
                )));
            }
            previous = Some(item.score);
        }
        Ok(())
    }

    /// The query that produced this page
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    #[must_use]
    pub fn items(&self) -> &[ResultItem] {
        &self.items
    }

    /// Total matches across all pages
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.total_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Identifiers in rank order
    pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
        self.items.iter().map(|item| &item.id)
    }

    /// Consume the set, keeping the ranked items and the total match count.
    #[must_use]
    pub fn into_items(self) -> (Vec<ResultItem>, usize) {
        (self.items, self.total_count)
    }

    /// Page position relative to the full match count
    #[must_use]
    pub const fn pagination(&self) -> Pagination {
        let page_size = self.query.page_size();
        let page = self.query.page();
        let total_pages = if page_size == 0 {
            0
        } else {
            self.total_count.div_ceil(page_size)
        };
        Pagination {
            page,
            page_size,
            total_results: self.total_count,
            total_pages,
            has_next: page.saturating_add(1) < total_pages,
            has_previous: page > 0,
        }
    }
}
