//! Search query model
//!
//! [`Query`] is the input to [`EngineAdapter::search`](crate::engine::EngineAdapter::search).
//! It names the entity kind being searched, the raw term, the requested page,
//! and optionally which registered engine should serve it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SearchError, SearchResult};

/// Default number of results per page
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// The kind of item being searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[serde(alias = "documents")]
    Document,
    #[serde(alias = "passages")]
    Passage,
    #[serde(alias = "labels")]
    Label,
}

impl EntityKind {
    /// All entity kinds in canonical order.
    pub const ALL: [Self; 3] = [Self::Document, Self::Passage, Self::Label];

    /// Plural label used for endpoints, env keys, and data file stems.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Document => "documents",
            Self::Passage => "passages",
            Self::Label => "labels",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Passage => write!(f, "passage"),
            Self::Label => write!(f, "label"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = SearchError;

    fn from_str(s: &str) -> SearchResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "documents" => Ok(Self::Document),
            "passage" | "passages" => Ok(Self::Passage),
            "label" | "labels" => Ok(Self::Label),
            other => Err(SearchError::InvalidQuery(format!(
                "unknown entity kind {other:?} (expected document, passage, or label)"
            ))),
        }
    }
}

/// A search request. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    entity: EntityKind,
    term: String,
    page: usize,
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<String>,
}

impl Query {
    /// Create a query for the first page with the default page size
    #[must_use]
    pub fn new(entity: EntityKind, term: impl Into<String>) -> Self {
        Self {
            entity,
            term: term.into(),
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            engine: None,
        }
    }

    /// Select a zero-based page
    #[must_use]
    pub const fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    /// Set the number of results per page
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Route the query to a specific registered engine instead of the
    /// entity's configured default
    #[must_use]
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        self.entity
    }

    #[must_use]
    pub fn term(&self) -> &str {
        &self.term
    }

    #[must_use]
    pub const fn page(&self) -> usize {
        self.page
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Engine override, if any
    #[must_use]
    pub fn engine(&self) -> Option<&str> {
        self.engine.as_deref()
    }

    /// Index of the first item on the requested page
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.page.saturating_mul(self.page_size)
    }

    /// Check the term and pagination bounds.
    ///
    /// `max_page_size` of 0 means no ceiling.
    pub fn validate(&self, max_page_size: usize) -> SearchResult<()> {
        if self.term.trim().is_empty() {
            return Err(SearchError::InvalidQuery(
                "search term must not be empty".to_owned(),
            ));
        }
        if self.page_size == 0 {
            return Err(SearchError::InvalidQuery(
                "page_size must be greater than zero".to_owned(),
            ));
        }
        if max_page_size > 0 && self.page_size > max_page_size {
            return Err(SearchError::InvalidQuery(format!(
                "page_size {} exceeds the maximum of {max_page_size}",
                self.page_size
            )));
        }
        if self.page.checked_mul(self.page_size).is_none() {
            return Err(SearchError::InvalidQuery(format!(
                "page {} is out of range",
                self.page
            )));
        }
        Ok(())
    }
}
