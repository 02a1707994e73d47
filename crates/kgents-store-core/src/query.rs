//! Declarative filters over stored datums.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Datum, Metadata};

/// A declarative, AND-combined filter over datums.
///
/// Backends with a native query language push whatever clauses they can
/// into it; the rest is applied post-fetch via [`matches`](Query::matches).
/// Results are always ordered by `created_at` descending, with `offset`
/// skipped before `limit` is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Required tag tokens; matched as subset containment against the
    /// comma-joined `tags` metadata entry.
    pub tags: Vec<String>,
    /// Exact match on the `author` metadata entry.
    pub author: Option<String>,
    /// Exact match on the `source` metadata entry.
    pub source: Option<String>,
    /// Strictly newer than this timestamp.
    pub after: Option<f64>,
    /// Strictly older than this timestamp.
    pub before: Option<f64>,
    /// Id prefix.
    pub prefix: Option<String>,
    /// Maximum results, applied after `offset`.
    pub limit: Option<usize>,
    /// Results skipped before `limit` is applied.
    pub offset: usize,
    /// Arbitrary metadata-key equality constraints, AND-combined.
    pub where_eq: Metadata,
}

impl Query {
    /// An empty query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every one of the given tags.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Require an exact `author` metadata entry.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Require an exact `source` metadata entry.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Keep only datums strictly newer than the timestamp.
    pub fn with_after(mut self, after: f64) -> Self {
        self.after = Some(after);
        self
    }

    /// Keep only datums strictly older than the timestamp.
    pub fn with_before(mut self, before: f64) -> Self {
        self.before = Some(before);
        self
    }

    /// Keep only ids starting with the prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` results.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Require `metadata[key] == value`.
    pub fn where_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.where_eq.insert(key.into(), value.into());
        self
    }

    /// Whether a datum satisfies every non-empty clause.
    pub fn matches(&self, datum: &Datum) -> bool {
        if let Some(prefix) = &self.prefix {
            if !datum.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.after {
            if datum.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if datum.created_at >= before {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if datum.metadata.get("author") != Some(author) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if datum.metadata.get("source") != Some(source) {
                return false;
            }
        }
        for (key, expected) in &self.where_eq {
            if datum.metadata.get(key) != Some(expected) {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let Some(joined) = datum.metadata.get("tags") else {
                return false;
            };
            let present: HashSet<&str> = joined.split(',').map(str::trim).collect();
            if !self.tags.iter().all(|t| present.contains(t.as_str())) {
                return false;
            }
        }
        true
    }

    /// Filter, order newest first, then apply `offset` and `limit`.
    pub fn apply(&self, datums: Vec<Datum>) -> Vec<Datum> {
        let mut matched: Vec<Datum> = datums.into_iter().filter(|d| self.matches(d)).collect();
        matched.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
