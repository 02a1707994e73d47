#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-store-core** – Core storage abstractions for kgents.
//!
//! This crate provides the fundamental storage types and traits used
//! throughout the kgents ecosystem: the [`Datum`] record, the [`Query`]
//! filter, and the [`DatumStore`] contract that every tier of the
//! projection lattice implements.
//!
//! Storage drivers (memory, jsonl, SQLite, Postgres) implement these traits
//! in separate crates that depend on this core abstraction.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

mod datum;
mod query;

pub use datum::Datum;
pub use query::Query;

//─────────────────────────────
//  Projection lattice tiers
//─────────────────────────────

/// A tier in the projection lattice, ordered from fastest-ephemeral to
/// most-durable.
///
/// Lower [`priority`](Tier::priority) numbers are preferred when several
/// tiers are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-process map. Fastest, lost on exit.
    Memory,
    /// Append-only JSON-lines file.
    Jsonl,
    /// Single-file relational store.
    Sqlite,
    /// Remote relational server.
    Postgres,
}

impl Tier {
    /// Selection priority; lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            Tier::Memory => 100,
            Tier::Jsonl => 50,
            Tier::Sqlite => 50,
            Tier::Postgres => 10,
        }
    }

    /// Whether data in this tier survives a process restart.
    pub fn is_persistent(self) -> bool {
        !matches!(self, Tier::Memory)
    }

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Jsonl => "jsonl",
            Tier::Sqlite => "sqlite",
            Tier::Postgres => "postgres",
        }
    }

    /// Parse a tier name, case-insensitively.
    pub fn parse(name: &str) -> Option<Tier> {
        match name.to_ascii_lowercase().as_str() {
            "memory" => Some(Tier::Memory),
            "jsonl" => Some(Tier::Jsonl),
            "sqlite" => Some(Tier::Sqlite),
            "postgres" => Some(Tier::Postgres),
            _ => None,
        }
    }

    /// All tiers, fastest first.
    pub fn all() -> [Tier; 4] {
        [Tier::Memory, Tier::Jsonl, Tier::Sqlite, Tier::Postgres]
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during storage operations.
///
/// Not-found is never an error: `get` returns `None`, `delete` returns
/// `false`, and `causal_chain` returns an empty chain.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend I/O failed (disk, database, connection).
    #[error("{backend}: storage operation failed: {message}")]
    Storage {
        /// Name of the backend that failed.
        backend: &'static str,
        /// Driver-level failure description.
        message: String,
    },
    /// A stored payload could not be deserialized.
    #[error("{backend}: corrupt payload: {reason}")]
    Corruption {
        /// Name of the backend holding the payload.
        backend: &'static str,
        /// What failed to decode.
        reason: String,
    },
    /// The backend cannot currently serve requests.
    #[error("{backend}: unavailable: {reason}")]
    Unavailable {
        /// Name of the unavailable backend.
        backend: &'static str,
        /// Probe failure description.
        reason: String,
    },
    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// A consumer-initiated operation violated configuration or policy.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

//─────────────────────────────
//  Store statistics
//─────────────────────────────

/// Aggregate size report produced by [`DatumStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of live datums.
    pub total_datums: u64,
    /// Bytes consumed by the underlying medium, when the backend can tell.
    pub size_bytes: u64,
}

//─────────────────────────────
//  Storage trait
//─────────────────────────────

/// Uniform contract implemented by every tier of the projection lattice.
///
/// All operations may suspend on I/O. Implementations must make `put`
/// idempotent on id (a second put with the same id overwrites) and must
/// return `list` results newest first.
#[async_trait]
pub trait DatumStore: Send + Sync {
    /// Store a datum, returning its id.
    async fn put(&self, datum: &Datum) -> Result<String, StoreError>;

    /// Fetch a datum by id. `None` if unknown.
    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError>;

    /// Remove a datum. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// List datums, newest first.
    ///
    /// `prefix` filters on id prefix, `after` on strict `created_at`
    /// recency, and `limit` truncates the result.
    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError>;

    /// Causal ancestry of a datum, ordered root first and including the
    /// datum itself last.
    ///
    /// Returns an empty chain for an unknown id; stops at the first
    /// missing ancestor.
    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError>;

    /// Whether a datum with this id exists.
    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Number of live datums.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Run a declarative [`Query`].
    ///
    /// The default implementation fetches via [`list`](DatumStore::list)
    /// and filters in process; backends with a native query language
    /// override this and push the filters down.
    async fn query(&self, query: &Query) -> Result<Vec<Datum>, StoreError> {
        let fetched = self
            .list(query.prefix.as_deref(), query.after, usize::MAX)
            .await?;
        Ok(query.apply(fetched))
    }

    /// Fast availability probe. Must not error.
    async fn is_available(&self) -> bool {
        true
    }

    /// Aggregate size report.
    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            total_datums: self.count().await?,
            size_bytes: 0,
        })
    }

    /// Canonical backend name, used in errors and status reports.
    fn name(&self) -> &'static str;
}

//─────────────────────────────
//  Clock
//─────────────────────────────

/// Wall-clock timestamps with a monotonic nudge.
pub mod clock {
    use std::sync::Mutex;

    use chrono::Utc;

    static LAST: Mutex<f64> = Mutex::new(0.0);

    /// Seconds since the Unix epoch.
    ///
    /// Successive calls never return the same value: when the wall clock
    /// has not advanced past the previous reading, the result is nudged
    /// forward by one microsecond so that creation order stays observable
    /// in `created_at` ordering.
    pub fn now() -> f64 {
        let wall = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let mut last = LAST.lock().unwrap_or_else(|e| e.into_inner());
        let next = if wall > *last { wall } else { *last + 1e-6 };
        *last = next;
        next
    }
}

//─────────────────────────────
//  Data directory
//─────────────────────────────

/// Filesystem root for the local persistent tiers.
///
/// Defaults to `${HOME}/.kgents/data`; falls back to a relative path when
/// no home directory can be resolved (containers, stripped environments).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kgents")
        .join("data")
}

/// Free-form string metadata attached to datums and events.
pub type Metadata = HashMap<String, String>;

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{clock, Datum, DatumStore, Metadata, Query, StoreError, StoreStats, Tier};
}
