#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-store-jsonl** – Append-only JSON-lines storage driver for kgents.
//!
//! Tier 1 of the projection lattice: one JSON object per line in a
//! namespace-bound file, inspectable with any text editor. Writes append,
//! deletions append tombstones, and `compact` rewrites the file with only
//! the currently-active records.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use kgents_store_core::{default_data_dir, Datum, DatumStore, StoreError, StoreStats};

//─────────────────────────────
//  JSON-lines storage backend
//─────────────────────────────

/// An append-only JSON-lines datum store.
///
/// The file at `{data_dir}/{namespace}.jsonl` is read once on first
/// access to build an in-memory index; afterwards every operation works
/// against the index and appends at most one line. A single mutex guards
/// both the file and the index, so writes are serialized.
///
/// Tombstone lines have the form `{"id": "...", "_deleted": true}` and
/// mask earlier records; a later write with the same id reverses the
/// deletion. Malformed lines are skipped on load.
#[derive(Debug)]
pub struct JsonlStore {
    namespace: String,
    data_dir: PathBuf,
    path: PathBuf,
    state: Mutex<Index>,
}

#[derive(Debug, Default)]
struct Index {
    loaded: bool,
    active: HashMap<String, Datum>,
    deleted: HashSet<String>,
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Storage {
        backend: "jsonl",
        message: e.to_string(),
    }
}

impl JsonlStore {
    /// Creates a store for the given namespace.
    ///
    /// `data_dir` defaults to the kgents data directory; it is created on
    /// demand, not here.
    pub fn new(namespace: impl Into<String>, data_dir: Option<PathBuf>) -> Self {
        let namespace = namespace.into();
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let path = data_dir.join(format!("{namespace}.jsonl"));
        Self {
            namespace,
            data_dir,
            path,
            state: Mutex::new(Index::default()),
        }
    }

    /// The namespace this store is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Path of the backing file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Lock the index, loading it from disk on first access.
    async fn index(&self) -> Result<MutexGuard<'_, Index>, StoreError> {
        let mut guard = self.state.lock().await;
        if guard.loaded {
            return Ok(guard);
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                        debug!(namespace = %self.namespace, "skipping malformed log line");
                        continue;
                    };
                    if value.get("_deleted").and_then(|v| v.as_bool()) == Some(true) {
                        if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
                            guard.active.remove(id);
                            guard.deleted.insert(id.to_string());
                        }
                        continue;
                    }
                    match Datum::from_json(value) {
                        Ok(datum) => {
                            guard.deleted.remove(&datum.id);
                            guard.active.insert(datum.id.clone(), datum);
                        }
                        Err(_) => {
                            debug!(namespace = %self.namespace, "skipping malformed log line");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        guard.loaded = true;
        Ok(guard)
    }

    /// Append one line to the backing file, creating the directory and
    /// file on demand.
    async fn append_line(&self, line: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(io_err)?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.write_all(b"\n").await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Rewrite the file with only the currently-active records, then
    /// atomically rename over the original. Returns bytes saved.
    pub async fn compact(&self) -> Result<u64, StoreError> {
        let guard = self.index().await?;

        let original_size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e)),
        };

        let mut contents = String::new();
        for datum in guard.active.values() {
            contents.push_str(&datum.to_line()?);
            contents.push('\n');
        }

        let compact_path = self.path.with_extension("jsonl.compact");
        tokio::fs::write(&compact_path, contents)
            .await
            .map_err(io_err)?;
        tokio::fs::rename(&compact_path, &self.path)
            .await
            .map_err(io_err)?;

        let new_size = tokio::fs::metadata(&self.path).await.map_err(io_err)?.len();
        Ok(original_size.saturating_sub(new_size))
    }

    /// Drop the index and delete the backing file.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard.active.clear();
        guard.deleted.clear();
        guard.loaded = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[async_trait]
impl DatumStore for JsonlStore {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        let line = datum.to_line()?;
        let mut guard = self.index().await?;
        self.append_line(&line).await?;
        guard.deleted.remove(&datum.id);
        guard.active.insert(datum.id.clone(), datum.clone());
        Ok(datum.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        Ok(self.index().await?.active.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut guard = self.index().await?;
        if !guard.active.contains_key(id) {
            return Ok(false);
        }
        let tombstone = serde_json::json!({"id": id, "_deleted": true}).to_string();
        self.append_line(&tombstone).await?;
        guard.active.remove(id);
        guard.deleted.insert(id.to_string());
        Ok(true)
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError> {
        let guard = self.index().await?;
        let mut results: Vec<Datum> = guard
            .active
            .values()
            .filter(|d| prefix.map_or(true, |p| d.id.starts_with(p)))
            .filter(|d| after.map_or(true, |a| d.created_at > a))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        results.truncate(limit);
        Ok(results)
    }

    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError> {
        let guard = self.index().await?;
        let Some(datum) = guard.active.get(id) else {
            return Ok(Vec::new());
        };

        let mut chain = vec![datum.clone()];
        let mut current = datum;
        while let Some(parent_id) = &current.causal_parent {
            let Some(parent) = guard.active.get(parent_id) else {
                break;
            };
            chain.push(parent.clone());
            current = parent;
        }

        chain.reverse();
        Ok(chain)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.index().await?.active.contains_key(id))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.index().await?.active.len() as u64)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total = self.index().await?.active.len() as u64;
        let size_bytes = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Ok(StoreStats {
            total_datums: total,
            size_bytes,
        })
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
