#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-store-sqlite** – SQLite-based persistent storage driver for kgents.
//!
//! Tier 2 of the projection lattice: a single-file relational store with
//! WAL journaling, indices on creation time and causal parent, and
//! recursive-CTE ancestry lookups. All I/O goes through sqlx's async
//! SQLite driver, which dispatches the blocking work to its own workers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use kgents_store_core::{
    default_data_dir, Datum, DatumStore, Metadata, Query, StoreError, StoreStats,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS data (
    id TEXT PRIMARY KEY,
    content BLOB NOT NULL,
    created_at REAL NOT NULL,
    causal_parent TEXT,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_created ON data(created_at);
CREATE INDEX IF NOT EXISTS idx_parent ON data(causal_parent);
"#;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage {
        backend: "sqlite",
        message: e.to_string(),
    }
}

//─────────────────────────────
//  SQLite storage backend
//─────────────────────────────

/// A persistent datum store backed by a single SQLite file.
///
/// Uses one `data` table keyed by id with `INSERT OR REPLACE` put
/// semantics, so a second put with the same id overwrites. Listing and
/// querying are pushed into parameterized SQL where possible.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens or creates a database at the given path, enabling WAL
    /// journaling.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self {
            pool,
            path: Some(path.as_ref().to_path_buf()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Opens the namespace-bound database `{data_dir}/{namespace}.db`,
    /// creating the data directory on demand.
    pub async fn for_namespace(
        namespace: &str,
        data_dir: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let dir = data_dir.unwrap_or_else(default_data_dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Storage {
                backend: "sqlite",
                message: e.to_string(),
            })?;
        Self::open(dir.join(format!("{namespace}.db"))).await
    }

    /// Opens a database that lives only in memory. Useful for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool, path: None };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    fn row_to_datum(row: &SqliteRow) -> Result<Datum, StoreError> {
        let id: String = row.try_get("id").map_err(db_err)?;
        let metadata_text: Option<String> = row.try_get("metadata").map_err(db_err)?;
        let metadata: Metadata = match metadata_text {
            Some(text) if !text.is_empty() => {
                serde_json::from_str(&text).map_err(|e| StoreError::Corruption {
                    backend: "sqlite",
                    reason: format!("metadata of {id}: {e}"),
                })?
            }
            _ => Metadata::new(),
        };
        Ok(Datum {
            content: row.try_get("content").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            causal_parent: row.try_get("causal_parent").map_err(db_err)?,
            metadata,
            id,
        })
    }

    /// Rebuild the database file to reclaim space. Returns bytes saved.
    pub async fn vacuum(&self) -> Result<u64, StoreError> {
        let before = self.file_size().await;
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let after = self.file_size().await;
        Ok(before.saturating_sub(after))
    }

    async fn file_size(&self) -> u64 {
        match &self.path {
            Some(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DatumStore for SqliteStore {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        let metadata_json = if datum.metadata.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&datum.metadata)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            )
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO data (id, content, created_at, causal_parent, metadata)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&datum.id)
        .bind(&datum.content)
        .bind(datum.created_at)
        .bind(&datum.causal_parent)
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(datum.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        let row = sqlx::query("SELECT id, content, created_at, causal_parent, metadata FROM data WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_datum).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM data WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError> {
        let mut sql = String::from(
            "SELECT id, content, created_at, causal_parent, metadata FROM data WHERE 1=1",
        );
        if prefix.is_some() {
            sql.push_str(" AND id LIKE ?");
        }
        if after.is_some() {
            sql.push_str(" AND created_at > ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(p) = prefix {
            query = query.bind(format!("{p}%"));
        }
        if let Some(a) = after {
            query = query.bind(a);
        }
        query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(Self::row_to_datum).collect()
    }

    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE chain(id, content, created_at, causal_parent, metadata, depth) AS (
                SELECT id, content, created_at, causal_parent, metadata, 0
                FROM data
                WHERE id = ?

                UNION ALL

                SELECT d.id, d.content, d.created_at, d.causal_parent, d.metadata, c.depth + 1
                FROM data d
                INNER JOIN chain c ON d.id = c.causal_parent
            )
            SELECT id, content, created_at, causal_parent, metadata
            FROM chain
            ORDER BY depth DESC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_datum).collect()
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM data WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM data")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let count: i64 = row.try_get("count").map_err(db_err)?;
        Ok(count as u64)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Datum>, StoreError> {
        let mut sql = String::from(
            "SELECT id, content, created_at, causal_parent, metadata FROM data WHERE 1=1",
        );
        if query.prefix.is_some() {
            sql.push_str(" AND id LIKE ?");
        }
        if query.after.is_some() {
            sql.push_str(" AND created_at > ?");
        }
        if query.before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        if query.author.is_some() {
            sql.push_str(" AND json_extract(metadata, '$.author') = ?");
        }
        if query.source.is_some() {
            sql.push_str(" AND json_extract(metadata, '$.source') = ?");
        }
        for _ in &query.where_eq {
            sql.push_str(" AND json_extract(metadata, ?) = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        // Tag containment cannot be pushed into SQL, so pagination moves
        // to the post-filter when tags are present.
        let push_page = query.tags.is_empty();
        if push_page {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut q = sqlx::query(&sql);
        if let Some(p) = &query.prefix {
            q = q.bind(format!("{p}%"));
        }
        if let Some(a) = query.after {
            q = q.bind(a);
        }
        if let Some(b) = query.before {
            q = q.bind(b);
        }
        if let Some(author) = &query.author {
            q = q.bind(author);
        }
        if let Some(source) = &query.source {
            q = q.bind(source);
        }
        for (key, value) in &query.where_eq {
            q = q.bind(format!("$.{key}")).bind(value);
        }
        if push_page {
            let limit = query
                .limit
                .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
                .unwrap_or(-1);
            q = q.bind(limit).bind(query.offset as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        let datums: Vec<Datum> = rows
            .iter()
            .map(Self::row_to_datum)
            .collect::<Result<_, _>>()?;

        if push_page {
            Ok(datums)
        } else {
            Ok(query.apply(datums))
        }
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            total_datums: self.count().await?,
            size_bytes: self.file_size().await,
        })
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let datum = Datum::new(vec![0u8, 1, 255])
            .with_parent("p-1")
            .with_metadata([("tags", "a,b"), ("schema", "note")]);

        store.put(&datum).await.unwrap();
        let fetched = store.get(&datum.id).await.unwrap().unwrap();
        assert_eq!(fetched, datum);
    }

    #[tokio::test]
    async fn put_replaces_on_same_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let datum = Datum::new(b"v1".to_vec());
        store.put(&datum).await.unwrap();
        store
            .put(&datum.clone().with_metadata([("rev", "2")]))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let fetched = store.get(&datum.id).await.unwrap().unwrap();
        assert_eq!(fetched.metadata.get("rev").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = SqliteStore::in_memory().await.unwrap();
        let datum = Datum::new(b"x".to_vec());
        store.put(&datum).await.unwrap();

        assert!(store.delete(&datum.id).await.unwrap());
        assert!(!store.delete(&datum.id).await.unwrap());
        assert!(store.get(&datum.id).await.unwrap().is_none());
        assert!(!store.exists(&datum.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_pushes_filters_into_sql() {
        let store = SqliteStore::in_memory().await.unwrap();
        let old = Datum::new(b"old".to_vec()).with_id("k-old");
        let new = Datum::new(b"new".to_vec()).with_id("k-new");
        let other = Datum::new(b"other".to_vec()).with_id("x-other");
        for d in [&old, &new, &other] {
            store.put(d).await.unwrap();
        }

        let all = store.list(None, None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at > all[2].created_at);

        let prefixed = store.list(Some("k-"), None, 10).await.unwrap();
        assert_eq!(prefixed.len(), 2);

        let recent = store.list(None, Some(old.created_at), 10).await.unwrap();
        assert!(recent.iter().all(|d| d.created_at > old.created_at));

        assert!(store.list(None, None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn causal_chain_uses_recursive_cte() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = Datum::new(b"a".to_vec());
        let b = a.derive(b"b".to_vec());
        let c = b.derive(b"c".to_vec());
        for d in [&a, &b, &c] {
            store.put(d).await.unwrap();
        }

        let ids: Vec<String> = store
            .causal_chain(&c.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        assert_eq!(store.causal_chain(&a.id).await.unwrap().len(), 1);
        assert!(store.causal_chain("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn causal_chain_stops_at_missing_ancestor() {
        let store = SqliteStore::in_memory().await.unwrap();
        let orphan = Datum::new(b"orphan".to_vec()).with_parent("never-stored");
        store.put(&orphan).await.unwrap();

        let chain = store.causal_chain(&orphan.id).await.unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn query_pushes_metadata_filters() {
        let store = SqliteStore::in_memory().await.unwrap();
        let hit = Datum::new(b"hit".to_vec())
            .with_metadata([("author", "ada"), ("schema", "note"), ("tags", "a,b")]);
        let miss = Datum::new(b"miss".to_vec()).with_metadata([("author", "bob")]);
        store.put(&hit).await.unwrap();
        store.put(&miss).await.unwrap();

        let by_author = store
            .query(&Query::new().with_author("ada"))
            .await
            .unwrap();
        assert_eq!(by_author.len(), 1);
        assert_eq!(by_author[0].id, hit.id);

        let by_schema = store
            .query(&Query::new().where_eq("schema", "note"))
            .await
            .unwrap();
        assert_eq!(by_schema.len(), 1);

        let by_tags = store
            .query(&Query::new().with_tags(["a", "b"]))
            .await
            .unwrap();
        assert_eq!(by_tags.len(), 1);

        let none = store
            .query(&Query::new().with_tags(["a", "missing"]))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn query_pagination_is_newest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let d = Datum::new(format!("{i}").into_bytes());
            ids.push(store.put(&d).await.unwrap());
        }

        let page = store
            .query(&Query::new().with_offset(1).with_limit(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        // ids were stored oldest to newest; offset 1 skips the newest.
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[tokio::test]
    async fn file_backed_store_persists_and_vacuums() {
        let dir = tempdir().unwrap();
        let datum = Datum::new(b"durable".to_vec());
        {
            let store = SqliteStore::for_namespace("vacuum_test", Some(dir.path().to_path_buf()))
                .await
                .unwrap();
            store.put(&datum).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::for_namespace("vacuum_test", Some(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(store.get(&datum.id).await.unwrap().unwrap(), datum);

        store.delete(&datum.id).await.unwrap();
        store.vacuum().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
