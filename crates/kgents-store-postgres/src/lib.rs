#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-store-postgres** – PostgreSQL storage driver for kgents.
//!
//! The most durable tier of the projection lattice: a pooled connection
//! to a relational server with BYTEA content, JSONB metadata, and
//! recursive-CTE ancestry lookups. The schema is created idempotently on
//! first use.

use core::fmt;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use kgents_store_core::{Datum, DatumStore, Metadata, Query, StoreError, StoreStats};

/// Environment variable consulted for the connection string when none is
/// given explicitly.
pub const ENV_POSTGRES_URL: &str = "KGENTS_POSTGRES_URL";

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS data (
    id TEXT PRIMARY KEY,
    content BYTEA NOT NULL,
    created_at DOUBLE PRECISION NOT NULL,
    causal_parent TEXT REFERENCES data(id) ON DELETE SET NULL,
    metadata JSONB DEFAULT '{}'::jsonb
);
CREATE INDEX IF NOT EXISTS idx_data_created ON data(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_data_parent ON data(causal_parent) WHERE causal_parent IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_data_id_prefix ON data(id text_pattern_ops)
"#;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage {
        backend: "postgres",
        message: e.to_string(),
    }
}

//─────────────────────────────
//  Postgres storage backend
//─────────────────────────────

/// Database health snapshot produced by [`PostgresStore::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Whether a pooled connection answered.
    pub connected: bool,
    /// Live datum count.
    pub count: u64,
    /// Total relation size in bytes.
    pub size_bytes: u64,
    /// Current number of pooled connections.
    pub pool_size: u32,
}

/// A datum store backed by a PostgreSQL server.
///
/// Isolation is delegated to the connection pool; every statement runs on
/// one pooled connection with the server's usual ACID guarantees.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects with the default pool bounds and creates the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, DEFAULT_MIN_CONNECTIONS, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connects with explicit pool bounds and creates the schema.
    pub async fn connect_with(
        url: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Connects using the URL in [`ENV_POSTGRES_URL`].
    pub async fn from_env() -> Result<Self, StoreError> {
        let url = std::env::var(ENV_POSTGRES_URL).map_err(|_| StoreError::Unavailable {
            backend: "postgres",
            reason: format!("{ENV_POSTGRES_URL} not set"),
        })?;
        Self::connect(&url).await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        // The driver rejects multi-statement strings, so run each one.
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    fn row_to_datum(row: &PgRow) -> Result<Datum, StoreError> {
        let metadata: Option<Json<Metadata>> = row.try_get("metadata").map_err(db_err)?;
        Ok(Datum {
            id: row.try_get("id").map_err(db_err)?,
            content: row.try_get("content").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            causal_parent: row.try_get("causal_parent").map_err(db_err)?,
            metadata: metadata.map(|m| m.0).unwrap_or_default(),
        })
    }

    /// Reclaim space and refresh planner statistics.
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM ANALYZE data")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Connection, size, and pool statistics.
    pub async fn health_check(&self) -> Result<HealthReport, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM data")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("count")
            .map_err(db_err)?;
        let size_bytes: i64 = sqlx::query("SELECT pg_total_relation_size('data') AS size")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("size")
            .map_err(db_err)?;
        Ok(HealthReport {
            connected: true,
            count: count as u64,
            size_bytes: size_bytes as u64,
            pool_size: self.pool.size(),
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// The pool's connect URL may carry credentials; never print it.
impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

#[async_trait]
impl DatumStore for PostgresStore {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO data (id, content, created_at, causal_parent, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                content = EXCLUDED.content,
                created_at = EXCLUDED.created_at,
                causal_parent = EXCLUDED.causal_parent,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&datum.id)
        .bind(&datum.content)
        .bind(datum.created_at)
        .bind(&datum.causal_parent)
        .bind(Json(&datum.metadata))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(datum.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        let row = sqlx::query(
            "SELECT id, content, created_at, causal_parent, metadata FROM data WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_datum).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM data WHERE id = $1")
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
        let mut param = 0;
        if prefix.is_some() {
            param += 1;
            sql.push_str(&format!(" AND id LIKE ${param}"));
        }
        if after.is_some() {
            param += 1;
            sql.push_str(&format!(" AND created_at > ${param}"));
        }
        param += 1;
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ${param}"));

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
            WITH RECURSIVE chain AS (
                SELECT id, content, created_at, causal_parent, metadata, 0 AS depth
                FROM data
                WHERE id = $1

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
        let row = sqlx::query("SELECT 1 FROM data WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM data")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("count")
            .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Datum>, StoreError> {
        let mut sql = String::from(
            "SELECT id, content, created_at, causal_parent, metadata FROM data WHERE 1=1",
        );
        let mut param = 0;
        let mut clause = |text: &str, sql: &mut String| {
            param += 1;
            sql.push_str(&text.replace("$n", &format!("${param}")));
        };
        if query.prefix.is_some() {
            clause(" AND id LIKE $n", &mut sql);
        }
        if query.after.is_some() {
            clause(" AND created_at > $n", &mut sql);
        }
        if query.before.is_some() {
            clause(" AND created_at < $n", &mut sql);
        }
        if query.author.is_some() {
            clause(" AND metadata->>'author' = $n", &mut sql);
        }
        if query.source.is_some() {
            clause(" AND metadata->>'source' = $n", &mut sql);
        }
        for _ in &query.where_eq {
            clause(" AND metadata->>$n", &mut sql);
            clause(" = $n", &mut sql);
        }
        sql.push_str(" ORDER BY created_at DESC");

        // Tag containment stays in process; pagination follows it there.
        let push_page = query.tags.is_empty();
        if push_page {
            clause(" LIMIT $n", &mut sql);
            clause(" OFFSET $n", &mut sql);
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
            q = q.bind(key).bind(value);
        }
        if push_page {
            let limit = query
                .limit
                .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
                .unwrap_or(i64::MAX);
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

    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let health = self.health_check().await?;
        Ok(StoreStats {
            total_datums: health.count,
            size_bytes: health.size_bytes,
        })
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
