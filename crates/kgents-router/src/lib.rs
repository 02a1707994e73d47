#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-router** – Backend selection with graceful degradation.
//!
//! The [`DatumRouter`] is a stateful façade over the projection lattice:
//! it probes the configured tiers, selects the best available one on the
//! first operation, and delegates everything to it afterwards. When the
//! preferred tier is down the router degrades transparently along the
//! fallback chain; the memory tier is the last resort and never fails.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kgents_store_core::{
    default_data_dir, Datum, DatumStore, Query, StoreError, StoreStats, Tier,
};
use kgents_store_jsonl::JsonlStore;
use kgents_store_memory::MemoryStore;
use kgents_store_postgres::PostgresStore;
use kgents_store_sqlite::SqliteStore;

/// Environment variable whose value forces a specific backend.
pub const ENV_BACKEND: &str = "KGENTS_DGENT_BACKEND";

pub use kgents_store_postgres::ENV_POSTGRES_URL;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Options consumed by the router at construction.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Identifies this data store; filename for local tiers, logical key
    /// for the remote tier.
    pub namespace: String,
    /// Chosen first when it probes available.
    pub preferred: Option<Tier>,
    /// Walked in order when the preferred tier is unavailable.
    pub fallback_chain: Vec<Tier>,
    /// Filesystem root for local tiers; kgents default when `None`.
    pub data_dir: Option<PathBuf>,
    /// Environment variable consulted for a forced backend.
    pub backend_env: String,
    /// Environment variable consulted for the remote connection string.
    pub postgres_url_env: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            preferred: None,
            fallback_chain: vec![Tier::Sqlite, Tier::Jsonl, Tier::Memory],
            data_dir: None,
            backend_env: ENV_BACKEND.to_string(),
            postgres_url_env: ENV_POSTGRES_URL.to_string(),
        }
    }
}

impl RouterConfig {
    /// Config for a namespace with all other options defaulted.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

//─────────────────────────────
//  Backend status
//─────────────────────────────

/// Availability and size report for one tier, produced by the probe and
/// stats calls.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    /// Canonical backend name.
    pub name: &'static str,
    /// Selection priority; lower is preferred.
    pub priority: u8,
    /// Whether the probe succeeded.
    pub available: bool,
    /// Human-readable probe failure, empty when available.
    pub reason: String,
    /// Whether data in this tier survives restarts.
    pub is_persistent: bool,
    /// Live datum count, when known.
    pub total_datums: u64,
    /// Bytes on the underlying medium, when known.
    pub size_bytes: u64,
}

impl BackendStatus {
    fn available(tier: Tier) -> Self {
        Self {
            name: tier.as_str(),
            priority: tier.priority(),
            available: true,
            reason: String::new(),
            is_persistent: tier.is_persistent(),
            total_datums: 0,
            size_bytes: 0,
        }
    }

    fn unavailable(tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
            ..Self::available(tier)
        }
    }
}

//─────────────────────────────
//  The router
//─────────────────────────────

struct Selected {
    tier: Tier,
    store: Arc<dyn DatumStore>,
}

/// Routes datum operations to the best available backend.
///
/// Selection order, run once on the first operation:
///
/// 1. Environment override, when it names an available backend.
/// 2. The configured preferred backend, when available.
/// 3. The fallback chain, first available wins.
/// 4. Memory, which is always available.
///
/// The router implements [`DatumStore`] itself and surfaces every backend
/// error unchanged; only availability is handled here.
pub struct DatumRouter {
    config: RouterConfig,
    selection: Mutex<Option<Selected>>,
}

impl DatumRouter {
    /// Create a router from explicit configuration.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            selection: Mutex::new(None),
        }
    }

    /// Create a router for a namespace with defaults everywhere else.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self::new(RouterConfig::for_namespace(namespace))
    }

    /// The active configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Probe one tier without instantiating it.
    pub async fn probe(&self, tier: Tier) -> BackendStatus {
        match tier {
            Tier::Memory => BackendStatus::available(tier),
            // The log file is created on demand, so the tier always
            // answers; a broken disk shows up as a storage error later.
            Tier::Jsonl => BackendStatus::available(tier),
            Tier::Sqlite => {
                let dir = self.config.effective_data_dir();
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    return BackendStatus::unavailable(tier, e.to_string());
                }
                let marker = dir.join(".write_test");
                match tokio::fs::write(&marker, b"").await {
                    Ok(()) => {
                        let _ = tokio::fs::remove_file(&marker).await;
                        BackendStatus::available(tier)
                    }
                    Err(e) => BackendStatus::unavailable(tier, e.to_string()),
                }
            }
            Tier::Postgres => {
                // Connection testing is deferred to first use; the probe
                // only checks that a URL is configured.
                if std::env::var(&self.config.postgres_url_env).is_ok() {
                    BackendStatus::available(tier)
                } else {
                    BackendStatus::unavailable(
                        tier,
                        format!("{} not set", self.config.postgres_url_env),
                    )
                }
            }
        }
    }

    async fn create_store(&self, tier: Tier) -> Result<Arc<dyn DatumStore>, StoreError> {
        match tier {
            Tier::Memory => Ok(Arc::new(MemoryStore::new())),
            Tier::Jsonl => Ok(Arc::new(JsonlStore::new(
                self.config.namespace.clone(),
                self.config.data_dir.clone(),
            ))),
            Tier::Sqlite => Ok(Arc::new(
                SqliteStore::for_namespace(&self.config.namespace, self.config.data_dir.clone())
                    .await?,
            )),
            Tier::Postgres => {
                let url = std::env::var(&self.config.postgres_url_env).map_err(|_| {
                    StoreError::Unavailable {
                        backend: "postgres",
                        reason: format!("{} not set", self.config.postgres_url_env),
                    }
                })?;
                Ok(Arc::new(PostgresStore::connect(&url).await?))
            }
        }
    }

    /// Try to probe and instantiate a tier; `None` means move on.
    async fn try_tier(&self, tier: Tier) -> Option<(Tier, Arc<dyn DatumStore>)> {
        let status = self.probe(tier).await;
        if !status.available {
            debug!(tier = %tier, reason = %status.reason, "tier unavailable");
            return None;
        }
        match self.create_store(tier).await {
            Ok(store) => Some((tier, store)),
            Err(e) => {
                warn!(tier = %tier, error = %e, "tier probe passed but creation failed");
                None
            }
        }
    }

    async fn select_backend(&self) -> (Tier, Arc<dyn DatumStore>) {
        // 1. Environment override.
        if let Ok(name) = std::env::var(&self.config.backend_env) {
            if let Some(tier) = Tier::parse(&name) {
                if let Some(selected) = self.try_tier(tier).await {
                    return selected;
                }
            }
        }

        // 2. Preferred backend.
        if let Some(preferred) = self.config.preferred {
            if let Some(selected) = self.try_tier(preferred).await {
                return selected;
            }
        }

        // 3. Fallback chain.
        for tier in &self.config.fallback_chain {
            if let Some(selected) = self.try_tier(*tier).await {
                return selected;
            }
        }

        // 4. Last resort.
        (Tier::Memory, Arc::new(MemoryStore::new()))
    }

    async fn backend(&self) -> Result<Arc<dyn DatumStore>, StoreError> {
        let mut selection = self.selection.lock().await;
        if let Some(selected) = selection.as_ref() {
            return Ok(Arc::clone(&selected.store));
        }
        let (tier, store) = self.select_backend().await;
        debug!(namespace = %self.config.namespace, tier = %tier, "selected backend");
        *selection = Some(Selected {
            tier,
            store: Arc::clone(&store),
        });
        Ok(store)
    }

    /// The currently selected tier, if any operation has run yet.
    pub async fn selected(&self) -> Option<Tier> {
        self.selection.lock().await.as_ref().map(|s| s.tier)
    }

    /// Availability of every tier. Datum counts are filled in for the
    /// currently selected backend.
    pub async fn status(&self) -> Vec<BackendStatus> {
        let selection = self.selection.lock().await;
        let mut statuses = Vec::with_capacity(Tier::all().len());
        for tier in Tier::all() {
            let mut status = self.probe(tier).await;
            if let Some(selected) = selection.as_ref() {
                if selected.tier == tier {
                    if let Ok(stats) = selected.store.stats().await {
                        status.total_datums = stats.total_datums;
                        status.size_bytes = stats.size_bytes;
                    }
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Select a specific tier, bypassing the usual order. Errors with the
    /// probe's reason when the tier is unavailable.
    pub async fn force_backend(&self, tier: Tier) -> Result<(), StoreError> {
        let mut selection = self.selection.lock().await;
        let status = self.probe(tier).await;
        if !status.available {
            return Err(StoreError::Unavailable {
                backend: tier.as_str(),
                reason: status.reason,
            });
        }
        let store = self.create_store(tier).await?;
        *selection = Some(Selected { tier, store });
        Ok(())
    }

    /// Forget the current selection; the next operation re-runs the
    /// selection procedure.
    pub async fn reset(&self) {
        *self.selection.lock().await = None;
    }
}

#[async_trait]
impl DatumStore for DatumRouter {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        self.backend().await?.put(datum).await
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        self.backend().await?.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.backend().await?.delete(id).await
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError> {
        self.backend().await?.list(prefix, after, limit).await
    }

    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError> {
        self.backend().await?.causal_chain(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.backend().await?.exists(id).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.backend().await?.count().await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Datum>, StoreError> {
        self.backend().await?.query(query).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.backend().await?.stats().await
    }

    fn name(&self) -> &'static str {
        "router"
    }
}
