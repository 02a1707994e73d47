#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-promoter** – Automatic datum promotion through the projection
//! lattice.
//!
//! Data starts in the fastest tier and earns its way into more durable
//! ones: the [`AutoPromoter`] watches the change bus for access patterns
//! and copies eligible datums to the next tier under a configurable
//! [`PromotionPolicy`]. Promotion is copy-only; the one-shot
//! [`migrate`]/[`verify`] helpers cover explicit moves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kgents_bus_core::{handler, DataBus, DataEvent, DataEventType, Subscription};
use kgents_store_core::{clock, Datum, DatumStore, Metadata, StoreError, Tier};

//─────────────────────────────
//  Policy
//─────────────────────────────

/// Per-tier thresholds for automatic promotion.
///
/// A datum is promoted out of a tier once it has been accessed often
/// enough or lived long enough. The top transition is gated separately:
/// with `sqlite_to_postgres_explicit_only` set (the default), datums
/// reach the remote tier only through [`AutoPromoter::force_upgrade`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionPolicy {
    /// Accesses before a memory datum moves to the log tier.
    pub memory_to_jsonl_accesses: u32,
    /// Seconds alive before a memory datum moves to the log tier.
    pub memory_to_jsonl_seconds: f64,
    /// Accesses before a log datum moves to the embedded database.
    pub jsonl_to_sqlite_accesses: u32,
    /// Seconds alive before a log datum moves to the embedded database.
    pub jsonl_to_sqlite_seconds: f64,
    /// When set, the remote tier is reachable only by explicit upgrade.
    pub sqlite_to_postgres_explicit_only: bool,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            memory_to_jsonl_accesses: 3,
            memory_to_jsonl_seconds: 60.0,
            jsonl_to_sqlite_accesses: 10,
            jsonl_to_sqlite_seconds: 3600.0,
            sqlite_to_postgres_explicit_only: true,
        }
    }
}

//─────────────────────────────
//  Statistics
//─────────────────────────────

/// Aggregate promotion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PromoterStats {
    /// Promotions from the memory tier into the log tier.
    pub memory_to_jsonl: u64,
    /// Promotions from the log tier into the embedded database.
    pub jsonl_to_sqlite: u64,
    /// Promotions from the embedded database into the remote tier.
    pub sqlite_to_postgres: u64,
    /// Promotions that failed; the sweep continues past them.
    pub upgrade_failures: u64,
    /// Timestamp of the most recent successful promotion.
    pub last_upgrade_time: Option<f64>,
}

/// Per-datum tracking state used for promotion decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DatumStats {
    /// The tracked datum.
    pub id: String,
    /// Tier the datum currently lives in, as far as the promoter knows.
    pub tier: Tier,
    /// Bus events observed for this datum.
    pub access_count: u32,
    /// Timestamp of the most recent PUT.
    pub created_at: f64,
    /// Timestamp of the most recent observed event.
    pub last_accessed: f64,
    /// Set via [`AutoPromoter::mark_important`].
    pub marked_important: bool,
}

//─────────────────────────────
//  Upgrade callbacks
//─────────────────────────────

/// Listener invoked after each successful promotion with the datum and
/// the (from, to) tiers.
pub type UpgradeCallback = Arc<dyn Fn(Datum, Tier, Tier) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`UpgradeCallback`].
pub fn upgrade_callback<F, Fut>(f: F) -> UpgradeCallback
where
    F: Fn(Datum, Tier, Tier) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |datum, from, to| f(datum, from, to).boxed())
}

//─────────────────────────────
//  The promoter
//─────────────────────────────

struct PromoterInner {
    source: Arc<dyn DatumStore>,
    source_tier: Tier,
    targets: HashMap<Tier, Arc<dyn DatumStore>>,
    bus: Option<DataBus>,
    policy: PromotionPolicy,
    check_interval: Duration,
    tracked: StdMutex<HashMap<String, DatumStats>>,
    stats: StdMutex<PromoterStats>,
    callbacks: StdMutex<Vec<UpgradeCallback>>,
    running: AtomicBool,
}

impl PromoterInner {
    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, HashMap<String, DatumStats>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, PromoterStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one bus event into the per-datum tracking state.
    fn record_event(&self, event: &DataEvent) {
        let mut tracked = self.lock_tracked();
        if event.event_type == DataEventType::Delete {
            tracked.remove(&event.datum_id);
            return;
        }

        let entry = tracked
            .entry(event.datum_id.clone())
            .or_insert_with(|| DatumStats {
                id: event.datum_id.clone(),
                tier: self.source_tier,
                access_count: 0,
                created_at: event.timestamp,
                last_accessed: event.timestamp,
                marked_important: false,
            });

        if event.event_type == DataEventType::Put {
            entry.created_at = event.timestamp;
        }
        entry.access_count += 1;
        entry.last_accessed = event.timestamp;
    }

    /// Where the policy says this datum should go next, if anywhere.
    fn promotion_target(&self, stats: &DatumStats, now: f64) -> Option<Tier> {
        let policy = &self.policy;
        match stats.tier {
            Tier::Memory => {
                if stats.access_count >= policy.memory_to_jsonl_accesses
                    || now - stats.created_at >= policy.memory_to_jsonl_seconds
                {
                    Some(Tier::Jsonl)
                } else {
                    None
                }
            }
            Tier::Jsonl => {
                if stats.access_count >= policy.jsonl_to_sqlite_accesses
                    || now - stats.created_at >= policy.jsonl_to_sqlite_seconds
                {
                    Some(Tier::Sqlite)
                } else {
                    None
                }
            }
            Tier::Sqlite => {
                if !policy.sqlite_to_postgres_explicit_only && stats.marked_important {
                    Some(Tier::Postgres)
                } else {
                    None
                }
            }
            Tier::Postgres => None,
        }
    }

    /// Copy one datum into a higher tier. Returns `false` when the datum
    /// has disappeared from the source in the meantime.
    async fn promote(
        &self,
        datum_id: &str,
        from: Tier,
        to: Tier,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let Some(target) = self.targets.get(&to) else {
            return Err(StoreError::PolicyViolation(format!(
                "no backend configured for tier {to}"
            )));
        };

        let Some(datum) = self.source.get(datum_id).await? else {
            return Ok(false);
        };

        target.put(&datum).await?;

        if let Some(entry) = self.lock_tracked().get_mut(datum_id) {
            entry.tier = to;
        }

        {
            let mut stats = self.lock_stats();
            match (from, to) {
                (Tier::Memory, Tier::Jsonl) => stats.memory_to_jsonl += 1,
                (Tier::Jsonl, Tier::Sqlite) => stats.jsonl_to_sqlite += 1,
                (Tier::Sqlite, Tier::Postgres) => stats.sqlite_to_postgres += 1,
                _ => {}
            }
            stats.last_upgrade_time = Some(clock::now());
        }

        let callbacks: Vec<UpgradeCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            callback(datum.clone(), from, to).await;
        }

        if let Some(bus) = &self.bus {
            let event = DataEvent::new(DataEventType::Upgrade, datum_id)
                .with_source("promoter")
                .with_metadata(Metadata::from([
                    ("from".to_string(), from.to_string()),
                    ("to".to_string(), to.to_string()),
                    ("reason".to_string(), reason.to_string()),
                ]));
            bus.emit(event).await;
        }

        debug!(datum = datum_id, %from, %to, "promoted datum");
        Ok(true)
    }

    /// One pass over the tracked datums. Returns how many were promoted.
    async fn sweep(&self) -> usize {
        let now = clock::now();
        let candidates: Vec<(String, Tier, Tier)> = {
            let tracked = self.lock_tracked();
            tracked
                .values()
                .filter_map(|s| {
                    self.promotion_target(s, now)
                        .map(|to| (s.id.clone(), s.tier, to))
                })
                .collect()
        };

        let mut promoted = 0;
        for (id, from, to) in candidates {
            if !self.targets.contains_key(&to) {
                debug!(%to, "no target backend for tier");
                continue;
            }
            match self.promote(&id, from, to, "policy").await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(datum = %id, error = %e, "promotion failed");
                    self.lock_stats().upgrade_failures += 1;
                }
            }
        }
        promoted
    }
}

/// Background task that promotes datums between tiers by policy.
///
/// Subscribe it to a bus with [`start`](AutoPromoter::start); every PUT
/// creates or refreshes tracking state, every DELETE drops it, and a
/// periodic sweep copies eligible datums upward. Promotion never deletes
/// from the source tier.
pub struct AutoPromoter {
    inner: Arc<PromoterInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
    subscription: StdMutex<Option<Subscription>>,
}

impl AutoPromoter {
    /// Create a promoter.
    ///
    /// `source` is the backend datums are read from, `source_tier` the
    /// tier new datums are assumed to start in, and `targets` the
    /// backends promotions write to. Without a `bus` the promoter only
    /// reacts to [`force_upgrade`](Self::force_upgrade).
    pub fn new(
        source: Arc<dyn DatumStore>,
        source_tier: Tier,
        targets: HashMap<Tier, Arc<dyn DatumStore>>,
        bus: Option<DataBus>,
        policy: PromotionPolicy,
        check_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PromoterInner {
                source,
                source_tier,
                targets,
                bus,
                policy,
                check_interval,
                tracked: StdMutex::new(HashMap::new()),
                stats: StdMutex::new(PromoterStats::default()),
                callbacks: StdMutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            task: StdMutex::new(None),
            subscription: StdMutex::new(None),
        }
    }

    /// Subscribe to the bus and begin periodic sweeps.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(bus) = &self.inner.bus {
            let inner = Arc::clone(&self.inner);
            let subscription = bus.subscribe_all(handler(move |event| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.record_event(&event);
                    Ok(())
                }
            }));
            *self
                .subscription
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(inner.check_interval).await;
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep().await;
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        debug!("auto-promoter started");
    }

    /// Cancel the sweep task, await its termination, and unsubscribe.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let task = {
            let mut guard = self.task.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let subscription = {
            let mut guard = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        debug!("auto-promoter stopped");
    }

    /// One promotion pass right now, outside the periodic schedule.
    /// Returns how many datums were promoted.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Promote one datum to a target tier, bypassing the policy.
    ///
    /// Errors with a policy violation when no backend is configured for
    /// the target tier; returns `false` when the datum no longer exists
    /// in the source.
    pub async fn force_upgrade(&self, datum_id: &str, to: Tier) -> Result<bool, StoreError> {
        let from = self
            .inner
            .lock_tracked()
            .get(datum_id)
            .map(|s| s.tier)
            .unwrap_or(self.inner.source_tier);
        self.inner.promote(datum_id, from, to, "explicit").await
    }

    /// Flag a datum so the policy may consider it for the remote tier.
    pub fn mark_important(&self, datum_id: &str) {
        if let Some(entry) = self.inner.lock_tracked().get_mut(datum_id) {
            entry.marked_important = true;
        }
    }

    /// Register a listener for successful promotions.
    pub fn on_upgrade(&self, callback: UpgradeCallback) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Tracking state for one datum, if it has been observed.
    pub fn get_datum_stats(&self, datum_id: &str) -> Option<DatumStats> {
        self.inner.lock_tracked().get(datum_id).cloned()
    }

    /// Aggregate promotion counters.
    pub fn stats(&self) -> PromoterStats {
        *self.inner.lock_stats()
    }
}

//─────────────────────────────
//  Migration helpers
//─────────────────────────────

/// Copy every datum from `source` to `target` in batches, optionally
/// deleting each from the source afterwards. Returns how many were
/// migrated.
pub async fn migrate(
    source: &dyn DatumStore,
    target: &dyn DatumStore,
    batch_size: usize,
    delete_source: bool,
) -> Result<u64, StoreError> {
    let all = source.list(None, None, usize::MAX).await?;
    let mut migrated = 0u64;
    for batch in all.chunks(batch_size.max(1)) {
        for datum in batch {
            target.put(datum).await?;
            if delete_source {
                source.delete(&datum.id).await?;
            }
            migrated += 1;
        }
    }
    Ok(migrated)
}

/// Confirm that every datum in `source` is present in `target`. Returns
/// `(ok, missing_ids)`.
pub async fn verify(
    source: &dyn DatumStore,
    target: &dyn DatumStore,
) -> Result<(bool, Vec<String>), StoreError> {
    let mut missing = Vec::new();
    for datum in source.list(None, None, usize::MAX).await? {
        if !target.exists(&datum.id).await? {
            missing.push(datum.id);
        }
    }
    Ok((missing.is_empty(), missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgents_store_jsonl::JsonlStore;
    use kgents_store_memory::MemoryStore;
    use kgents_store_sqlite::SqliteStore;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    /// Policy that promotes memory datums after two accesses and never
    /// by age.
    fn access_policy() -> PromotionPolicy {
        PromotionPolicy {
            memory_to_jsonl_accesses: 2,
            memory_to_jsonl_seconds: 1e6,
            ..PromotionPolicy::default()
        }
    }

    fn put_event(datum_id: &str) -> DataEvent {
        DataEvent::new(DataEventType::Put, datum_id)
    }

    struct Fixture {
        memory: Arc<MemoryStore>,
        jsonl: Arc<JsonlStore>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            Self {
                memory: Arc::new(MemoryStore::new()),
                jsonl: Arc::new(JsonlStore::new(
                    "promoter_test",
                    Some(dir.path().to_path_buf()),
                )),
                _dir: dir,
            }
        }

        fn promoter(&self, bus: Option<DataBus>, policy: PromotionPolicy) -> AutoPromoter {
            AutoPromoter::new(
                Arc::clone(&self.memory) as Arc<dyn DatumStore>,
                Tier::Memory,
                HashMap::from([(
                    Tier::Jsonl,
                    Arc::clone(&self.jsonl) as Arc<dyn DatumStore>,
                )]),
                bus,
                policy,
                Duration::from_secs(30),
            )
        }
    }

    #[tokio::test]
    async fn access_count_triggers_promotion() {
        let fx = Fixture::new();
        let promoter = fx.promoter(None, access_policy());

        let datum = Datum::new(b"hot".to_vec());
        fx.memory.put(&datum).await.unwrap();

        promoter.inner.record_event(&put_event(&datum.id));
        assert_eq!(promoter.sweep().await, 0); // one access is not enough

        promoter.inner.record_event(&put_event(&datum.id));
        assert_eq!(promoter.sweep().await, 1);

        // Copy-only: both tiers now hold the datum.
        assert_eq!(fx.jsonl.get(&datum.id).await.unwrap().unwrap(), datum);
        assert!(fx.memory.exists(&datum.id).await.unwrap());

        let stats = promoter.stats();
        assert_eq!(stats.memory_to_jsonl, 1);
        assert!(stats.last_upgrade_time.is_some());
        assert_eq!(
            promoter.get_datum_stats(&datum.id).unwrap().tier,
            Tier::Jsonl
        );
    }

    #[tokio::test]
    async fn age_triggers_promotion() {
        let fx = Fixture::new();
        let policy = PromotionPolicy {
            memory_to_jsonl_accesses: 1000,
            memory_to_jsonl_seconds: 0.0,
            ..PromotionPolicy::default()
        };
        let promoter = fx.promoter(None, policy);

        let datum = Datum::new(b"old".to_vec());
        fx.memory.put(&datum).await.unwrap();
        promoter.inner.record_event(&put_event(&datum.id));

        assert_eq!(promoter.sweep().await, 1);
        assert!(fx.jsonl.exists(&datum.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_clears_tracking() {
        let fx = Fixture::new();
        let promoter = fx.promoter(None, access_policy());

        promoter.inner.record_event(&put_event("d-1"));
        assert!(promoter.get_datum_stats("d-1").is_some());

        promoter
            .inner
            .record_event(&DataEvent::new(DataEventType::Delete, "d-1"));
        assert!(promoter.get_datum_stats("d-1").is_none());
    }

    #[tokio::test]
    async fn vanished_datum_is_skipped_without_failure() {
        let fx = Fixture::new();
        let promoter = fx.promoter(None, access_policy());

        // Tracked but never stored in the source.
        promoter.inner.record_event(&put_event("ghost"));
        promoter.inner.record_event(&put_event("ghost"));

        assert_eq!(promoter.sweep().await, 0);
        assert_eq!(promoter.stats().upgrade_failures, 0);
    }

    #[tokio::test]
    async fn force_upgrade_bypasses_policy() {
        let fx = Fixture::new();
        let promoter = fx.promoter(None, PromotionPolicy::default());

        let datum = Datum::new(b"vip".to_vec());
        fx.memory.put(&datum).await.unwrap();

        assert!(promoter.force_upgrade(&datum.id, Tier::Jsonl).await.unwrap());
        assert!(fx.jsonl.exists(&datum.id).await.unwrap());

        // No backend is configured for the remote tier.
        let err = promoter
            .force_upgrade(&datum.id, Tier::Postgres)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PolicyViolation(_)));

        // Unknown datums are not an error.
        assert!(!promoter.force_upgrade("missing", Tier::Jsonl).await.unwrap());
    }

    #[tokio::test]
    async fn remote_tier_needs_the_explicit_only_flag_off() {
        let fx = Fixture::new();
        let promoter = fx.promoter(None, PromotionPolicy::default());

        promoter.inner.record_event(&put_event("important"));
        if let Some(entry) = promoter.inner.lock_tracked().get_mut("important") {
            entry.tier = Tier::Sqlite;
        }
        promoter.mark_important("important");

        // Default policy keeps the top transition explicit-only.
        assert_eq!(promoter.sweep().await, 0);

        let open = PromotionPolicy {
            sqlite_to_postgres_explicit_only: false,
            ..PromotionPolicy::default()
        };
        let promoter = fx.promoter(None, open);
        promoter.inner.record_event(&put_event("important"));
        if let Some(entry) = promoter.inner.lock_tracked().get_mut("important") {
            entry.tier = Tier::Sqlite;
        }
        promoter.mark_important("important");

        // Candidate exists now, but no postgres backend is configured, so
        // the sweep skips it quietly.
        assert_eq!(promoter.sweep().await, 0);
        assert_eq!(promoter.stats().upgrade_failures, 0);
    }

    #[tokio::test]
    async fn promotions_emit_upgrade_events_and_run_callbacks() {
        let fx = Fixture::new();
        let bus = DataBus::default();
        let promoter = fx.promoter(Some(bus.clone()), access_policy());

        let upgraded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&upgraded);
        promoter.on_upgrade(upgrade_callback(move |datum, from, to| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push((datum.id, from, to));
            }
        }));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(
            DataEventType::Upgrade,
            handler(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().await.push(event);
                    Ok(())
                }
            }),
        );

        let datum = Datum::new(b"watched".to_vec());
        fx.memory.put(&datum).await.unwrap();
        promoter.inner.record_event(&put_event(&datum.id));
        promoter.inner.record_event(&put_event(&datum.id));
        assert_eq!(promoter.sweep().await, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let callbacks = upgraded.lock().await;
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0], (datum.id.clone(), Tier::Memory, Tier::Jsonl));

        let events = seen.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].datum_id, datum.id);
        assert_eq!(
            events[0].metadata.get("from").map(String::as_str),
            Some("memory")
        );
        assert_eq!(
            events[0].metadata.get("to").map(String::as_str),
            Some("jsonl")
        );
    }

    #[tokio::test]
    async fn background_loop_promotes_from_bus_traffic() {
        let fx = Fixture::new();
        let bus = DataBus::default();
        let promoter = AutoPromoter::new(
            Arc::clone(&fx.memory) as Arc<dyn DatumStore>,
            Tier::Memory,
            HashMap::from([(
                Tier::Jsonl,
                Arc::clone(&fx.jsonl) as Arc<dyn DatumStore>,
            )]),
            Some(bus.clone()),
            access_policy(),
            Duration::from_millis(25),
        );
        promoter.start();

        let datum = Datum::new(b"busy".to_vec());
        fx.memory.put(&datum).await.unwrap();
        bus.emit(put_event(&datum.id)).await;
        bus.emit(put_event(&datum.id)).await;

        // Two sweep intervals is plenty.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(fx.jsonl.exists(&datum.id).await.unwrap());

        promoter.stop().await;

        // After stop the promoter no longer reacts to bus traffic.
        let late = Datum::new(b"late".to_vec());
        fx.memory.put(&late).await.unwrap();
        bus.emit(put_event(&late.id)).await;
        bus.emit(put_event(&late.id)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fx.jsonl.exists(&late.id).await.unwrap());
    }

    #[tokio::test]
    async fn migrate_copies_and_optionally_deletes() {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::new();
        let sqlite = SqliteStore::for_namespace("migrate_test", Some(dir.path().to_path_buf()))
            .await
            .unwrap();

        let mut datums = Vec::new();
        for i in 0..7 {
            let d = Datum::new(format!("payload-{i}").into_bytes());
            memory.put(&d).await.unwrap();
            datums.push(d);
        }

        let moved = migrate(&memory, &sqlite, 3, false).await.unwrap();
        assert_eq!(moved, 7);
        assert_eq!(sqlite.count().await.unwrap(), 7);
        assert_eq!(memory.count().await.unwrap(), 7);

        let (ok, missing) = verify(&memory, &sqlite).await.unwrap();
        assert!(ok);
        assert!(missing.is_empty());

        // Move semantics: the explicit flag empties the source.
        let moved = migrate(&memory, &sqlite, 3, true).await.unwrap();
        assert_eq!(moved, 7);
        assert_eq!(memory.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn verify_reports_missing_ids() {
        let source = MemoryStore::new();
        let target = MemoryStore::new();

        let copied = Datum::new(b"copied".to_vec());
        let forgotten = Datum::new(b"forgotten".to_vec());
        source.put(&copied).await.unwrap();
        source.put(&forgotten).await.unwrap();
        target.put(&copied).await.unwrap();

        let (ok, missing) = verify(&source, &target).await.unwrap();
        assert!(!ok);
        assert_eq!(missing, vec![forgotten.id]);
    }
}
