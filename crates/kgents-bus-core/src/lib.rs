#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-bus-core** – In-process change bus for kgents.
//!
//! Every mutation of the datum store surfaces here as a [`DataEvent`].
//! The [`DataBus`] fans events out to subscribers on detached tasks, keeps
//! a bounded replay buffer for late joiners, and isolates subscriber
//! failures so one broken handler never starves the rest.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use kgents_store_core::{clock, Datum, DatumStore, Metadata, StoreError};

//─────────────────────────────
//  Data events
//─────────────────────────────

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEventType {
    /// A datum was stored.
    Put,
    /// A datum was removed.
    Delete,
    /// A datum was promoted to a more durable tier.
    Upgrade,
    /// A datum was demoted (graceful degradation).
    Degrade,
}

/// An immutable record of a data change.
///
/// `causal_parent` links successive emissions from the same logical
/// emitter; it is distinct from a datum's own causal lineage. The bus
/// never assigns it - emitters that want linkage thread it themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Random event identity.
    pub event_id: String,
    /// Kind of mutation.
    pub event_type: DataEventType,
    /// The datum the mutation touched.
    pub datum_id: String,
    /// Seconds since the Unix epoch at emission.
    pub timestamp: f64,
    /// Label of the emitting component.
    pub source: String,
    /// Previous event id from the same emitter, if any.
    pub causal_parent: Option<String>,
    /// Free-form annotations.
    pub metadata: Metadata,
}

impl DataEvent {
    /// Create an event with a fresh id and the current timestamp.
    pub fn new(event_type: DataEventType, datum_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            event_type,
            datum_id: datum_id.into(),
            timestamp: clock::now(),
            source: "store".to_string(),
            causal_parent: None,
            metadata: Metadata::new(),
        }
    }

    /// Set the emitter label.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Link to the emitter's previous event.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.causal_parent = Some(parent.into());
        self
    }

    /// Attach annotations.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

//─────────────────────────────
//  Subscribers
//─────────────────────────────

/// An async event callback. Errors are captured by the bus and counted,
/// never propagated to the emitter.
pub type EventHandler = Arc<dyn Fn(DataEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(DataEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

struct Subscriber {
    id: Uuid,
    handler: EventHandler,
}

#[derive(Default)]
struct SubscriberSet {
    by_type: HashMap<DataEventType, Vec<Subscriber>>,
    all: Vec<Subscriber>,
}

impl SubscriberSet {
    fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum::<usize>() + self.all.len()
    }
}

/// Cancel handle returned by the subscribe calls.
///
/// Holds only a weak reference to the bus, so a forgotten handle never
/// keeps it alive. Dropping the handle without calling
/// [`unsubscribe`](Subscription::unsubscribe) leaves the subscription in
/// place.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: Uuid,
    event_type: Option<DataEventType>,
}

impl Subscription {
    /// Stop receiving events.
    pub fn unsubscribe(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut subs = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        match self.event_type {
            Some(event_type) => {
                if let Some(list) = subs.by_type.get_mut(&event_type) {
                    list.retain(|s| s.id != self.id);
                }
            }
            None => subs.all.retain(|s| s.id != self.id),
        }
    }
}

//─────────────────────────────
//  The bus
//─────────────────────────────

/// Default replay buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Counters reported by [`DataBus::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Events currently held for replay.
    pub buffer_size: usize,
    /// Events emitted over the bus lifetime.
    pub total_emitted: u64,
    /// Subscriber failures captured so far.
    pub total_errors: u64,
    /// Registered subscribers.
    pub subscriber_count: usize,
}

struct BusInner {
    capacity: usize,
    buffer: Mutex<VecDeque<DataEvent>>,
    subscribers: StdMutex<SubscriberSet>,
    emitted: AtomicU64,
    errors: AtomicU64,
}

/// Central in-process publish/subscribe channel for data events.
///
/// Emission is non-blocking: the replay buffer is updated under a short
/// lock, then every matching handler runs on its own detached task.
/// Different subscribers may therefore observe the same event at
/// different times, but each subscriber sees events in emit order.
#[derive(Clone)]
pub struct DataBus {
    inner: Arc<BusInner>,
}

impl Default for DataBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl DataBus {
    /// Create a bus with the given replay buffer capacity. On overflow
    /// the oldest buffered event is dropped.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: buffer_size.max(1),
                buffer: Mutex::new(VecDeque::new()),
                subscribers: StdMutex::new(SubscriberSet::default()),
                emitted: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to events of one type. Returns a cancel handle.
    pub fn subscribe(&self, event_type: DataEventType, handler: EventHandler) -> Subscription {
        let id = Uuid::new_v4();
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.by_type
            .entry(event_type)
            .or_default()
            .push(Subscriber { id, handler });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            event_type: Some(event_type),
        }
    }

    /// Subscribe to every event type. Returns a cancel handle.
    pub fn subscribe_all(&self, handler: EventHandler) -> Subscription {
        let id = Uuid::new_v4();
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.all.push(Subscriber { id, handler });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            event_type: None,
        }
    }

    /// Emit an event: buffer it, then dispatch to every matching
    /// subscriber on a detached task. Never waits on subscriber work.
    pub async fn emit(&self, event: DataEvent) {
        {
            let mut buffer = self.inner.buffer.lock().await;
            if buffer.len() == self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<EventHandler> = {
            let subs = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subs.by_type
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            let event = event.clone();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                // Run the handler on its own task so a panic is contained
                // alongside ordinary errors.
                let outcome = tokio::spawn(handler(event)).await;
                if !matches!(outcome, Ok(Ok(()))) {
                    inner.errors.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    }

    /// Replay buffered events to a handler, oldest first.
    ///
    /// `since` keeps only events at or after the timestamp; `event_type`
    /// keeps only one kind. The handler runs inline; its first error
    /// aborts the replay. Returns how many events were delivered.
    pub async fn replay(
        &self,
        handler: EventHandler,
        since: Option<f64>,
        event_type: Option<DataEventType>,
    ) -> anyhow::Result<usize> {
        let events: Vec<DataEvent> = {
            let buffer = self.inner.buffer.lock().await;
            buffer
                .iter()
                .filter(|e| since.map_or(true, |s| e.timestamp >= s))
                .filter(|e| event_type.map_or(true, |t| e.event_type == t))
                .cloned()
                .collect()
        };

        let mut count = 0;
        for event in events {
            handler(event).await?;
            count += 1;
        }
        Ok(count)
    }

    /// The most recently emitted event still in the buffer.
    pub async fn latest(&self) -> Option<DataEvent> {
        self.inner.buffer.lock().await.back().cloned()
    }

    /// Current bus counters.
    pub async fn stats(&self) -> BusStats {
        let buffer_size = self.inner.buffer.lock().await.len();
        let subscriber_count = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        BusStats {
            buffer_size,
            total_emitted: self.inner.emitted.load(Ordering::Relaxed),
            total_errors: self.inner.errors.load(Ordering::Relaxed),
            subscriber_count,
        }
    }

    /// Drop all subscribers, buffered events, and counters.
    pub async fn clear(&self) {
        self.inner.buffer.lock().await.clear();
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.by_type.clear();
        subs.all.clear();
        self.inner.emitted.store(0, Ordering::Relaxed);
        self.inner.errors.store(0, Ordering::Relaxed);
    }
}

//─────────────────────────────
//  Global bus singleton
//─────────────────────────────

static GLOBAL_BUS: Lazy<StdMutex<Option<DataBus>>> = Lazy::new(|| StdMutex::new(None));

/// The process-wide bus, created lazily.
///
/// Components should still accept a bus by construction; this accessor is
/// a convenience for wiring at the edges.
pub fn data_bus() -> DataBus {
    let mut slot = GLOBAL_BUS.lock().unwrap_or_else(|e| e.into_inner());
    slot.get_or_insert_with(DataBus::default).clone()
}

/// Forget the process-wide bus so the next [`data_bus`] call starts
/// fresh. For tests.
pub fn reset_data_bus() {
    let mut slot = GLOBAL_BUS.lock().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

//─────────────────────────────
//  Bus-enabled store wrapper
//─────────────────────────────

/// Wraps any [`DatumStore`] and emits a bus event for every mutation.
///
/// Successive events from one wrapper are causally linked: each carries
/// the previous event's id as its `causal_parent`. Reads pass through
/// silently.
pub struct BusEnabledStore {
    inner: Arc<dyn DatumStore>,
    bus: DataBus,
    source: String,
    last_event_id: Mutex<Option<String>>,
}

impl BusEnabledStore {
    /// Wrap a store, labelling emitted events with `source`.
    pub fn new(inner: Arc<dyn DatumStore>, bus: DataBus, source: impl Into<String>) -> Self {
        Self {
            inner,
            bus,
            source: source.into(),
            last_event_id: Mutex::new(None),
        }
    }

    /// The bus this wrapper emits to.
    pub fn bus(&self) -> &DataBus {
        &self.bus
    }

    async fn emit_linked(&self, mut event: DataEvent) {
        let mut last = self.last_event_id.lock().await;
        if let Some(parent) = last.clone() {
            event = event.with_parent(parent);
        }
        let event_id = event.event_id.clone();
        self.bus.emit(event).await;
        *last = Some(event_id);
    }
}

#[async_trait::async_trait]
impl DatumStore for BusEnabledStore {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        let id = self.inner.put(datum).await?;
        let event = DataEvent::new(DataEventType::Put, id.clone())
            .with_source(self.source.clone())
            .with_metadata(datum.metadata.clone());
        self.emit_linked(event).await;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.inner.delete(id).await?;
        if existed {
            let event =
                DataEvent::new(DataEventType::Delete, id).with_source(self.source.clone());
            self.emit_linked(event).await;
        }
        Ok(existed)
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError> {
        self.inner.list(prefix, after, limit).await
    }

    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError> {
        self.inner.causal_chain(id).await
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.exists(id).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn query(&self, query: &kgents_store_core::Query) -> Result<Vec<Datum>, StoreError> {
        self.inner.query(query).await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn stats(&self) -> Result<kgents_store_core::StoreStats, StoreError> {
        self.inner.stats().await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
