use crate::collectors::{Collector, CollectorGroup};
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tracing::{debug, error, warn};

/// Snapshot of tracked entities, replaced wholesale on every scrape.
/// Suppliers observe either the previous snapshot or the new one, never a
/// partial update.
pub struct EntityState<K, V> {
    entities: RwLock<Arc<HashMap<K, V>>>,
}

impl<K, V> EntityState<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, entities: HashMap<K, V>) {
        *self
            .entities
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(entities);
    }

    /// The latest value for `key`; `None` when the entity vanished between
    /// registration and this read.
    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for EntityState<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the current value of one entity; handed to per-entity metric
/// registration so gauges follow snapshot replacement without
/// re-registration.
pub type EntitySupplier<V> = Arc<dyn Fn() -> Option<V> + Send + Sync>;

/// Collector half of the per-entity contract: fetch a snapshot and describe
/// the metrics of a single entity. The driver owns registration caching,
/// snapshot replacement and deletion cleanup.
pub trait EntityCollect: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn group(&self) -> CollectorGroup {
        CollectorGroup::General
    }

    /// Remove metrics when their entity disappears from a snapshot. Enable
    /// for high-churn entities (lock rows, running vacuums, backup rows) to
    /// bound cardinality; stable entities keep their last value instead.
    fn remove_deleted_metrics(&self) -> bool {
        false
    }

    /// Whether a collection failure aborts this collector (and counts
    /// toward the orchestrator's breaker) or is logged and swallowed.
    fn fail_on_error(&self) -> bool {
        true
    }

    /// Fetch the complete current snapshot. Must not mutate shared state
    /// other than auxiliary rollup cells owned by the collector.
    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<Self::Key, Self::Value>>>;

    /// Register the metrics of one entity. Called once per key, on first
    /// observation. Returned meter ids are kept for deletion cleanup.
    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &Self::Key,
        supplier: EntitySupplier<Self::Value>,
    ) -> Result<Vec<MeterId>>;

    /// Register cross-entity rollups once at startup. Suppliers read the
    /// shared state directly.
    fn register_aggregate_metrics(
        &self,
        _registry: &MeterRegistry,
        _entities: &Arc<EntityState<Self::Key, Self::Value>>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Drives an [`EntityCollect`] implementation through the common
/// collection sequence: snapshot, cleanup of deleted keys, atomic replace,
/// lazy registration of unseen keys.
pub struct EntityDriver<C: EntityCollect> {
    inner: C,
    state: Arc<EntityState<C::Key, C::Value>>,
    registered: Mutex<HashSet<C::Key>>,
    meter_ids: Mutex<HashMap<C::Key, Vec<MeterId>>>,
    registry: OnceLock<Arc<MeterRegistry>>,
}

impl<C: EntityCollect> EntityDriver<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            state: Arc::new(EntityState::new()),
            registered: Mutex::new(HashSet::new()),
            meter_ids: Mutex::new(HashMap::new()),
            registry: OnceLock::new(),
        }
    }

    pub fn shared(inner: C) -> Arc<dyn Collector> {
        Arc::new(Self::new(inner))
    }

    async fn run(&self, pool: &PgPool, version: &GreengageVersion) -> Result<()> {
        let registry = self
            .registry
            .get()
            .ok_or_else(|| anyhow!("collector '{}' was not registered", self.inner.name()))?;

        let new_entities = match self.inner.collect_entities(pool, version).await {
            Ok(entities) => entities,
            Err(e) => {
                error!(
                    "Error collecting entities for {}: {e}",
                    self.inner.name()
                );
                if self.inner.fail_on_error() {
                    return Err(e);
                }
                debug!(
                    "Collector {} failed but continuing due to error handling policy",
                    self.inner.name()
                );
                return Ok(());
            }
        };

        if self.inner.remove_deleted_metrics() {
            self.remove_deleted(registry, &new_entities);
        }

        let new_keys: Vec<C::Key> = new_entities.keys().cloned().collect();
        self.state.replace(new_entities);

        for key in new_keys {
            let first_seen = self
                .registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.clone());
            if !first_seen {
                continue;
            }

            let supplier: EntitySupplier<C::Value> = {
                let state = self.state.clone();
                let key = key.clone();
                Arc::new(move || state.get(&key))
            };
            match self.inner.register_entity_metrics(registry, &key, supplier) {
                Ok(ids) => {
                    if self.inner.remove_deleted_metrics() && !ids.is_empty() {
                        self.meter_ids
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(key.clone(), ids);
                    }
                    debug!("Registered metrics for new entity: {key:?}");
                }
                Err(e) => {
                    warn!(
                        "Failed to register metrics for entity {key:?} in {}: {e}",
                        self.inner.name()
                    );
                    self.registered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&key);
                }
            }
        }

        Ok(())
    }

    /// Unregister the meters of every key present in the previous snapshot
    /// but absent from the new one. Individual removal failures are logged
    /// and do not stop the sweep.
    fn remove_deleted(&self, registry: &MeterRegistry, new_entities: &HashMap<C::Key, C::Value>) {
        let previous = self.state.snapshot();
        let deleted: Vec<C::Key> = previous
            .keys()
            .filter(|key| !new_entities.contains_key(key))
            .cloned()
            .collect();

        for key in deleted {
            let ids = self
                .meter_ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            if let Some(ids) = ids {
                let count = ids.len();
                for id in ids {
                    if let Err(e) = registry.remove(&id) {
                        warn!("Failed to remove meter {id:?} for deleted entity {key:?}: {e}");
                    }
                }
                debug!("Removed {count} metrics for deleted entity: {key:?}");
            }
            self.registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }
}

impl<C: EntityCollect> Collector for EntityDriver<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn group(&self) -> CollectorGroup {
        self.inner.group()
    }

    fn register(&self, registry: &Arc<MeterRegistry>) -> Result<()> {
        self.inner.register_aggregate_metrics(registry, &self.state)?;
        let _ = self.registry.set(registry.clone());
        Ok(())
    }

    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(pool, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn version() -> GreengageVersion {
        GreengageVersion::new(6, 26, 0, "test")
    }

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://gpadmin@localhost:5432/postgres")
            .unwrap()
    }

    /// Scripted collector: returns the next queued snapshot, or an error.
    struct Scripted {
        snapshots: Mutex<Vec<Result<HashMap<String, i64>>>>,
        cleanup: bool,
        fail_fast: bool,
    }

    impl Scripted {
        fn new(cleanup: bool) -> Self {
            Self {
                snapshots: Mutex::new(Vec::new()),
                cleanup,
                fail_fast: true,
            }
        }

        fn push(&self, entries: &[(&str, i64)]) {
            let map = entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect();
            self.snapshots.lock().unwrap().push(Ok(map));
        }

        fn push_error(&self) {
            self.snapshots
                .lock()
                .unwrap()
                .push(Err(anyhow!("simulated failure")));
        }
    }

    impl EntityCollect for Scripted {
        type Key = String;
        type Value = i64;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn remove_deleted_metrics(&self) -> bool {
            self.cleanup
        }

        fn fail_on_error(&self) -> bool {
            self.fail_fast
        }

        fn collect_entities<'a>(
            &'a self,
            _pool: &'a PgPool,
            _version: &'a GreengageVersion,
        ) -> BoxFuture<'a, Result<HashMap<String, i64>>> {
            Box::pin(async move {
                let mut queue = self.snapshots.lock().unwrap();
                if queue.is_empty() {
                    return Ok(HashMap::new());
                }
                queue.remove(0)
            })
        }

        fn register_entity_metrics(
            &self,
            registry: &MeterRegistry,
            key: &String,
            supplier: EntitySupplier<i64>,
        ) -> Result<Vec<MeterId>> {
            let id = registry.register_gauge(
                "scripted_value",
                "per-entity value",
                &[("key", key.as_str())],
                move || supplier().map_or(f64::NAN, |v| v as f64),
            )?;
            Ok(vec![id])
        }

        fn register_aggregate_metrics(
            &self,
            registry: &MeterRegistry,
            entities: &Arc<EntityState<String, i64>>,
        ) -> Result<()> {
            let entities = entities.clone();
            registry.register_gauge("scripted_total", "entity count", &[], move || {
                entities.len() as f64
            })?;
            Ok(())
        }
    }

    async fn drive(driver: &EntityDriver<Scripted>) {
        driver
            .collect(&lazy_pool(), &version())
            .await
            .expect("collect should succeed");
    }

    fn setup(cleanup: bool) -> (Arc<MeterRegistry>, EntityDriver<Scripted>) {
        let registry = Arc::new(MeterRegistry::new().unwrap());
        let driver = EntityDriver::new(Scripted::new(cleanup));
        driver.register(&registry).unwrap();
        (registry, driver)
    }

    #[tokio::test]
    async fn test_metrics_registered_once_per_key() {
        let (registry, driver) = setup(false);

        driver.inner.push(&[("a", 1), ("b", 2)]);
        drive(&driver).await;
        driver.inner.push(&[("a", 5), ("b", 6)]);
        drive(&driver).await;

        let text = registry.encode().unwrap();
        assert!(text.contains("scripted_value{key=\"a\"} 5"));
        assert!(text.contains("scripted_value{key=\"b\"} 6"));
        assert!(text.contains("scripted_total 2"));
    }

    #[tokio::test]
    async fn test_suppliers_observe_replaced_snapshot() {
        let (registry, driver) = setup(false);

        driver.inner.push(&[("a", 1)]);
        drive(&driver).await;
        assert!(registry.encode().unwrap().contains("scripted_value{key=\"a\"} 1"));

        driver.inner.push(&[("a", 42)]);
        drive(&driver).await;
        assert!(registry.encode().unwrap().contains("scripted_value{key=\"a\"} 42"));
    }

    #[tokio::test]
    async fn test_without_cleanup_stale_keys_keep_last_nan() {
        let (registry, driver) = setup(false);

        driver.inner.push(&[("a", 1), ("b", 2)]);
        drive(&driver).await;
        driver.inner.push(&[("a", 1)]);
        drive(&driver).await;

        // the meter stays registered; its supplier reads a vanished entity
        let text = registry.encode().unwrap();
        assert!(text.contains("scripted_value{key=\"b\"} NaN"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_deleted_entities() {
        let (registry, driver) = setup(true);

        driver.inner.push(&[("a", 1), ("b", 2)]);
        drive(&driver).await;
        driver.inner.push(&[("c", 3)]);
        drive(&driver).await;

        let text = registry.encode().unwrap();
        assert!(!text.contains("key=\"a\""));
        assert!(!text.contains("key=\"b\""));
        assert!(text.contains("scripted_value{key=\"c\"} 3"));
    }

    #[tokio::test]
    async fn test_cleanup_reregisters_returning_entities() {
        let (registry, driver) = setup(true);

        driver.inner.push(&[("a", 1)]);
        drive(&driver).await;
        driver.inner.push(&[]);
        drive(&driver).await;
        assert!(!registry.encode().unwrap().contains("key=\"a\""));

        driver.inner.push(&[("a", 9)]);
        drive(&driver).await;
        assert!(registry.encode().unwrap().contains("scripted_value{key=\"a\"} 9"));
    }

    #[tokio::test]
    async fn test_fail_fast_propagates_and_keeps_state() {
        let (registry, driver) = setup(false);

        driver.inner.push(&[("a", 7)]);
        drive(&driver).await;

        driver.inner.push_error();
        let result = driver.collect(&lazy_pool(), &version()).await;
        assert!(result.is_err());

        // previous values remain readable
        assert!(registry.encode().unwrap().contains("scripted_value{key=\"a\"} 7"));
    }

    #[tokio::test]
    async fn test_fail_soft_swallows_error() {
        let registry = Arc::new(MeterRegistry::new().unwrap());
        let mut inner = Scripted::new(false);
        inner.fail_fast = false;
        let driver = EntityDriver::new(inner);
        driver.register(&registry).unwrap();

        driver.inner.push_error();
        let result = driver.collect(&lazy_pool(), &version()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_collect_before_register_fails() {
        let driver = EntityDriver::new(Scripted::new(false));
        let result = driver.collect(&lazy_pool(), &version()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_entity_state_get_after_replace() {
        let state: EntityState<String, i64> = EntityState::new();
        let flag = AtomicBool::new(false);

        state.replace(HashMap::from([("k".to_string(), 1)]));
        assert_eq!(state.get(&"k".to_string()), Some(1));
        flag.store(true, Ordering::SeqCst);

        state.replace(HashMap::new());
        assert_eq!(state.get(&"k".to_string()), None);
        assert!(state.is_empty());
    }
}
