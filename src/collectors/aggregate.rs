use crate::collectors::{Collector, CollectorGroup};
use crate::gg::GreengageVersion;
use crate::metrics::MeterRegistry;
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::PgPool;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

/// State shared between a collector and its gauge suppliers; swapped
/// atomically after each successful collection.
pub struct StateCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> StateCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
    }
}

/// Collector half of the aggregate contract: fetch a cluster-wide state
/// object and describe the fixed gauges reading it.
pub trait AggregateCollect: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn group(&self) -> CollectorGroup {
        CollectorGroup::General
    }

    fn fail_on_error(&self) -> bool {
        true
    }

    /// State published before the first collection.
    fn initial_state(&self) -> Self::State;

    /// Fetch the current state. `None` leaves the previous state in place
    /// (do not publish zeros on a partial read).
    fn collect_data<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<Option<Self::State>>>;

    /// Register the fixed gauge set once at startup; suppliers read the
    /// cell.
    fn register_metrics(
        &self,
        registry: &MeterRegistry,
        state: &Arc<StateCell<Self::State>>,
    ) -> Result<()>;
}

/// Drives an [`AggregateCollect`] implementation: collect, then swap the
/// state cell the registered suppliers read.
pub struct AggregateDriver<C: AggregateCollect> {
    inner: C,
    state: Arc<StateCell<C::State>>,
}

impl<C: AggregateCollect> AggregateDriver<C> {
    pub fn new(inner: C) -> Self {
        let state = Arc::new(StateCell::new(inner.initial_state()));
        Self { inner, state }
    }

    pub fn shared(inner: C) -> Arc<dyn Collector> {
        Arc::new(Self::new(inner))
    }
}

impl<C: AggregateCollect> Collector for AggregateDriver<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn group(&self) -> CollectorGroup {
        self.inner.group()
    }

    fn register(&self, registry: &Arc<MeterRegistry>) -> Result<()> {
        self.inner.register_metrics(registry, &self.state)
    }

    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.inner.collect_data(pool, version).await {
                Ok(Some(data)) => {
                    self.state.set(data);
                    Ok(())
                }
                Ok(None) => {
                    warn!(
                        "Collector {} returned no data, state not updated",
                        self.inner.name()
                    );
                    Ok(())
                }
                Err(e) => {
                    error!("Error collecting data for {}: {e}", self.inner.name());
                    if self.inner.fail_on_error() {
                        return Err(e);
                    }
                    debug!(
                        "Collector {} failed but continuing due to error handling policy",
                        self.inner.name()
                    );
                    Ok(())
                }
            }
        })
    }
}
