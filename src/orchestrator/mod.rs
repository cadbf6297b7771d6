use crate::collectors::{Collector, CollectorGroup};
use crate::config::OrchestratorConfig;
use crate::connection::DbConnectionProvider;
use crate::gg::{DatabaseProbe, GreengageVersion};
use crate::metrics::ExporterMetrics;
use sqlx::PgPool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument as _;

mod result;

pub use result::ScrapeResult;

/// A scrape aborted early.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(
        "too many collector failures ({failures}), circuit breaker triggered - \
         assuming database issue"
    )]
    CircuitTripped { failures: u32 },
}

/// Running failure count for one scrape, checked against the breaker
/// threshold after every collector failure.
struct ExecutionContext {
    failures: u32,
    failure_threshold: u32,
    circuit_breaker_enabled: bool,
}

/// Drives all enabled collectors once per scheduler tick.
///
/// Concurrent `scrape` calls coalesce: while one scrape runs, others return
/// immediately, satisfied by the cached result when it is fresh enough.
/// The HTTP exposition reads the registry and never waits on a scrape.
pub struct CollectorOrchestrator {
    config: OrchestratorConfig,
    probe: Arc<dyn DatabaseProbe>,
    pool: PgPool,
    provider: Arc<DbConnectionProvider>,
    metrics: Arc<ExporterMetrics>,
    general: Vec<Arc<dyn Collector>>,
    per_db: Vec<Arc<dyn Collector>>,
    scrape_lock: tokio::sync::Mutex<()>,
    last_successful_scrape: Mutex<Option<ScrapeResult>>,
}

impl CollectorOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        probe: Arc<dyn DatabaseProbe>,
        pool: PgPool,
        provider: Arc<DbConnectionProvider>,
        metrics: Arc<ExporterMetrics>,
        collectors: Vec<Arc<dyn Collector>>,
    ) -> Self {
        let (per_db, general): (Vec<_>, Vec<_>) = collectors
            .into_iter()
            .partition(|c| c.group() == CollectorGroup::PerDb);

        info!(
            "Collector group 'general' has {} enabled collectors",
            general.len()
        );
        info!(
            "Collector group 'per_db' has {} enabled collectors",
            per_db.len()
        );

        Self {
            config,
            probe,
            pool,
            provider,
            metrics,
            general,
            per_db,
            scrape_lock: tokio::sync::Mutex::new(()),
            last_successful_scrape: Mutex::new(None),
        }
    }

    pub fn active_collector_count(&self) -> usize {
        self.general.len() + self.per_db.len()
    }

    /// Run one scrape, or coalesce onto the scrape already in progress.
    pub async fn scrape(&self) {
        let Ok(_guard) = self.scrape_lock.try_lock() else {
            debug!("Scrape already in progress");
            let cached = *self
                .last_successful_scrape
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cached {
                if !cached.is_stale(self.config.scrape_cache_max_age) {
                    debug!("Returning cached scrape from {:?} ago", cached.age());
                    return;
                }
            }
            warn!("No valid cached scrape available, waiting for current scrape to complete");
            return;
        };

        let result = self.perform_scrape().await;
        if result.is_successful() {
            self.last_successful_scrape
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(result);
            debug!("Scrape successful, cached for future use");
        }
    }

    pub fn cached_scrape(&self) -> Option<ScrapeResult> {
        *self
            .last_successful_scrape
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn perform_scrape(&self) -> ScrapeResult {
        let start = Instant::now();
        self.metrics.increment_total_scraped();
        debug!("Starting scrape");

        let result = match self.verify_database_and_version().await {
            Some(version) => match self.collect_from_all(&version).await {
                Ok(()) => ScrapeResult::successful(start),
                Err(e) => {
                    error!("Database error during scrape: {e}");
                    self.metrics.set_greengage_up(false);
                    self.metrics.increment_total_error();
                    ScrapeResult::failed(start)
                }
            },
            None => ScrapeResult::failed(start),
        };

        let duration = start.elapsed();
        self.metrics.record_scrape_duration(duration);
        debug!("Scrape completed in {} ms", duration.as_millis());
        result
    }

    /// Verify phase: connectivity with `delay × attempt` backoff, then
    /// version detection. Sets `greengage_up` either way.
    async fn verify_database_and_version(&self) -> Option<GreengageVersion> {
        let max_attempts = self.config.connection_retry_attempts;
        let retry_delay = self.config.connection_retry_delay;

        for attempt in 1..=max_attempts {
            if !self.probe.test_connection().await {
                if attempt < max_attempts {
                    let backoff = retry_delay * attempt;
                    warn!(
                        "Database connection test failed (attempt {attempt}/{max_attempts}), \
                         retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                error!("Database connection test failed after {max_attempts} attempts");
                self.metrics.set_greengage_up(false);
                self.metrics.increment_total_error();
                return None;
            }

            match self.probe.detect_version().await {
                Ok(version) => {
                    self.metrics.set_greengage_up(true);
                    if attempt > 1 {
                        info!("Database connection restored after {attempt} attempts");
                    }
                    return Some(version);
                }
                Err(e) => {
                    error!("Failed to detect Greengage version: {e}");
                    self.metrics.set_greengage_up(false);
                    self.metrics.increment_total_error();
                    return None;
                }
            }
        }

        None
    }

    async fn collect_from_all(&self, version: &GreengageVersion) -> Result<(), ScrapeError> {
        let mut context = ExecutionContext {
            failures: 0,
            failure_threshold: self.config.collector_failure_threshold,
            circuit_breaker_enabled: self.config.circuit_breaker_enabled,
        };

        let result = match self.execute_general_collectors(version, &mut context).await {
            Ok(()) => self.execute_per_db_collectors(version, &mut context).await,
            Err(e) => Err(e),
        };

        if context.failures > 0 {
            warn!("Scrape completed with {} collector failures", context.failures);
        }
        result
    }

    async fn execute_general_collectors(
        &self,
        version: &GreengageVersion,
        context: &mut ExecutionContext,
    ) -> Result<(), ScrapeError> {
        for collector in &self.general {
            self.execute_collector(collector, &self.pool, version, context, "")
                .await?;
        }
        Ok(())
    }

    /// Databases outer, collectors inner: all per-db collectors finish for
    /// one database before the next is visited. Temporary datasources are
    /// released even when the circuit breaker fires mid-iteration.
    async fn execute_per_db_collectors(
        &self,
        version: &GreengageVersion,
        context: &mut ExecutionContext,
    ) -> Result<(), ScrapeError> {
        if self.per_db.is_empty() {
            return Ok(());
        }

        let datasources = self.provider.datasources(&self.pool).await;
        let mut result = Ok(());

        'databases: for (database, pool) in &datasources {
            let suffix = format!(" (per-database: {database})");
            for collector in &self.per_db {
                if let Err(e) = self
                    .execute_collector(collector, pool, version, context, &suffix)
                    .await
                {
                    result = Err(e);
                    break 'databases;
                }
            }
        }

        self.provider.cleanup().await;
        result
    }

    async fn execute_collector(
        &self,
        collector: &Arc<dyn Collector>,
        pool: &PgPool,
        version: &GreengageVersion,
        context: &mut ExecutionContext,
        log_suffix: &str,
    ) -> Result<(), ScrapeError> {
        let collection_start = Instant::now();
        debug!("Collecting metrics from: {}{log_suffix}", collector.name());

        let span = info_span!("collector.collect", collector = %collector.name());
        let result = match collector.collect(pool, version).instrument(span).await {
            Ok(()) => Ok(()),
            Err(e) => self.handle_collector_failure(collector.name(), context, &e, log_suffix),
        };

        debug!(
            "Collector {}{log_suffix} completed in {} ms",
            collector.name(),
            collection_start.elapsed().as_millis()
        );
        result
    }

    fn handle_collector_failure(
        &self,
        name: &str,
        context: &mut ExecutionContext,
        error: &anyhow::Error,
        log_suffix: &str,
    ) -> Result<(), ScrapeError> {
        context.failures += 1;
        error!(
            "Error collecting metrics from {name}{log_suffix} ({}/{} failures): {error}",
            context.failures, context.failure_threshold
        );
        self.metrics.increment_total_error();
        self.metrics.increment_collector_error(name);

        if context.circuit_breaker_enabled && context.failures >= context.failure_threshold {
            error!(
                "Too many collector failures ({}), circuit breaker triggered - \
                 assuming database issue, stopping remaining collectors",
                context.failures
            );
            return Err(ScrapeError::CircuitTripped {
                failures: context.failures,
            });
        }
        Ok(())
    }
}
