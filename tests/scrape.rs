//! Scrape-level scenarios: circuit breaker accounting and concurrent
//! scrape coalescing, run against scripted collectors and probes.

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use gg_exporter::collectors::{Collector, CollectorGroup};
use gg_exporter::config::{OrchestratorConfig, PerDbConfig, PerDbMode};
use gg_exporter::connection::{DbConnectionProvider, DbDatasourceFactory};
use gg_exporter::gg::{DatabaseProbe, GreengageVersion};
use gg_exporter::metrics::{ExporterMetrics, MeterRegistry};
use gg_exporter::orchestrator::CollectorOrchestrator;
use secrecy::SecretString;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

struct UpProbe;

impl DatabaseProbe for UpProbe {
    fn test_connection(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn detect_version(&self) -> BoxFuture<'_, Result<GreengageVersion>> {
        Box::pin(async { Ok(GreengageVersion::new(6, 26, 35, "test")) })
    }
}

struct ScriptedCollector {
    name: &'static str,
    fail: bool,
    delay: Option<Duration>,
    invocations: Arc<AtomicU32>,
}

impl ScriptedCollector {
    fn new(name: &'static str, fail: bool, delay: Option<Duration>) -> (Arc<Self>, Arc<AtomicU32>) {
        let invocations = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                name,
                fail,
                delay,
                invocations: invocations.clone(),
            }),
            invocations,
        )
    }
}

impl Collector for ScriptedCollector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::General
    }

    fn register(&self, _registry: &Arc<MeterRegistry>) -> Result<()> {
        Ok(())
    }

    fn collect<'a>(
        &'a self,
        _pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                Err(anyhow!("simulated collector failure"))
            } else {
                Ok(())
            }
        })
    }
}

fn harness(
    config: OrchestratorConfig,
    collectors: Vec<Arc<dyn Collector>>,
) -> (Arc<CollectorOrchestrator>, Arc<ExporterMetrics>) {
    let registry = MeterRegistry::new().unwrap();
    let metrics = Arc::new(ExporterMetrics::new(&registry).unwrap());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://gpadmin@localhost:5432/postgres")
        .unwrap();
    let dsn = SecretString::from("postgres://gpadmin@localhost:5432/postgres".to_string());
    let factory = DbDatasourceFactory::new(&dsn, Duration::from_secs(5)).unwrap();
    let provider = Arc::new(DbConnectionProvider::new(
        PerDbConfig {
            mode: PerDbMode::None,
            ..PerDbConfig::default()
        },
        factory,
    ));

    let orchestrator = Arc::new(CollectorOrchestrator::new(
        config,
        Arc::new(UpProbe),
        pool,
        provider,
        metrics.clone(),
        collectors,
    ));
    (orchestrator, metrics)
}

#[tokio::test]
async fn test_breaker_trips_at_threshold_of_three() {
    let (c1, n1) = ScriptedCollector::new("c1", true, None);
    let (c2, n2) = ScriptedCollector::new("c2", true, None);
    let (c3, n3) = ScriptedCollector::new("c3", true, None);
    let (c4, n4) = ScriptedCollector::new("c4", true, None);

    let (orchestrator, metrics) =
        harness(OrchestratorConfig::default(), vec![c1, c2, c3, c4]);
    orchestrator.scrape().await;

    assert_eq!(n1.load(Ordering::SeqCst), 1);
    assert_eq!(n2.load(Ordering::SeqCst), 1);
    assert_eq!(n3.load(Ordering::SeqCst), 1);
    assert_eq!(n4.load(Ordering::SeqCst), 0, "fourth collector must not run");

    // three collector errors plus the scrape-level error
    assert!(metrics.total_error_count() >= 3);
    assert_eq!(metrics.collector_error_count("c1"), 1);
    assert_eq!(metrics.collector_error_count("c4"), 0);
}

#[tokio::test]
async fn test_failures_below_threshold_do_not_abort() {
    let (bad, _) = ScriptedCollector::new("bad", true, None);
    let (good, good_runs) = ScriptedCollector::new("good", false, None);

    let (orchestrator, metrics) = harness(OrchestratorConfig::default(), vec![bad, good]);
    orchestrator.scrape().await;

    assert_eq!(good_runs.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.collector_error_count("bad"), 1);
    assert!(orchestrator.cached_scrape().is_some());
}

#[tokio::test]
async fn test_overlapping_scrapes_coalesce() {
    let (slow, invocations) =
        ScriptedCollector::new("slow", false, Some(Duration::from_millis(500)));
    let (orchestrator, metrics) = harness(OrchestratorConfig::default(), vec![slow]);

    let background = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.scrape().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // second scrape arrives while the first is still running
    let started = Instant::now();
    orchestrator.scrape().await;
    let returned_in = started.elapsed();

    background.await.unwrap();

    assert!(
        returned_in < Duration::from_millis(200),
        "coalesced caller took {returned_in:?}"
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "one scrape ran");
    assert_eq!(metrics.total_scraped_count(), 1, "one scrape was counted");
}

#[tokio::test]
async fn test_sequential_scrapes_both_run() {
    let (collector, invocations) = ScriptedCollector::new("steady", false, None);
    let (orchestrator, metrics) = harness(OrchestratorConfig::default(), vec![collector]);

    orchestrator.scrape().await;
    orchestrator.scrape().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.total_scraped_count(), 2);
    assert_eq!(metrics.total_error_count(), 0);
}
