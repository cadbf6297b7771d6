//! Lifecycle of per-entity metrics under churn, driven through the public
//! entity-collector surface the same way the orchestrator drives real
//! collectors.

use anyhow::Result;
use futures::future::BoxFuture;
use gg_exporter::collectors::Collector;
use gg_exporter::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use gg_exporter::gg::GreengageVersion;
use gg_exporter::metrics::{MeterId, MeterRegistry};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Vacuum-process shaped collector: keys are `db.pid.user`, snapshots are
/// scripted per scrape, finished processes are unregistered.
struct ChurningVacuums {
    snapshots: Mutex<Vec<HashMap<String, i64>>>,
}

impl ChurningVacuums {
    fn new(snapshots: Vec<&[(&str, i64)]>) -> Self {
        let snapshots = snapshots
            .into_iter()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), *v))
                    .collect()
            })
            .collect();
        Self {
            snapshots: Mutex::new(snapshots),
        }
    }
}

impl EntityCollect for ChurningVacuums {
    type Key = String;
    type Value = i64;

    fn name(&self) -> &'static str {
        "churning_vacuums"
    }

    fn remove_deleted_metrics(&self) -> bool {
        true
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
            Ok(queue.remove(0))
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &String,
        supplier: EntitySupplier<i64>,
    ) -> Result<Vec<MeterId>> {
        let pid = key.split('.').nth(1).unwrap_or("0").to_string();
        let id = registry.register_gauge(
            "vacuum_seconds_running",
            "seconds the vacuum has been running",
            &[("pid", &pid)],
            move || supplier().map_or(0.0, |v| v as f64),
        )?;
        Ok(vec![id])
    }
}

fn lazy_pool() -> PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://gpadmin@localhost:5432/postgres")
        .unwrap()
}

fn version() -> GreengageVersion {
    GreengageVersion::new(6, 26, 35, "test")
}

#[tokio::test]
async fn test_finished_vacuums_are_unregistered() {
    let registry = Arc::new(MeterRegistry::new().unwrap());
    let driver = EntityDriver::new(ChurningVacuums::new(vec![
        &[("A.100.gpadmin", 10), ("A.101.gpadmin", 20)],
        &[("A.102.gpadmin", 5)],
    ]));
    driver.register(&registry).unwrap();

    let pool = lazy_pool();
    driver.collect(&pool, &version()).await.unwrap();

    let text = registry.encode().unwrap();
    assert!(text.contains("vacuum_seconds_running{pid=\"100\"} 10"));
    assert!(text.contains("vacuum_seconds_running{pid=\"101\"} 20"));

    driver.collect(&pool, &version()).await.unwrap();

    let text = registry.encode().unwrap();
    assert!(text.contains("vacuum_seconds_running{pid=\"102\"} 5"));
    assert!(!text.contains("pid=\"100\""));
    assert!(!text.contains("pid=\"101\""));
}

#[tokio::test]
async fn test_identity_registered_once_across_scrapes() {
    let registry = Arc::new(MeterRegistry::new().unwrap());
    let driver = EntityDriver::new(ChurningVacuums::new(vec![
        &[("A.100.gpadmin", 10)],
        &[("A.100.gpadmin", 60)],
        &[("A.100.gpadmin", 120)],
    ]));
    driver.register(&registry).unwrap();

    let pool = lazy_pool();
    for _ in 0..3 {
        driver.collect(&pool, &version()).await.unwrap();
    }

    let text = registry.encode().unwrap();
    let series: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("vacuum_seconds_running{"))
        .collect();
    assert_eq!(series.len(), 1, "one series per identity: {series:?}");
    assert!(series[0].ends_with(" 120"));
}

#[tokio::test]
async fn test_empty_snapshot_clears_everything() {
    let registry = Arc::new(MeterRegistry::new().unwrap());
    let driver = EntityDriver::new(ChurningVacuums::new(vec![
        &[("A.100.gpadmin", 10), ("B.200.etl", 99)],
        &[],
    ]));
    driver.register(&registry).unwrap();

    let pool = lazy_pool();
    driver.collect(&pool, &version()).await.unwrap();
    driver.collect(&pool, &version()).await.unwrap();

    let text = registry.encode().unwrap();
    assert!(
        !text
            .lines()
            .any(|l| l.starts_with("vacuum_seconds_running{")),
        "all series should be gone after an empty snapshot"
    );
}
