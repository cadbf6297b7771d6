use crate::collectors::entity::{EntityCollect, EntityDriver, EntityState, EntitySupplier};
use crate::collectors::{Collector, util};
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

const QUERY_WAITING_COUNT_SQL: &str =
    "SELECT count(*) AS waiting_count FROM pg_locks WHERE NOT granted";

const LOCKED_SESSIONS_SQL_V6: &str = r"
    SELECT l.locktype AS lock_type,
           COUNT(*)   AS locked_sessions_count
    FROM pg_locks l
             JOIN pg_stat_activity a ON a.pid = l.pid
    WHERE a.waiting
      AND NOT l.granted
    GROUP BY l.locktype
    ORDER BY lock_type";

const LOCKED_SESSIONS_SQL_V7: &str = r"
    SELECT l.locktype AS lock_type,
           COUNT(*)   AS locked_sessions_count
    FROM pg_locks l
             JOIN pg_stat_activity a ON a.pid = l.pid
    WHERE a.wait_event_type = 'Lock'
    GROUP BY l.locktype
    ORDER BY lock_type";

#[derive(Clone, Debug)]
pub struct LockTypeStats {
    pub count: i64,
}

/// Sessions waiting on locks, grouped by lock type, plus the total count
/// of queries waiting for any lock. Lock types are a stable key set
/// (relation, tuple, transactionid, ...), so no deletion cleanup.
pub struct LockedSessionsCollector {
    waiting_count: Arc<AtomicI64>,
}

impl LockedSessionsCollector {
    pub fn new() -> Self {
        Self {
            waiting_count: Arc::new(AtomicI64::new(0)),
        }
    }
}

impl Default for LockedSessionsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for LockedSessionsCollector {
    type Key = String;
    type Value = LockTypeStats;

    fn name(&self) -> &'static str {
        "locked_sessions"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, LockTypeStats>>> {
        Box::pin(async move {
            debug!("Collecting locked sessions");

            let waiting: i64 = sqlx::query_scalar(QUERY_WAITING_COUNT_SQL)
                .fetch_one(pool)
                .await?;
            self.waiting_count.store(waiting, Ordering::Relaxed);

            let sql = if version.is_at_least_v7() {
                LOCKED_SESSIONS_SQL_V7
            } else {
                LOCKED_SESSIONS_SQL_V6
            };

            let rows = sqlx::query(sql).fetch_all(pool).await?;
            let mut lock_stats = HashMap::with_capacity(rows.len());
            for row in rows {
                let lock_type = match row.try_get::<Option<String>, _>("lock_type")? {
                    Some(t) if !t.is_empty() => t,
                    _ => util::UNKNOWN.to_string(),
                };
                let count: i64 = row.try_get("locked_sessions_count")?;
                lock_stats.insert(lock_type, LockTypeStats { count });
            }

            debug!("Collected locked sessions for {} lock types", lock_stats.len());
            Ok(lock_stats)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        lock_type: &String,
        supplier: EntitySupplier<LockTypeStats>,
    ) -> Result<Vec<MeterId>> {
        let id = registry.register_gauge(
            "greengage_server_locked_sessions_count",
            "Number of locked sessions by lock type",
            &[("lock_type", lock_type)],
            move || supplier().map_or(0.0, |s| s.count as f64),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        entities: &Arc<EntityState<String, LockTypeStats>>,
    ) -> Result<()> {
        let waiting = self.waiting_count.clone();
        registry.register_gauge(
            "greengage_cluster_query_waiting_count",
            "Total number of queries waiting for locks (all types)",
            &[],
            move || waiting.load(Ordering::Relaxed) as f64,
        )?;

        let state = entities.clone();
        registry.register_gauge(
            "greengage_server_locked_sessions_total",
            "Total number of locked sessions across all lock types",
            &[],
            move || state.snapshot().values().map(|s| s.count as f64).sum(),
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(LockedSessionsCollector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_expose_waiting_and_total() {
        let registry = MeterRegistry::new().unwrap();
        let collector = LockedSessionsCollector::new();
        let entities: Arc<EntityState<String, LockTypeStats>> = Arc::new(EntityState::new());
        collector
            .register_aggregate_metrics(&registry, &entities)
            .unwrap();

        collector.waiting_count.store(5, Ordering::Relaxed);
        entities.replace(HashMap::from([
            ("relation".to_string(), LockTypeStats { count: 2 }),
            ("tuple".to_string(), LockTypeStats { count: 3 }),
        ]));

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_cluster_query_waiting_count 5"));
        assert!(text.contains("greengage_server_locked_sessions_total 5"));
    }

    #[test]
    fn test_entity_gauge_by_lock_type() {
        let registry = MeterRegistry::new().unwrap();
        let entities: Arc<EntityState<String, LockTypeStats>> = Arc::new(EntityState::new());
        entities.replace(HashMap::from([(
            "relation".to_string(),
            LockTypeStats { count: 2 },
        )]));

        let state = entities.clone();
        let supplier: EntitySupplier<LockTypeStats> =
            Arc::new(move || state.get(&"relation".to_string()));
        LockedSessionsCollector::new()
            .register_entity_metrics(&registry, &"relation".to_string(), supplier)
            .unwrap();

        assert!(
            registry
                .encode()
                .unwrap()
                .contains("greengage_server_locked_sessions_count{lock_type=\"relation\"} 2")
        );
    }
}
