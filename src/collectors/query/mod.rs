use crate::collectors::entity::{EntityCollect, EntityDriver, EntityState, EntitySupplier};
use crate::collectors::Collector;
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fixed duration buckets for active queries; autovacuum workers are not
/// counted.
const ACTIVE_QUERY_DURATION_SQL: &str = r"
    WITH q AS (
        SELECT EXTRACT(EPOCH FROM (now() - query_start)) AS duration_seconds
        FROM pg_stat_activity
        WHERE pid <> pg_backend_pid()
          AND state = 'active'
          AND application_name <> 'autovacuum'
    )
    SELECT count(*)::bigint AS total_active_queries,
           COALESCE(sum(CASE WHEN duration_seconds >= 0 AND duration_seconds < 10 THEN 1 ELSE 0 END), 0)::bigint    AS cnt_0_10,
           COALESCE(sum(CASE WHEN duration_seconds >= 10 AND duration_seconds < 60 THEN 1 ELSE 0 END), 0)::bigint   AS cnt_10_60,
           COALESCE(sum(CASE WHEN duration_seconds >= 60 AND duration_seconds < 180 THEN 1 ELSE 0 END), 0)::bigint  AS cnt_60_180,
           COALESCE(sum(CASE WHEN duration_seconds >= 180 AND duration_seconds < 600 THEN 1 ELSE 0 END), 0)::bigint AS cnt_180_600,
           COALESCE(sum(CASE WHEN duration_seconds >= 600 THEN 1 ELSE 0 END), 0)::bigint                            AS cnt_600_plus
    FROM q";

const BUCKETS: &[(&str, &str)] = &[
    ("0_10", "cnt_0_10"),
    ("10_60", "cnt_10_60"),
    ("60_180", "cnt_60_180"),
    ("180_600", "cnt_180_600"),
    ("600_plus", "cnt_600_plus"),
];

#[derive(Clone, Debug)]
pub struct QueryDurationStats {
    pub bucket: String,
    pub count: i64,
}

/// Active query counts by duration bucket; surfaces long-running queries
/// without tracking individual pids.
pub struct ActiveQueryDurationCollector;

impl EntityCollect for ActiveQueryDurationCollector {
    type Key = String;
    type Value = QueryDurationStats;

    fn name(&self) -> &'static str {
        "active_query_duration"
    }

    fn fail_on_error(&self) -> bool {
        false
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, QueryDurationStats>>> {
        Box::pin(async move {
            debug!("Collecting active query duration statistics");

            let row = sqlx::query(ACTIVE_QUERY_DURATION_SQL).fetch_one(pool).await?;
            let mut buckets = HashMap::with_capacity(BUCKETS.len());
            for (bucket, column) in BUCKETS {
                let count: i64 = row.try_get(*column)?;
                buckets.insert(
                    (*bucket).to_string(),
                    QueryDurationStats {
                        bucket: (*bucket).to_string(),
                        count,
                    },
                );
            }

            debug!("Collected {} duration buckets", buckets.len());
            Ok(buckets)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        bucket: &String,
        supplier: EntitySupplier<QueryDurationStats>,
    ) -> Result<Vec<MeterId>> {
        let help = format!(
            "Number of active queries in duration bucket {bucket} seconds"
        );
        let id = registry.register_gauge(
            "greengage_query_active_queries_duration_bucket",
            &help,
            &[("bucket", bucket)],
            move || supplier().map_or(0.0, |s| s.count as f64),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        entities: &Arc<EntityState<String, QueryDurationStats>>,
    ) -> Result<()> {
        let state = entities.clone();
        registry.register_gauge(
            "greengage_query_active_queries_total",
            "Total number of active queries (all duration buckets)",
            &[],
            move || state.snapshot().values().map(|s| s.count as f64).sum(),
        )?;

        let state = entities.clone();
        registry.register_gauge(
            "greengage_query_active_queries_slow",
            "Number of slow active queries (duration > 180 seconds)",
            &[],
            move || {
                let snapshot = state.snapshot();
                ["180_600", "600_plus"]
                    .iter()
                    .filter_map(|bucket| snapshot.get(*bucket))
                    .map(|s| s.count as f64)
                    .sum()
            },
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(ActiveQueryDurationCollector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str, count: i64) -> (String, QueryDurationStats) {
        (
            name.to_string(),
            QueryDurationStats {
                bucket: name.to_string(),
                count,
            },
        )
    }

    #[test]
    fn test_slow_queries_sum_long_buckets() {
        let registry = MeterRegistry::new().unwrap();
        let entities: Arc<EntityState<String, QueryDurationStats>> = Arc::new(EntityState::new());
        ActiveQueryDurationCollector
            .register_aggregate_metrics(&registry, &entities)
            .unwrap();

        entities.replace(HashMap::from([
            bucket("0_10", 5),
            bucket("10_60", 2),
            bucket("60_180", 1),
            bucket("180_600", 3),
            bucket("600_plus", 4),
        ]));

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_query_active_queries_total 15"));
        assert!(text.contains("greengage_query_active_queries_slow 7"));
    }

    #[test]
    fn test_bucket_gauge() {
        let registry = MeterRegistry::new().unwrap();
        let entities: Arc<EntityState<String, QueryDurationStats>> = Arc::new(EntityState::new());
        entities.replace(HashMap::from([bucket("0_10", 9)]));

        let state = entities.clone();
        let supplier: EntitySupplier<QueryDurationStats> =
            Arc::new(move || state.get(&"0_10".to_string()));
        ActiveQueryDurationCollector
            .register_entity_metrics(&registry, &"0_10".to_string(), supplier)
            .unwrap();

        assert!(
            registry
                .encode()
                .unwrap()
                .contains("greengage_query_active_queries_duration_bucket{bucket=\"0_10\"} 9")
        );
    }
}
