use crate::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use crate::collectors::{Collector, CollectorGroup, util};
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Database-wide rollup of the per-table vacuum statistics, computed
/// inside the connected database.
const DB_VACUUM_SQL: &str = r"
    WITH tab AS (SELECT current_database()                         AS datname,
                        n.nspname,
                        c.relname,
                        s.n_live_tup,
                        s.n_dead_tup,
                        GREATEST(s.last_vacuum, s.last_autovacuum) AS last_any_vacuum
                 FROM pg_class c
                          JOIN pg_namespace n ON n.oid = c.relnamespace
                          JOIN pg_stat_all_tables s ON s.relid = c.oid
                 WHERE c.relkind = 'r'
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                   AND (s.n_live_tup + s.n_dead_tup) >= $1)
    SELECT datname,
           MAX(EXTRACT(EPOCH FROM (now() - last_any_vacuum)))::bigint AS max_seconds_since_last_vacuum,
           AVG(
                   CASE
                       WHEN n_live_tup + n_dead_tup > 0
                           THEN n_dead_tup::float8 / (n_live_tup + n_dead_tup)
                       ELSE 0
                       END
           )::float8                                                  AS avg_dead_tuple_ratio,
           MAX(
                   CASE
                       WHEN n_live_tup + n_dead_tup > 0
                           THEN n_dead_tup::float8 / (n_live_tup + n_dead_tup)
                       ELSE 0
                       END
           )::float8                                                  AS max_dead_tuple_ratio
    FROM tab
    GROUP BY datname";

#[derive(Clone, Debug)]
pub struct DbVacuumStats {
    pub max_seconds_since_last_vacuum: i64,
    pub avg_dead_tuple_ratio: f64,
    pub max_dead_tuple_ratio: f64,
}

pub struct DbVacuumStatisticsCollector {
    tuple_threshold: i32,
}

impl DbVacuumStatisticsCollector {
    pub fn new(tuple_threshold: i32) -> Self {
        Self { tuple_threshold }
    }
}

impl EntityCollect for DbVacuumStatisticsCollector {
    type Key = String;
    type Value = DbVacuumStats;

    fn name(&self) -> &'static str {
        "db_vacuum_statistics"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, DbVacuumStats>>> {
        Box::pin(async move {
            debug!("Collecting database vacuum statistics");

            let rows = sqlx::query(DB_VACUUM_SQL)
                .bind(self.tuple_threshold)
                .fetch_all(pool)
                .await?;

            let mut databases = HashMap::with_capacity(rows.len());
            for row in rows {
                let database_name = util::or_unknown(row.try_get("datname")?);
                databases.insert(
                    database_name,
                    DbVacuumStats {
                        max_seconds_since_last_vacuum: row
                            .try_get::<Option<i64>, _>("max_seconds_since_last_vacuum")?
                            .unwrap_or(0),
                        avg_dead_tuple_ratio: row
                            .try_get::<Option<f64>, _>("avg_dead_tuple_ratio")?
                            .unwrap_or(0.0),
                        max_dead_tuple_ratio: row
                            .try_get::<Option<f64>, _>("max_dead_tuple_ratio")?
                            .unwrap_or(0.0),
                    },
                );
            }

            Ok(databases)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        datname: &String,
        supplier: EntitySupplier<DbVacuumStats>,
    ) -> Result<Vec<MeterId>> {
        let labels = [("datname", datname.as_str())];
        let mut meter_ids = Vec::with_capacity(3);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_db_max_seconds_since_last_vacuum",
            "Maximum seconds since last vacuum (manual or auto) across all tables in the database",
            &labels,
            move || reader().map_or(0.0, |s| s.max_seconds_since_last_vacuum as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_db_avg_dead_tuple_ratio",
            "Average dead tuple ratio across all tables in the database",
            &labels,
            move || reader().map_or(0.0, |s| s.avg_dead_tuple_ratio),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_db_max_dead_tuple_ratio",
            "Maximum dead tuple ratio across all tables in the database",
            &labels,
            move || reader().map_or(0.0, |s| s.max_dead_tuple_ratio),
        )?);

        Ok(meter_ids)
    }
}

pub fn collector(config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(DbVacuumStatisticsCollector::new(
        config.table_vacuum_tuple_threshold,
    )))
}
