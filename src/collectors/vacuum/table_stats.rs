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

/// Per-table vacuum statistics inside the connected database. Tables below
/// the tuple threshold are skipped to bound cardinality.
const TABLE_VACUUM_SQL: &str = r"
    WITH tab AS (SELECT current_database()                         AS datname,
                        n.nspname                                  AS nspname,
                        c.relname                                  AS relname,
                        s.n_live_tup                               AS n_live_tup,
                        s.n_dead_tup                               AS n_dead_tup,
                        s.vacuum_count                             AS vacuum_count,
                        s.autovacuum_count                         AS autovacuum_count,
                        s.last_vacuum,
                        s.last_autovacuum,
                        GREATEST(s.last_vacuum, s.last_autovacuum) AS last_any_vacuum
                 FROM pg_class c
                          JOIN pg_namespace n ON n.oid = c.relnamespace
                          JOIN pg_stat_all_tables s ON s.relid = c.oid
                 WHERE c.relkind = 'r'
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                   AND (s.n_live_tup + s.n_dead_tup) >= $1)
    SELECT datname,
           nspname,
           relname,
           CASE
               WHEN n_live_tup + n_dead_tup > 0
                   THEN n_dead_tup::float8 / (n_live_tup + n_dead_tup)
               ELSE 0
               END::float8 AS dead_tuple_ratio,
           EXTRACT(EPOCH FROM (now() - last_any_vacuum))::bigint AS seconds_since_last_vacuum,
           EXTRACT(EPOCH FROM (now() - COALESCE(last_autovacuum, last_vacuum)))::bigint
                                AS seconds_since_last_autovacuum,
           vacuum_count::bigint     AS vacuum_count,
           autovacuum_count::bigint AS autovacuum_count
    FROM tab";

#[derive(Clone, Debug)]
pub struct TableVacuumStats {
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub dead_tuple_ratio: f64,
    pub seconds_since_last_vacuum: i64,
    pub seconds_since_last_autovacuum: i64,
    pub vacuum_count: i64,
    pub autovacuum_count: i64,
}

pub struct TableVacuumStatisticsCollector {
    tuple_threshold: i32,
}

impl TableVacuumStatisticsCollector {
    pub fn new(tuple_threshold: i32) -> Self {
        Self { tuple_threshold }
    }
}

impl EntityCollect for TableVacuumStatisticsCollector {
    type Key = String;
    type Value = TableVacuumStats;

    fn name(&self) -> &'static str {
        "table_vacuum_statistics"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, TableVacuumStats>>> {
        Box::pin(async move {
            debug!("Collecting table vacuum statistics");

            let rows = sqlx::query(TABLE_VACUUM_SQL)
                .bind(self.tuple_threshold)
                .fetch_all(pool)
                .await?;

            let mut tables = HashMap::with_capacity(rows.len());
            for row in rows {
                let database_name = util::or_unknown(row.try_get("datname")?);
                let schema_name = util::or_unknown(row.try_get("nspname")?);
                let table_name: String = row.try_get("relname")?;
                let key = format!("{database_name}.{schema_name}.{table_name}");
                tables.insert(
                    key,
                    TableVacuumStats {
                        database_name,
                        schema_name,
                        table_name,
                        dead_tuple_ratio: row.try_get("dead_tuple_ratio")?,
                        seconds_since_last_vacuum: row
                            .try_get::<Option<i64>, _>("seconds_since_last_vacuum")?
                            .unwrap_or(0),
                        seconds_since_last_autovacuum: row
                            .try_get::<Option<i64>, _>("seconds_since_last_autovacuum")?
                            .unwrap_or(0),
                        vacuum_count: row.try_get::<Option<i64>, _>("vacuum_count")?.unwrap_or(0),
                        autovacuum_count: row
                            .try_get::<Option<i64>, _>("autovacuum_count")?
                            .unwrap_or(0),
                    },
                );
            }

            debug!("Collected vacuum statistics for {} tables", tables.len());
            Ok(tables)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        _key: &String,
        supplier: EntitySupplier<TableVacuumStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let labels = [
            ("database", stats.database_name.as_str()),
            ("schema", stats.schema_name.as_str()),
            ("table", stats.table_name.as_str()),
        ];
        let mut meter_ids = Vec::with_capacity(5);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_table_dead_tuple_ratio",
            "Ratio of dead tuples to total tuples for this table",
            &labels,
            move || reader().map_or(0.0, |s| s.dead_tuple_ratio),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_table_seconds_since_last_vacuum",
            "Seconds since the last vacuum (manual or auto) for this table",
            &labels,
            move || reader().map_or(0.0, |s| s.seconds_since_last_vacuum as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_table_seconds_since_last_autovacuum",
            "Seconds since the last autovacuum for this table",
            &labels,
            move || reader().map_or(0.0, |s| s.seconds_since_last_autovacuum as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_table_vacuum_count",
            "Total number of manual vacuums for this table",
            &labels,
            move || reader().map_or(0.0, |s| s.vacuum_count as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_database_table_autovacuum_count",
            "Total number of autovacuums for this table",
            &labels,
            move || reader().map_or(0.0, |s| s.autovacuum_count as f64),
        )?);

        Ok(meter_ids)
    }
}

pub fn collector(config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(TableVacuumStatisticsCollector::new(
        config.table_vacuum_tuple_threshold,
    )))
}
