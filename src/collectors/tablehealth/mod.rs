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

/// Bloat state buckets derived from the page-count ratio reported by
/// gp_toolkit: 0 none, 1 moderate (>4x), 2 severe (>10x or no estimate).
const TABLE_BLOAT_SQL: &str = r"
    SELECT current_database() AS datname,
           bdinspname         AS schemaname,
           bdirelname         AS relname,
           CASE
               WHEN bdiexppages = 0 THEN 2
               WHEN (bdirelpages::numeric / bdiexppages) > 10 THEN 2
               WHEN (bdirelpages::numeric / bdiexppages) > 4 THEN 1
               ELSE 0
               END::int AS bloat_state
    FROM gp_toolkit.gp_bloat_diag";

const TABLE_SKEW_SQL: &str = r"
    SELECT current_database() AS datname,
           skcnamespace       AS schemaname,
           skcrelname         AS tablename,
           round(skccoeff, 1)::float8 AS skccoeff
    FROM gp_toolkit.gp_skew_coefficients
    WHERE skccoeff > 0.1
      AND skcnamespace NOT IN ('pg_catalog', 'information_schema', 'gp_toolkit')
    ORDER BY skccoeff DESC
    LIMIT 10";

#[derive(Clone, Debug, Default)]
pub struct TableHealthStats {
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub bloat_state: Option<i32>,
    pub skew_factor: Option<f64>,
}

/// Table bloat and data skew per table. Expensive on large clusters;
/// deprecated upstream in favour of incremental table-change tracking, so
/// it stays behind an opt-in flag.
pub struct TableHealthCollector;

fn entity_key(database: &str, schema: &str, table: &str) -> String {
    format!("{database}.{schema}.{table}")
}

impl EntityCollect for TableHealthCollector {
    type Key = String;
    type Value = TableHealthStats;

    fn name(&self) -> &'static str {
        "table_health"
    }

    fn group(&self) -> CollectorGroup {
        CollectorGroup::PerDb
    }

    fn fail_on_error(&self) -> bool {
        false
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, TableHealthStats>>> {
        Box::pin(async move {
            debug!("Collecting table health metrics");

            let mut entities: HashMap<String, TableHealthStats> = HashMap::new();

            let rows = sqlx::query(TABLE_BLOAT_SQL).fetch_all(pool).await?;
            for row in rows {
                let database_name = util::or_unknown(row.try_get("datname")?);
                let schema_name = util::or_unknown(row.try_get("schemaname")?);
                let table_name = util::or_unknown(row.try_get("relname")?);
                let bloat_state: i32 = row.try_get("bloat_state")?;

                let key = entity_key(&database_name, &schema_name, &table_name);
                let stats = entities.entry(key).or_insert_with(|| TableHealthStats {
                    database_name,
                    schema_name,
                    table_name,
                    ..TableHealthStats::default()
                });
                stats.bloat_state = Some(bloat_state);
            }
            debug!("Collected bloat stats for {} tables", entities.len());

            // skew is best-effort detail on top of bloat
            match sqlx::query(TABLE_SKEW_SQL).fetch_all(pool).await {
                Ok(rows) => {
                    for row in rows {
                        let database_name = util::or_unknown(row.try_get("datname")?);
                        let schema_name = util::or_unknown(row.try_get("schemaname")?);
                        let table_name = util::or_unknown(row.try_get("tablename")?);
                        let skew: f64 = row.try_get("skccoeff")?;

                        let key = entity_key(&database_name, &schema_name, &table_name);
                        let stats = entities.entry(key).or_insert_with(|| TableHealthStats {
                            database_name,
                            schema_name,
                            table_name,
                            ..TableHealthStats::default()
                        });
                        stats.skew_factor = Some(skew);
                    }
                }
                Err(e) => debug!("Failed to collect data skew statistics: {e}"),
            }

            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        _key: &String,
        supplier: EntitySupplier<TableHealthStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let labels = [
            ("database", stats.database_name.as_str()),
            ("schema", stats.schema_name.as_str()),
            ("table", stats.table_name.as_str()),
        ];
        let mut meter_ids = Vec::with_capacity(2);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_server_table_bloat_state",
            "Table bloat state (0 = no bloat, 1 = moderate bloat, 2 = severe bloat)",
            &labels,
            move || {
                reader()
                    .and_then(|s| s.bloat_state)
                    .map_or(f64::NAN, f64::from)
            },
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_server_table_skew_factor",
            "Table data skew factor (1.0 = no skew, >1.5 = significant skew)",
            &labels,
            move || reader().and_then(|s| s.skew_factor).unwrap_or(f64::NAN),
        )?);

        Ok(meter_ids)
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(TableHealthCollector))
}
