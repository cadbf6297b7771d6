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

const DATABASE_SIZE_SQL: &str = r"
    SELECT sodddatname                        AS database_name,
           (sodddatsize / (1024 * 1024))::float8 AS database_size_mb
    FROM gp_toolkit.gp_size_of_database";

#[derive(Clone, Debug)]
pub struct DatabaseStats {
    pub size_mb: f64,
}

/// On-disk size per database. Databases are stable entities; a dropped
/// database keeps its last value rather than being unregistered.
pub struct DatabaseSizeCollector;

impl EntityCollect for DatabaseSizeCollector {
    type Key = String;
    type Value = DatabaseStats;

    fn name(&self) -> &'static str {
        "database_size"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, DatabaseStats>>> {
        Box::pin(async move {
            debug!("Collecting database size metrics");

            let rows = sqlx::query(DATABASE_SIZE_SQL).fetch_all(pool).await?;
            let mut databases = HashMap::with_capacity(rows.len());
            for row in rows {
                let name: String = row.try_get("database_name")?;
                let size_mb: f64 = row.try_get("database_size_mb")?;
                databases.insert(name, DatabaseStats { size_mb });
            }

            debug!("Collected size info for {} databases", databases.len());
            Ok(databases)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        dbname: &String,
        supplier: EntitySupplier<DatabaseStats>,
    ) -> Result<Vec<MeterId>> {
        let id = registry.register_gauge(
            "greengage_host_database_name_mb_size",
            "Total MB size of each database name in the file system",
            &[("dbname", dbname)],
            move || supplier().map_or(f64::NAN, |s| s.size_mb),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        entities: &Arc<EntityState<String, DatabaseStats>>,
    ) -> Result<()> {
        let state = entities.clone();
        registry.register_gauge(
            "greengage_host_total_database_size_mb",
            "Total size of all databases in megabytes",
            &[],
            move || state.snapshot().values().map(|s| s.size_mb).sum(),
        )?;

        let state = entities.clone();
        registry.register_gauge(
            "greengage_server_database_count",
            "Number of databases in the cluster",
            &[],
            move || state.len() as f64,
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(DatabaseSizeCollector))
}
