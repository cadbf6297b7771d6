use crate::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use crate::collectors::{Collector, util};
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const VACUUM_RUNNING_SQL: &str = r"
    SELECT datname,
           pid,
           usename,
           EXTRACT(EPOCH FROM (now() - xact_start))::bigint AS seconds_running
    FROM pg_stat_activity
    WHERE (query ILIKE 'vacuum%' OR query ILIKE 'autovacuum:%')
      AND state <> 'idle'";

#[derive(Clone, Debug)]
pub struct VacuumRunningStats {
    pub database_name: String,
    pub user_name: String,
    pub pid: i32,
    pub seconds_running: i64,
}

/// Currently running vacuum/autovacuum processes. Vacuum pids churn every
/// scrape, so finished processes are unregistered.
pub struct VacuumRunningCollector {
    vacuum_is_running: Arc<AtomicBool>,
}

impl VacuumRunningCollector {
    pub fn new() -> Self {
        Self {
            vacuum_is_running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for VacuumRunningCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for VacuumRunningCollector {
    type Key = String;
    type Value = VacuumRunningStats;

    fn name(&self) -> &'static str {
        "vacuum_running"
    }

    fn remove_deleted_metrics(&self) -> bool {
        true
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, VacuumRunningStats>>> {
        Box::pin(async move {
            debug!("Collecting running vacuum processes");

            let rows = sqlx::query(VACUUM_RUNNING_SQL).fetch_all(pool).await?;
            let mut entities = HashMap::with_capacity(rows.len());
            for row in rows {
                let database_name = util::or_unknown(row.try_get("datname")?);
                let user_name = util::or_unknown(row.try_get("usename")?);
                let pid: i32 = row.try_get("pid")?;
                let seconds_running: i64 = row
                    .try_get::<Option<i64>, _>("seconds_running")?
                    .unwrap_or(0);

                let key = format!("{database_name}.{pid}.{user_name}");
                entities.insert(
                    key,
                    VacuumRunningStats {
                        database_name,
                        user_name,
                        pid,
                        seconds_running,
                    },
                );
            }

            self.vacuum_is_running
                .store(!entities.is_empty(), Ordering::Relaxed);
            debug!(
                "Found {} active vacuum/autovacuum processes",
                entities.len()
            );
            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        _key: &String,
        supplier: EntitySupplier<VacuumRunningStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let pid = stats.pid.to_string();
        let reader = supplier.clone();
        let id = registry.register_gauge(
            "greengage_server_vacuum_running_seconds",
            "Seconds the vacuum/autovacuum has been running",
            &[
                ("datname", &stats.database_name),
                ("usename", &stats.user_name),
                ("pid", &pid),
            ],
            move || reader().map_or(0.0, |s| s.seconds_running as f64),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        _entities: &Arc<crate::collectors::entity::EntityState<String, VacuumRunningStats>>,
    ) -> Result<()> {
        let running = self.vacuum_is_running.clone();
        registry.register_gauge(
            "greengage_server_vacuum_running",
            "Indicates if any vacuum/autovacuum process is currently running \
             (1 = running, 0 = not running)",
            &[],
            move || {
                if running.load(Ordering::Relaxed) {
                    1.0
                } else {
                    0.0
                }
            },
        )?;
        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(VacuumRunningCollector::new()))
}
