use crate::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use crate::collectors::{Collector, util};
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const LOCKED_SESSIONS_SQL: &str = r"
    WITH waiting_locks AS (
        SELECT *
        FROM pg_locks
        WHERE granted = false
    ),
         waiting_with_activity AS (
             SELECT wl.*,
                    db.datname,
                    (now() - a.query_start) AS wait_duration
             FROM waiting_locks wl
                      LEFT JOIN pg_database db
                                ON db.oid = wl.database
                      LEFT JOIN pg_stat_activity a
                                ON a.sess_id = wl.mppsessionid
         )
    SELECT 'lock_waiting_queries'::text AS metric_name,
           datname                      AS database,
           locktype,
           mode,
           gp_segment_id::text          AS gp_segment_id,
           count(*)::float8             AS value
    FROM waiting_with_activity
    GROUP BY datname, locktype, mode, gp_segment_id
    UNION ALL
    SELECT 'lock_wait_max_wait_seconds' AS metric_name,
           datname                      AS database,
           locktype,
           mode,
           gp_segment_id::text          AS gp_segment_id,
           EXTRACT(EPOCH FROM MAX(wait_duration))::float8 AS value
    FROM waiting_with_activity
    GROUP BY datname, locktype, mode, gp_segment_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMetric {
    WaitingQueries,
    MaxWaitSeconds,
}

impl LockMetric {
    fn from_metric_name(name: &str) -> Result<Self> {
        match name {
            "lock_waiting_queries" => Ok(Self::WaitingQueries),
            "lock_wait_max_wait_seconds" => Ok(Self::MaxWaitSeconds),
            other => Err(anyhow!("unknown lock metric name: {other}")),
        }
    }

    fn metric_name(self) -> &'static str {
        match self {
            Self::WaitingQueries => "greengage_server_lock_waiting_queries",
            Self::MaxWaitSeconds => "greengage_server_lock_wait_max_wait_seconds",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Self::WaitingQueries => "Number of sessions waiting for locks",
            Self::MaxWaitSeconds => "Maximum wait time for locks in seconds",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocksKey {
    pub metric: LockMetric,
    pub database: String,
    pub lock_type: String,
    pub mode: String,
    pub segment: String,
}

/// Waiting-lock detail broken out by database, lock type, mode and
/// segment. Lock rows churn fast, so deleted keys are unregistered.
pub struct ExtendedLockedSessionsCollector;

impl EntityCollect for ExtendedLockedSessionsCollector {
    type Key = LocksKey;
    type Value = f64;

    fn name(&self) -> &'static str {
        "extended_locked_sessions"
    }

    fn remove_deleted_metrics(&self) -> bool {
        true
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<LocksKey, f64>>> {
        Box::pin(async move {
            debug!("Collecting extended locked sessions");

            let rows = sqlx::query(LOCKED_SESSIONS_SQL).fetch_all(pool).await?;
            let mut lock_stats = HashMap::with_capacity(rows.len());
            for row in rows {
                let metric_name: String = row.try_get("metric_name")?;
                let key = LocksKey {
                    metric: LockMetric::from_metric_name(&metric_name)?,
                    database: util::or_unknown(row.try_get("database")?),
                    lock_type: util::or_unknown(row.try_get("locktype")?),
                    mode: util::or_unknown(row.try_get("mode")?),
                    segment: util::or_unknown(row.try_get("gp_segment_id")?),
                };
                let value: Option<f64> = row.try_get("value")?;
                lock_stats.insert(key, value.unwrap_or(0.0));
            }

            debug!("Collected {} extended lock series", lock_stats.len());
            Ok(lock_stats)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &LocksKey,
        supplier: EntitySupplier<f64>,
    ) -> Result<Vec<MeterId>> {
        let id = registry.register_gauge(
            key.metric.metric_name(),
            key.metric.help(),
            &[
                ("database", &key.database),
                ("lock_type", &key.lock_type),
                ("mode", &key.mode),
                ("content", &key.segment),
            ],
            move || supplier().unwrap_or(0.0),
        )?;
        Ok(vec![id])
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(ExtendedLockedSessionsCollector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::entity::EntityState;

    #[test]
    fn test_metric_name_parsing() {
        assert_eq!(
            LockMetric::from_metric_name("lock_waiting_queries").unwrap(),
            LockMetric::WaitingQueries
        );
        assert_eq!(
            LockMetric::from_metric_name("lock_wait_max_wait_seconds").unwrap(),
            LockMetric::MaxWaitSeconds
        );
        assert!(LockMetric::from_metric_name("nope").is_err());
    }

    #[test]
    fn test_entity_metric_per_metric_kind() {
        let registry = MeterRegistry::new().unwrap();
        let entities: Arc<EntityState<LocksKey, f64>> = Arc::new(EntityState::new());

        let key = LocksKey {
            metric: LockMetric::WaitingQueries,
            database: "postgres".into(),
            lock_type: "relation".into(),
            mode: "AccessShareLock".into(),
            segment: "-1".into(),
        };
        entities.replace(HashMap::from([(key.clone(), 3.0)]));

        let state = entities.clone();
        let lookup = key.clone();
        let supplier: EntitySupplier<f64> = Arc::new(move || state.get(&lookup));
        ExtendedLockedSessionsCollector
            .register_entity_metrics(&registry, &key, supplier)
            .unwrap();

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_server_lock_waiting_queries{"));
        assert!(text.contains("database=\"postgres\""));
        assert!(text.contains("content=\"-1\""));
    }
}
