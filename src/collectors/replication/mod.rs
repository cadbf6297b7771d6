use crate::collectors::aggregate::StateCell;
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
use tracing::debug;

/// v6 spells the WAL functions `pg_xlog_location_diff` over `*_location`
/// columns; v7 uses `pg_wal_lsn_diff` over `*_lsn`.
const REPLICATION_STATS_SQL_V6: &str = r"
    WITH master AS (SELECT -1 AS content,
                           application_name,
                           state,
                           sync_state,
                           GREATEST(COALESCE(pg_xlog_location_diff(sent_location, write_location), 0),
                                    0)::bigint AS write_lag_bytes,
                           GREATEST(COALESCE(pg_xlog_location_diff(sent_location, flush_location), 0),
                                    0)::bigint AS flush_lag_bytes,
                           GREATEST(COALESCE(pg_xlog_location_diff(sent_location, replay_location), 0),
                                    0)::bigint AS replay_lag_bytes
                    FROM pg_stat_replication
                    WHERE state IN ('streaming', 'catchup')),
         segments AS (SELECT gp_execution_segment() AS content,
                             application_name,
                             state,
                             sync_state,
                             GREATEST(COALESCE(pg_xlog_location_diff(sent_location, write_location), 0),
                                      0)::bigint AS write_lag_bytes,
                             GREATEST(COALESCE(pg_xlog_location_diff(sent_location, flush_location), 0),
                                      0)::bigint AS flush_lag_bytes,
                             GREATEST(COALESCE(pg_xlog_location_diff(sent_location, replay_location), 0),
                                      0)::bigint AS replay_lag_bytes
                      FROM gp_dist_random('pg_stat_replication')
                      WHERE state IN ('streaming', 'catchup'))
    SELECT m.*, g.hostname
    FROM master m
             JOIN gp_segment_configuration g
                  ON g.content = m.content AND g.role = 'p'
    UNION ALL
    SELECT s.*, g.hostname
    FROM segments s
             JOIN gp_segment_configuration g
                  ON g.content = s.content AND g.role = 'p'
    ORDER BY content, application_name";

const REPLICATION_STATS_SQL_V7: &str = r"
    WITH master AS (SELECT -1 AS content,
                           application_name,
                           state,
                           sync_state,
                           GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, write_lsn), 0), 0)::bigint  AS write_lag_bytes,
                           GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, flush_lsn), 0), 0)::bigint  AS flush_lag_bytes,
                           GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, replay_lsn), 0), 0)::bigint AS replay_lag_bytes
                    FROM pg_stat_replication
                    WHERE state IN ('streaming', 'catchup')),
         segments AS (SELECT gp_execution_segment() AS content,
                             application_name,
                             state,
                             sync_state,
                             GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, write_lsn), 0), 0)::bigint  AS write_lag_bytes,
                             GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, flush_lsn), 0), 0)::bigint  AS flush_lag_bytes,
                             GREATEST(COALESCE(pg_wal_lsn_diff(sent_lsn, replay_lsn), 0), 0)::bigint AS replay_lag_bytes
                      FROM gp_dist_random('pg_stat_replication')
                      WHERE state IN ('streaming', 'catchup'))
    SELECT m.*, g.hostname
    FROM master m
             JOIN gp_segment_configuration g
                  ON g.content = m.content AND g.role = 'p'
    UNION ALL
    SELECT s.*, g.hostname
    FROM segments s
             JOIN gp_segment_configuration g
                  ON g.content = s.content AND g.role = 'p'
    ORDER BY content, application_name";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub content: i32,
    pub hostname: String,
}

#[derive(Clone, Debug)]
pub struct ReplicationStats {
    pub application_name: String,
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub write_lag_bytes: i64,
    pub flush_lag_bytes: i64,
    pub replay_lag_bytes: i64,
}

impl ReplicationStats {
    /// 1=streaming, 2=catchup, 3=backup, 0=unknown.
    pub fn state_numeric(&self) -> f64 {
        match self.state.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("streaming") => 1.0,
            Some("catchup") => 2.0,
            Some("backup") => 3.0,
            _ => 0.0,
        }
    }

    /// 2=sync, 1=async, 0.5=potential, 0=unknown.
    pub fn sync_state_numeric(&self) -> f64 {
        match self
            .sync_state
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("sync") => 2.0,
            Some("async") => 1.0,
            Some("potential") => 0.5,
            _ => 0.0,
        }
    }
}

/// Master/standby and mirror replication health: per-instance lag in bytes
/// plus state encodings, keyed by `(content, hostname)` so a state change
/// does not mint a new time series.
pub struct ReplicationMonitorCollector {
    max_lag_bytes: Arc<StateCell<f64>>,
}

impl ReplicationMonitorCollector {
    pub fn new() -> Self {
        Self {
            max_lag_bytes: Arc::new(StateCell::new(0.0)),
        }
    }
}

impl Default for ReplicationMonitorCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for ReplicationMonitorCollector {
    type Key = InstanceKey;
    type Value = ReplicationStats;

    fn name(&self) -> &'static str {
        "replication_monitor"
    }

    fn fail_on_error(&self) -> bool {
        false
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<InstanceKey, ReplicationStats>>> {
        Box::pin(async move {
            debug!("Collecting replication monitoring metrics");

            let sql = if version.is_at_least_v7() {
                REPLICATION_STATS_SQL_V7
            } else {
                REPLICATION_STATS_SQL_V6
            };

            let mut entities = HashMap::new();
            let mut max_lag = 0.0f64;

            match sqlx::query(sql).fetch_all(pool).await {
                Ok(rows) => {
                    for row in rows {
                        let application_name = match row
                            .try_get::<Option<String>, _>("application_name")?
                        {
                            Some(name) if !name.is_empty() => name,
                            _ => util::UNKNOWN.to_string(),
                        };
                        let stats = ReplicationStats {
                            application_name,
                            state: row.try_get("state")?,
                            sync_state: row.try_get("sync_state")?,
                            write_lag_bytes: row.try_get("write_lag_bytes")?,
                            flush_lag_bytes: row.try_get("flush_lag_bytes")?,
                            replay_lag_bytes: row.try_get("replay_lag_bytes")?,
                        };
                        max_lag = max_lag.max(stats.replay_lag_bytes as f64);
                        let key = InstanceKey {
                            content: row.try_get("content")?,
                            hostname: row.try_get("hostname")?,
                        };
                        entities.insert(key, stats);
                    }
                }
                Err(e) => {
                    debug!(
                        "Failed to collect replication statistics \
                         (might not be master or no standby): {e}"
                    );
                }
            }

            self.max_lag_bytes.set(max_lag);
            debug!(
                "Collected replication stats for {} standbys, max lag: {max_lag} bytes",
                entities.len()
            );
            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &InstanceKey,
        supplier: EntitySupplier<ReplicationStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let content = key.content.to_string();
        let labels: Vec<(&str, &str)> = vec![
            ("content", &content),
            ("hostname", &key.hostname),
            ("application_name", &stats.application_name),
        ];
        let mut meter_ids = Vec::with_capacity(5);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_replication_lag_bytes",
            "Replication lag in bytes (replay lag)",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.replay_lag_bytes as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_replication_state",
            "Replication state: 1=streaming, 2=catchup, 3=backup, 0=unknown",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.state_numeric()),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_replication_sync_state",
            "Replication sync state: 2=sync, 1=async, 0.5=potential, 0=unknown",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.sync_state_numeric()),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_replication_write_lag_bytes",
            "Replication write lag in bytes",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.write_lag_bytes as f64),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_replication_flush_lag_bytes",
            "Replication flush lag in bytes",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.flush_lag_bytes as f64),
        )?);

        Ok(meter_ids)
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        _entities: &Arc<crate::collectors::entity::EntityState<InstanceKey, ReplicationStats>>,
    ) -> Result<()> {
        let max_lag = self.max_lag_bytes.clone();
        registry.register_gauge(
            "greengage_cluster_replication_max_lag_bytes",
            "Maximum replication lag in bytes across all segments",
            &[],
            move || *max_lag.get(),
        )?;
        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(ReplicationMonitorCollector::new()))
}
