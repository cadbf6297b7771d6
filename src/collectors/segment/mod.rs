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
use tracing::debug;

const SEGMENT_STATS_SQL: &str = r"
    SELECT gsc.dbid::text           AS dbid,
           gsc.content::text        AS content,
           gsc.role::text           AS role,
           gsc.preferred_role::text AS preferred_role,
           gsc.mode::text           AS mode,
           gsc.status::text         AS status,
           gsc.port::text           AS port,
           gsc.hostname             AS hostname
    FROM gp_segment_configuration gsc
    ORDER BY gsc.content, gsc.role";

#[derive(Clone, Debug)]
pub struct SegmentStats {
    pub dbid: String,
    pub content: String,
    pub role: String,
    pub preferred_role: String,
    pub mode: String,
    pub status: String,
    pub port: String,
    pub hostname: String,
}

/// Per-segment status/role/mode plus cluster-level up/down counts.
/// Membership is stable, so deleted segments keep their last value.
pub struct SegmentCollector;

impl EntityCollect for SegmentCollector {
    type Key = String;
    type Value = SegmentStats;

    fn name(&self) -> &'static str {
        "segment"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, SegmentStats>>> {
        Box::pin(async move {
            debug!("Collecting segment metrics");

            let rows = sqlx::query(SEGMENT_STATS_SQL).fetch_all(pool).await?;
            let mut segments = HashMap::with_capacity(rows.len());
            for row in rows {
                let stats = SegmentStats {
                    dbid: row.try_get("dbid")?,
                    content: row.try_get("content")?,
                    role: row.try_get("role")?,
                    preferred_role: row.try_get("preferred_role")?,
                    mode: row.try_get("mode")?,
                    status: row.try_get("status")?,
                    port: row.try_get("port")?,
                    hostname: row.try_get("hostname")?,
                };
                let key = format!("{}:{}", stats.hostname, stats.dbid);
                segments.insert(key, stats);
            }

            debug!("Collected metrics for {} segments", segments.len());
            Ok(segments)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        _key: &String,
        supplier: EntitySupplier<SegmentStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let labels: Vec<(&str, &str)> = vec![
            ("dbid", &stats.dbid),
            ("content", &stats.content),
            ("hostname", &stats.hostname),
            ("preferred_role", &stats.preferred_role),
            ("role", &stats.role),
            ("port", &stats.port),
        ];
        let mut meter_ids = Vec::with_capacity(3);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_segment_status",
            "UP(1) if the segment is running, DOWN(0) if the segment has failed or is unreachable",
            &labels,
            move || {
                reader().map_or(f64::NAN, |s| {
                    util::segment_status_value(Some(&s.status))
                })
            },
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_segment_role",
            "The segment's current role, either primary(1) or mirror(2)",
            &labels,
            move || reader().map_or(f64::NAN, |s| util::segment_role_value(Some(&s.role))),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_cluster_segment_mode",
            "The replication status for the segment. \
             1.0 = Synchronized, 2.0 = Resyncing, 3.0 = Change Tracking, 4.0 = Not Syncing",
            &labels,
            move || reader().map_or(f64::NAN, |s| util::segment_mode_value(Some(&s.mode))),
        )?);

        Ok(meter_ids)
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        entities: &Arc<EntityState<String, SegmentStats>>,
    ) -> Result<()> {
        let state = entities.clone();
        registry.register_gauge(
            "greengage_cluster_segments_total",
            "Total number of segments in the cluster",
            &[],
            move || state.len() as f64,
        )?;

        let state = entities.clone();
        registry.register_gauge(
            "greengage_cluster_segments_up",
            "Number of segments in UP status",
            &[],
            move || {
                state
                    .snapshot()
                    .values()
                    .filter(|s| s.status.eq_ignore_ascii_case("u"))
                    .count() as f64
            },
        )?;

        let state = entities.clone();
        registry.register_gauge(
            "greengage_cluster_segments_down",
            "Number of segments in DOWN status",
            &[],
            move || {
                state
                    .snapshot()
                    .values()
                    .filter(|s| s.status.eq_ignore_ascii_case("d"))
                    .count() as f64
            },
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(SegmentCollector))
}
