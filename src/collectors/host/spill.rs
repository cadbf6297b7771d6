use crate::collectors::aggregate::StateCell;
use crate::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use crate::collectors::util::SkewStats;
use crate::collectors::Collector;
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;

/// Spill usage summed per primary host; hosts without workfiles report 0.
const SPILL_SQL: &str = r"
    WITH per_segment AS (SELECT w.segid     AS content,
                                SUM(w.size) AS spill_bytes
                         FROM gp_toolkit.gp_workfile_usage_per_query w
                         GROUP BY w.segid),
         all_host AS (SELECT c.hostname,
                             sum(COALESCE(p.spill_bytes, 0)) AS spill_bytes
                      FROM gp_segment_configuration c
                               LEFT JOIN per_segment p
                                         ON p.content = c.content
                      WHERE c.role = 'p'
                        AND c.content >= 0
                      GROUP BY c.hostname)
    SELECT hostname,
           spill_bytes::float8 AS spill_bytes
    FROM all_host
    ORDER BY hostname";

#[derive(Clone, Debug)]
pub struct HostSpillStats {
    pub spill_bytes: f64,
}

/// Workfile (spill) usage per host, with max/avg/skew rollups. Large skew
/// points at queries spilling on a subset of hosts.
pub struct SpillHostCollector {
    skew: Arc<StateCell<SkewStats>>,
}

impl SpillHostCollector {
    pub fn new() -> Self {
        Self {
            skew: Arc::new(StateCell::new(SkewStats::default())),
        }
    }
}

impl Default for SpillHostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for SpillHostCollector {
    type Key = String;
    type Value = HostSpillStats;

    fn name(&self) -> &'static str {
        "spill_per_host"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, HostSpillStats>>> {
        Box::pin(async move {
            let rows = sqlx::query(SPILL_SQL).fetch_all(pool).await?;
            let mut entities = HashMap::with_capacity(rows.len());
            for row in rows {
                let hostname: String = row.try_get("hostname")?;
                let spill_bytes: f64 = row.try_get::<Option<f64>, _>("spill_bytes")?.unwrap_or(0.0);
                entities.insert(hostname, HostSpillStats { spill_bytes });
            }
            self.skew
                .set(SkewStats::of(entities.values().map(|s| s.spill_bytes)));
            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        hostname: &String,
        supplier: EntitySupplier<HostSpillStats>,
    ) -> Result<Vec<MeterId>> {
        let id = registry.register_gauge(
            "greengage_host_spill_usage_bytes",
            "Spill files usage per host",
            &[("hostname", hostname)],
            move || supplier().map_or(f64::NAN, |s| s.spill_bytes),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        _entities: &Arc<crate::collectors::entity::EntityState<String, HostSpillStats>>,
    ) -> Result<()> {
        let skew = self.skew.clone();
        registry.register_gauge(
            "greengage_host_max_spill_usage",
            "Maximum spill files usage across all hosts",
            &[],
            move || skew.get().max,
        )?;

        let skew = self.skew.clone();
        registry.register_gauge(
            "greengage_host_avg_spill_usage",
            "Average spill files usage across all hosts",
            &[],
            move || skew.get().avg,
        )?;

        let skew = self.skew.clone();
        registry.register_gauge(
            "greengage_host_spill_usage_skew_ratio",
            "Spill files usage skew ratio across all hosts",
            &[],
            move || skew.get().skew_ratio(),
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(SpillHostCollector::new()))
}
