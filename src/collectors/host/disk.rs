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

/// Reads the helper view installed alongside the exporter; absent on
/// clusters without the ggexporter schema, hence the soft failure policy.
const DISK_SQL: &str = r"
    SELECT DISTINCT gdu.dfhostname,
           gdu.dftotal_kb::float8  AS dftotal_kb,
           gdu.dfused_kb::float8   AS dfused_kb,
           gdu.dfavail_kb::float8  AS dfavail_kb,
           gdu.dfpercent::float8   AS dfpercent
    FROM ggexporter.gp_segment_disk_usage gdu
    ORDER BY gdu.dfhostname";

#[derive(Clone, Debug)]
pub struct DiskStats {
    pub total_kb: f64,
    pub used_kb: f64,
    pub available_kb: f64,
    pub used_percent: f64,
}

#[derive(Default)]
struct DiskSkew {
    total: SkewStats,
    used: SkewStats,
    available: SkewStats,
    percent: SkewStats,
}

/// Filesystem capacity per host with skew rollups per dimension.
pub struct DiskHostCollector {
    skew: Arc<StateCell<DiskSkew>>,
}

impl DiskHostCollector {
    pub fn new() -> Self {
        Self {
            skew: Arc::new(StateCell::new(DiskSkew::default())),
        }
    }

    fn register_skew_metrics(
        registry: &MeterRegistry,
        metric: &str,
        max_help: &str,
        avg_help: &str,
        ratio_help: &str,
        skew: &Arc<StateCell<DiskSkew>>,
        pick: fn(&DiskSkew) -> SkewStats,
    ) -> Result<()> {
        let cell = skew.clone();
        registry.register_gauge(
            &format!("greengage_host_max_{metric}"),
            max_help,
            &[],
            move || pick(&cell.get()).max,
        )?;
        let cell = skew.clone();
        registry.register_gauge(
            &format!("greengage_host_avg_{metric}"),
            avg_help,
            &[],
            move || pick(&cell.get()).avg,
        )?;
        let cell = skew.clone();
        registry.register_gauge(
            &format!("greengage_host_{metric}_skew_ratio"),
            ratio_help,
            &[],
            move || pick(&cell.get()).skew_ratio(),
        )?;
        Ok(())
    }
}

impl Default for DiskHostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for DiskHostCollector {
    type Key = String;
    type Value = DiskStats;

    fn name(&self) -> &'static str {
        "disk_per_host"
    }

    fn fail_on_error(&self) -> bool {
        false
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, DiskStats>>> {
        Box::pin(async move {
            let rows = sqlx::query(DISK_SQL).fetch_all(pool).await?;
            let mut entities = HashMap::with_capacity(rows.len());
            for row in rows {
                let hostname: String = row.try_get("dfhostname")?;
                entities.insert(
                    hostname,
                    DiskStats {
                        total_kb: row.try_get("dftotal_kb")?,
                        used_kb: row.try_get("dfused_kb")?,
                        available_kb: row.try_get("dfavail_kb")?,
                        used_percent: row.try_get("dfpercent")?,
                    },
                );
            }

            self.skew.set(DiskSkew {
                total: SkewStats::of(entities.values().map(|s| s.total_kb)),
                used: SkewStats::of(entities.values().map(|s| s.used_kb)),
                available: SkewStats::of(entities.values().map(|s| s.available_kb)),
                percent: SkewStats::of(entities.values().map(|s| s.used_percent)),
            });

            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        hostname: &String,
        supplier: EntitySupplier<DiskStats>,
    ) -> Result<Vec<MeterId>> {
        let labels = [("hostname", hostname.as_str())];
        let mut meter_ids = Vec::with_capacity(4);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_host_disk_total_kb",
            "Disk total KB per host",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.total_kb),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_host_disk_used_kb",
            "Disk used KB per host",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.used_kb),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_host_disk_available_kb",
            "Disk available KB per host",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.available_kb),
        )?);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_host_disk_usage_percent",
            "Disk usage percent per host",
            &labels,
            move || reader().map_or(f64::NAN, |s| s.used_percent),
        )?);

        Ok(meter_ids)
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        _entities: &Arc<crate::collectors::entity::EntityState<String, DiskStats>>,
    ) -> Result<()> {
        Self::register_skew_metrics(
            registry,
            "disk_total_kb",
            "Maximum disk total KB across all hosts",
            "Average disk total KB across all hosts",
            "Disk total KB skew ratio across all hosts",
            &self.skew,
            |s| s.total,
        )?;
        Self::register_skew_metrics(
            registry,
            "disk_used_kb",
            "Maximum disk used KB across all hosts",
            "Average disk used KB across all hosts",
            "Disk used KB skew ratio across all hosts",
            &self.skew,
            |s| s.used,
        )?;
        Self::register_skew_metrics(
            registry,
            "disk_available_kb",
            "Maximum disk available KB across all hosts",
            "Average disk available KB across all hosts",
            "Disk available KB skew ratio across all hosts",
            &self.skew,
            |s| s.available,
        )?;
        Self::register_skew_metrics(
            registry,
            "disk_usage_percent",
            "Maximum disk usage percent across all hosts",
            "Average disk usage percent across all hosts",
            "Disk usage percent skew ratio across all hosts",
            &self.skew,
            |s| s.percent,
        )?;
        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(DiskHostCollector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::entity::EntityState;

    #[test]
    fn test_all_skew_families_registered() {
        let registry = MeterRegistry::new().unwrap();
        let collector = DiskHostCollector::new();
        let entities: Arc<EntityState<String, DiskStats>> = Arc::new(EntityState::new());
        collector
            .register_aggregate_metrics(&registry, &entities)
            .unwrap();

        collector.skew.set(DiskSkew {
            total: SkewStats {
                max: 1000.0,
                avg: 500.0,
            },
            used: SkewStats {
                max: 400.0,
                avg: 200.0,
            },
            available: SkewStats {
                max: 600.0,
                avg: 300.0,
            },
            percent: SkewStats {
                max: 40.0,
                avg: 20.0,
            },
        });

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_host_max_disk_total_kb 1000"));
        assert!(text.contains("greengage_host_avg_disk_used_kb 200"));
        assert!(text.contains("greengage_host_disk_available_kb_skew_ratio 2"));
        assert!(text.contains("greengage_host_disk_usage_percent_skew_ratio 2"));
    }

    #[test]
    fn test_entity_gauges_per_host() {
        let registry = MeterRegistry::new().unwrap();
        let entities: Arc<EntityState<String, DiskStats>> = Arc::new(EntityState::new());
        entities.replace(HashMap::from([(
            "sdw1".to_string(),
            DiskStats {
                total_kb: 100.0,
                used_kb: 40.0,
                available_kb: 60.0,
                used_percent: 40.0,
            },
        )]));

        let state = entities.clone();
        let supplier: EntitySupplier<DiskStats> = Arc::new(move || state.get(&"sdw1".to_string()));
        let ids = DiskHostCollector::new()
            .register_entity_metrics(&registry, &"sdw1".to_string(), supplier)
            .unwrap();
        assert_eq!(ids.len(), 4);

        let text = registry.encode().unwrap();
        assert!(text.contains("greengage_host_disk_total_kb{hostname=\"sdw1\"} 100"));
        assert!(text.contains("greengage_host_disk_usage_percent{hostname=\"sdw1\"} 40"));
    }
}
