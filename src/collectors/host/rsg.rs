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

/// v7 renamed `cpu_rate_limit` to `cpu_max_percent` and the per-host usage
/// columns.
const RSG_SQL_V6: &str = r"
    SELECT r.rsgname,
           h.hostname,
           g.num_running::int              AS num_running,
           g.num_queueing::int             AS num_queueing,
           cfg.cpu_rate_limit::int         AS cpu_rate_limit,
           COALESCE(ROUND(h.cpu)::int, 0)  AS cpu_usage,
           cfg.memory_limit::int           AS memory_limit,
           COALESCE(h.memory_used::int, 0) AS memory_usage
    FROM gp_toolkit.gp_resgroup_status g
             JOIN pg_resgroup r
                  ON g.groupid = r.oid
             LEFT JOIN gp_toolkit.gp_resgroup_status_per_host h
                       ON h.groupid = g.groupid
             LEFT JOIN gp_toolkit.gp_resgroup_config cfg
                       ON cfg.groupid = g.groupid
    WHERE h.hostname IN (SELECT c.hostname
                         FROM gp_segment_configuration c
                         WHERE c.role = 'p'
                           AND c.content >= 0)
    ORDER BY r.rsgname, h.hostname";

const RSG_SQL_V7: &str = r"
    SELECT r.rsgname,
           h.hostname,
           g.num_running::int                   AS num_running,
           g.num_queueing::int                  AS num_queueing,
           cfg.cpu_max_percent::int             AS cpu_rate_limit,
           COALESCE(ROUND(h.cpu_usage)::int, 0) AS cpu_usage,
           cfg.memory_limit::int                AS memory_limit,
           COALESCE(h.memory_usage::int, 0)     AS memory_usage
    FROM gp_toolkit.gp_resgroup_status g
             JOIN pg_resgroup r ON g.groupid = r.oid
             LEFT JOIN gp_toolkit.gp_resgroup_status_per_host h ON h.groupid = g.groupid
             LEFT JOIN gp_toolkit.gp_resgroup_config cfg ON cfg.groupid = g.groupid
    WHERE h.hostname IN (SELECT c.hostname
                         FROM gp_segment_configuration c
                         WHERE c.role = 'p'
                           AND c.content >= 0)
    ORDER BY r.rsgname, h.hostname";

/// Resource-group rows roll up two ways: per `(host, group)` for usage and
/// per group for limits and queue depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RsgGroupBy {
    Host,
    ResourceGroup,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RsgKey {
    pub group_by: RsgGroupBy,
    pub id: String,
}

#[derive(Clone, Debug)]
pub struct HostValues {
    pub resource_group: String,
    pub hostname: String,
    pub cpu_rate_limit: i32,
    pub cpu_usage: i32,
    pub memory_limit: i32,
    pub memory_usage: i32,
}

#[derive(Clone, Debug)]
pub struct RsgValues {
    pub resource_group: String,
    pub num_running: i32,
    pub num_queueing: i32,
    pub cpu_rate_limit: i32,
    pub memory_limit: i32,
}

#[derive(Clone, Debug)]
pub enum RsgHostStats {
    Host(HostValues),
    Group(RsgValues),
}

fn limit_label(limit: i32) -> String {
    if limit > 0 {
        limit.to_string()
    } else {
        "unlimited".to_string()
    }
}

/// CPU and memory usage per host and resource group, session counts and
/// limits per resource group, and host-level skew rollups.
pub struct RsgHostCollector {
    cpu_skew: Arc<StateCell<SkewStats>>,
    mem_skew: Arc<StateCell<SkewStats>>,
}

impl RsgHostCollector {
    pub fn new() -> Self {
        Self {
            cpu_skew: Arc::new(StateCell::new(SkewStats::default())),
            mem_skew: Arc::new(StateCell::new(SkewStats::default())),
        }
    }
}

impl Default for RsgHostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCollect for RsgHostCollector {
    type Key = RsgKey;
    type Value = RsgHostStats;

    fn name(&self) -> &'static str {
        "rsg_per_host"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<RsgKey, RsgHostStats>>> {
        Box::pin(async move {
            let sql = if version.is_at_least_v7() {
                RSG_SQL_V7
            } else {
                RSG_SQL_V6
            };

            let rows = sqlx::query(sql).fetch_all(pool).await?;
            let mut entities = HashMap::new();
            for row in rows {
                let resource_group: String = row.try_get("rsgname")?;
                let hostname: String = row.try_get("hostname")?;
                let num_running: i32 = row.try_get::<Option<i32>, _>("num_running")?.unwrap_or(0);
                let num_queueing: i32 =
                    row.try_get::<Option<i32>, _>("num_queueing")?.unwrap_or(0);
                let cpu_rate_limit: i32 =
                    row.try_get::<Option<i32>, _>("cpu_rate_limit")?.unwrap_or(0);
                let cpu_usage: i32 = row.try_get::<Option<i32>, _>("cpu_usage")?.unwrap_or(0);
                let memory_limit: i32 =
                    row.try_get::<Option<i32>, _>("memory_limit")?.unwrap_or(0);
                let memory_usage: i32 =
                    row.try_get::<Option<i32>, _>("memory_usage")?.unwrap_or(0);

                let host_key = RsgKey {
                    group_by: RsgGroupBy::Host,
                    id: format!("{hostname}:{resource_group}"),
                };
                entities.insert(
                    host_key,
                    RsgHostStats::Host(HostValues {
                        resource_group: resource_group.clone(),
                        hostname,
                        cpu_rate_limit,
                        cpu_usage,
                        memory_limit,
                        memory_usage,
                    }),
                );

                let group_key = RsgKey {
                    group_by: RsgGroupBy::ResourceGroup,
                    id: resource_group.clone(),
                };
                entities.entry(group_key).or_insert_with(|| {
                    RsgHostStats::Group(RsgValues {
                        resource_group,
                        num_running,
                        num_queueing,
                        cpu_rate_limit,
                        memory_limit,
                    })
                });
            }

            let host_values: Vec<&HostValues> = entities
                .values()
                .filter_map(|v| match v {
                    RsgHostStats::Host(h) => Some(h),
                    RsgHostStats::Group(_) => None,
                })
                .collect();
            self.cpu_skew.set(SkewStats::of(
                host_values.iter().map(|h| f64::from(h.cpu_usage)),
            ));
            self.mem_skew.set(SkewStats::of(
                host_values.iter().map(|h| f64::from(h.memory_usage)),
            ));

            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &RsgKey,
        supplier: EntitySupplier<RsgHostStats>,
    ) -> Result<Vec<MeterId>> {
        let Some(stats) = supplier() else {
            return Ok(vec![]);
        };
        let mut meter_ids = Vec::new();

        match (key.group_by, stats) {
            (RsgGroupBy::Host, RsgHostStats::Host(host)) => {
                let mem_limit = limit_label(host.memory_limit);
                let cpu_limit = limit_label(host.cpu_rate_limit);

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_mem_usage_mb",
                    "Mem usage per host and resource group",
                    &[
                        ("resourceGroupName", &host.resource_group),
                        ("hostname", &host.hostname),
                        ("limit", &mem_limit),
                    ],
                    move || match reader() {
                        Some(RsgHostStats::Host(h)) => f64::from(h.memory_usage),
                        _ => f64::NAN,
                    },
                )?);

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_cpu_usage_percentage",
                    "CPU usage percentage per host and resource group",
                    &[
                        ("resourceGroupName", &host.resource_group),
                        ("limit", &cpu_limit),
                        ("hostname", &host.hostname),
                    ],
                    move || match reader() {
                        Some(RsgHostStats::Host(h)) => f64::from(h.cpu_usage),
                        _ => f64::NAN,
                    },
                )?);
            }
            (RsgGroupBy::ResourceGroup, RsgHostStats::Group(group)) => {
                let labels = [("resourceGroupName", group.resource_group.as_str())];

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_num_running_sessions",
                    "Number of running sessions per resource group",
                    &labels,
                    move || match reader() {
                        Some(RsgHostStats::Group(g)) => f64::from(g.num_running),
                        _ => f64::NAN,
                    },
                )?);

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_num_queueing_sessions",
                    "Number of queueing sessions per resource group",
                    &labels,
                    move || match reader() {
                        Some(RsgHostStats::Group(g)) => f64::from(g.num_queueing),
                        _ => f64::NAN,
                    },
                )?);

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_mem_limit_mb",
                    "Mem limit per resource group",
                    &labels,
                    move || match reader() {
                        Some(RsgHostStats::Group(g)) => f64::from(g.memory_limit),
                        _ => f64::NAN,
                    },
                )?);

                let reader = supplier.clone();
                meter_ids.push(registry.register_gauge(
                    "greengage_host_cpu_rate_limit_percentage",
                    "CPU rate limit percentage per resource group",
                    &labels,
                    move || match reader() {
                        Some(RsgHostStats::Group(g)) => f64::from(g.cpu_rate_limit),
                        _ => f64::NAN,
                    },
                )?);
            }
            // key and value shape disagree, nothing to register
            _ => {}
        }

        Ok(meter_ids)
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        _entities: &Arc<crate::collectors::entity::EntityState<RsgKey, RsgHostStats>>,
    ) -> Result<()> {
        let skew = self.mem_skew.clone();
        registry.register_gauge(
            "greengage_host_max_mem_usage",
            "Maximum mem usage across all hosts",
            &[],
            move || skew.get().max,
        )?;
        let skew = self.mem_skew.clone();
        registry.register_gauge(
            "greengage_host_avg_mem_usage",
            "Average mem usage across all hosts",
            &[],
            move || skew.get().avg,
        )?;
        let skew = self.mem_skew.clone();
        registry.register_gauge(
            "greengage_host_mem_usage_skew_ratio",
            "Mem usage skew ratio across all hosts",
            &[],
            move || skew.get().skew_ratio(),
        )?;

        let skew = self.cpu_skew.clone();
        registry.register_gauge(
            "greengage_host_max_cpu_usage",
            "Maximum CPU usage percentage across all hosts",
            &[],
            move || skew.get().max,
        )?;
        let skew = self.cpu_skew.clone();
        registry.register_gauge(
            "greengage_host_avg_cpu_usage",
            "Average CPU usage percentage across all hosts",
            &[],
            move || skew.get().avg,
        )?;
        let skew = self.cpu_skew.clone();
        registry.register_gauge(
            "greengage_host_cpu_usage_skew_ratio",
            "CPU usage skew ratio across all hosts",
            &[],
            move || skew.get().skew_ratio(),
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(RsgHostCollector::new()))
}
