use crate::collectors::aggregate::{AggregateCollect, AggregateDriver, StateCell};
use crate::collectors::{Collector, util};
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::MeterRegistry;
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

/// Fails on single-node installations; any row proves the cluster can
/// dispatch to segments.
const CHECK_STATE_SQL: &str = "SELECT count(1) FROM gp_dist_random('gp_id')";

const CLUSTER_STATE_SQL: &str = r"
    WITH master AS (
        SELECT hostname FROM gp_segment_configuration
        WHERE content = -1 AND role = 'p'
    ),
    standby AS (
        SELECT hostname FROM gp_segment_configuration
        WHERE content = -1 AND role = 'm'
    ),
    uptime AS (
        SELECT extract(epoch FROM now() - pg_postmaster_start_time())::float8 AS uptime_seconds
    ),
    sync AS (
        SELECT count(*)::float8 AS sync_replicas
        FROM pg_stat_replication
        WHERE state = 'streaming'
    ),
    conf_load AS (
        SELECT extract(epoch FROM pg_conf_load_time())::float8 AS conf_load_time
    )
    SELECT
        (SELECT hostname FROM master) AS master_host,
        (SELECT hostname FROM standby) AS standby_host,
        (SELECT uptime_seconds FROM uptime) AS uptime_seconds,
        (SELECT sync_replicas FROM sync) AS sync_replicas,
        (SELECT conf_load_time FROM conf_load) AS conf_load_time,
        (SELECT current_setting('max_connections')::int) AS max_connections";

#[derive(Clone, Debug)]
pub struct ClusterState {
    pub accessible: bool,
    pub version: String,
    pub master: String,
    pub standby: String,
    pub uptime: f64,
    pub sync: f64,
    pub config_load_time: f64,
    pub max_connections: f64,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            accessible: false,
            version: util::UNKNOWN.to_string(),
            master: util::UNKNOWN.to_string(),
            standby: String::new(),
            uptime: 0.0,
            sync: 0.0,
            config_load_time: 0.0,
            max_connections: 0.0,
        }
    }
}

/// Cluster-wide singleton state: accessibility, uptime, sync replicas,
/// config reload time, connection limit. The `greengage_cluster_state`
/// gauge carries `{version, master, standby}` tags re-read every scrape.
pub struct ClusterStateCollector;

impl AggregateCollect for ClusterStateCollector {
    type State = ClusterState;

    fn name(&self) -> &'static str {
        "cluster_state"
    }

    fn fail_on_error(&self) -> bool {
        false
    }

    fn initial_state(&self) -> ClusterState {
        ClusterState::default()
    }

    fn collect_data<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<Option<ClusterState>>> {
        Box::pin(async move {
            debug!("Collecting cluster state metrics");

            let mut state = ClusterState {
                version: version.full_version(),
                ..ClusterState::default()
            };

            match sqlx::query_scalar::<_, i64>(CHECK_STATE_SQL)
                .fetch_one(pool)
                .await
            {
                Ok(count) => state.accessible = count > 0,
                Err(e) => debug!("Cluster not accessible (might be single-node): {e}"),
            }

            match sqlx::query(CLUSTER_STATE_SQL).fetch_one(pool).await {
                Ok(row) => {
                    state.master = row
                        .try_get::<Option<String>, _>("master_host")?
                        .unwrap_or_else(|| util::UNKNOWN.to_string());
                    state.standby = row
                        .try_get::<Option<String>, _>("standby_host")?
                        .unwrap_or_default();
                    state.uptime = row
                        .try_get::<Option<f64>, _>("uptime_seconds")?
                        .unwrap_or(0.0);
                    state.sync = row
                        .try_get::<Option<f64>, _>("sync_replicas")?
                        .unwrap_or(0.0);
                    state.config_load_time = row
                        .try_get::<Option<f64>, _>("conf_load_time")?
                        .unwrap_or(0.0);
                    state.max_connections = row
                        .try_get::<Option<i32>, _>("max_connections")?
                        .map_or(0.0, f64::from);
                }
                Err(e) => {
                    debug!("Failed to get detailed cluster info (might not be a cluster): {e}");
                }
            }

            Ok(Some(state))
        })
    }

    fn register_metrics(
        &self,
        registry: &MeterRegistry,
        state: &Arc<StateCell<ClusterState>>,
    ) -> Result<()> {
        let cell = state.clone();
        registry.register_dynamic_gauge(
            "greengage_cluster_state",
            "Whether the Greengage database cluster is accessible (can query segments)",
            &["version", "master", "standby"],
            move || {
                let s = cell.get();
                (
                    vec![s.version.clone(), s.master.clone(), s.standby.clone()],
                    if s.accessible { 1.0 } else { 0.0 },
                )
            },
        )?;

        let cell = state.clone();
        registry.register_gauge(
            "greengage_cluster_uptime_seconds",
            "Duration that the Greengage database has been running since last restart",
            &[],
            move || cell.get().uptime,
        )?;

        let cell = state.clone();
        registry.register_gauge(
            "greengage_cluster_sync",
            "Number of sync replicas streaming from master (0=no sync, 1=sync active)",
            &[],
            move || cell.get().sync,
        )?;

        let cell = state.clone();
        registry.register_gauge(
            "greengage_cluster_config_last_load_time_seconds",
            "Unix timestamp of the last configuration reload",
            &[],
            move || cell.get().config_load_time,
        )?;

        let cell = state.clone();
        registry.register_gauge(
            "greengage_cluster_max_connections",
            "Maximum number of allowed connections to the Greengage database",
            &[],
            move || cell.get().max_connections,
        )?;

        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(AggregateDriver::shared(ClusterStateCollector))
}
