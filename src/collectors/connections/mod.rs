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

const CONNECTIONS_BY_STATE_V6: &str = r"
    SELECT a.state,
           COUNT(*) AS count
    FROM pg_stat_activity a
    WHERE a.pid <> pg_backend_pid()
    GROUP BY 1
    ORDER BY count DESC";

const CONNECTIONS_BY_STATE_V7: &str = r"
    SELECT state,
           COUNT(*) AS count
    FROM pg_stat_activity
    WHERE pid <> pg_backend_pid()
      AND backend_type = 'client backend'
    GROUP BY 1
    ORDER BY count DESC";

#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: String,
    pub count: i64,
}

/// Connection counts grouped by backend state (active, idle, waiting).
/// The key set is the small enumerated state space.
pub struct ConnectionsByStateCollector;

impl EntityCollect for ConnectionsByStateCollector {
    type Key = String;
    type Value = ConnectionStats;

    fn name(&self) -> &'static str {
        "connections_by_state"
    }

    fn collect_entities<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<String, ConnectionStats>>> {
        Box::pin(async move {
            debug!("Collecting connections by state");

            let sql = if version.is_at_least_v7() {
                CONNECTIONS_BY_STATE_V7
            } else {
                CONNECTIONS_BY_STATE_V6
            };

            let rows = sqlx::query(sql).fetch_all(pool).await?;
            let mut connections = HashMap::with_capacity(rows.len());
            for row in rows {
                let state = util::or_unknown(row.try_get("state")?);
                let count: i64 = row.try_get("count")?;
                connections.insert(state.clone(), ConnectionStats { state, count });
            }

            debug!("Collected connection info for {} states", connections.len());
            Ok(connections)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        state: &String,
        supplier: EntitySupplier<ConnectionStats>,
    ) -> Result<Vec<MeterId>> {
        let id = registry.register_gauge(
            "greengage_cluster_connections_total",
            "Total connections by state (active, idle, waiting)",
            &[("state", state)],
            move || supplier().map_or(0.0, |s| s.count as f64),
        )?;
        Ok(vec![id])
    }

    fn register_aggregate_metrics(
        &self,
        registry: &MeterRegistry,
        entities: &Arc<EntityState<String, ConnectionStats>>,
    ) -> Result<()> {
        let state = entities.clone();
        registry.register_gauge(
            "greengage_cluster_connections_all_states_total",
            "Total number of connections across all states",
            &[],
            move || state.snapshot().values().map(|s| s.count as f64).sum(),
        )?;
        Ok(())
    }
}

pub fn collector(_config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    Ok(EntityDriver::shared(ConnectionsByStateCollector))
}
