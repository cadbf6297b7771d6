use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::MeterRegistry;
use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;

#[macro_use]
mod register_macro;

pub mod aggregate;
pub mod entity;
pub mod util;

pub mod backup;
pub mod cluster;
pub mod connections;
pub mod database;
pub mod host;
pub mod locks;
pub mod query;
pub mod replication;
pub mod segment;
pub mod tablehealth;
pub mod vacuum;

/// Which connection a collector receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectorGroup {
    /// Runs once per scrape on the coordinator connection.
    General,
    /// Runs once per allowed database, on a connection bound to it.
    PerDb,
}

impl fmt::Display for CollectorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General => write!(f, "general"),
            Self::PerDb => write!(f, "per_db"),
        }
    }
}

/// A metric collector driven by the orchestrator.
///
/// `register` runs once at startup for fixed metrics; `collect` runs every
/// scrape and may lazily register per-entity metrics.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn group(&self) -> CollectorGroup {
        CollectorGroup::General
    }

    fn register(&self, registry: &Arc<MeterRegistry>) -> Result<()>;

    // lifetime 'a ties the future to self, pool and version
    fn collect<'a>(
        &'a self,
        pool: &'a PgPool,
        version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Builds a collector from the collectors configuration.
pub type CollectorFactory = fn(&CollectorsConfig) -> Result<Arc<dyn Collector>>;

// THIS IS THE ONLY PLACE YOU NEED TO ADD NEW COLLECTORS
register_collectors! {
    cluster_state => cluster::collector,
    segment => segment::collector,
    connections_by_state => connections::collector,
    locked_sessions => locks::count::collector,
    extended_locked_sessions => locks::extended::collector,
    database_size => database::size::collector,
    replication_monitor => replication::collector,
    spill_per_host => host::spill::collector,
    disk_per_host => host::disk::collector,
    rsg_per_host => host::rsg::collector,
    active_query_duration => query::collector,
    table_vacuum_statistics => vacuum::table_stats::collector,
    db_vacuum_statistics => vacuum::db_stats::collector,
    vacuum_running => vacuum::running::collector,
    table_health => tablehealth::collector,
    gpbackup_history => backup::collector,
}

/// Collectors that need explicit opt-in: the backup collector requires a
/// secondary datasource, table health is deprecated and heavy on large
/// clusters.
pub const DISABLED_BY_DEFAULT: &[&str] = &["table_health", "gpbackup_history"];

/// Collector names enabled when the user passes no explicit flags.
#[must_use]
pub fn default_enabled_names() -> Vec<&'static str> {
    COLLECTOR_NAMES
        .iter()
        .copied()
        .filter(|name| !DISABLED_BY_DEFAULT.contains(name))
        .collect()
}
