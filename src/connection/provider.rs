use crate::config::{PerDbConfig, PerDbMode};
use crate::connection::factory::DbDatasourceFactory;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, warn};

const LIST_DATABASES_SQL: &str = "SELECT datname FROM pg_database \
     WHERE datallowconn AND NOT datistemplate";

/// Hands per-database collectors a datasource per allowed database.
///
/// Cached mode keeps one pool per database for the life of the process;
/// non-cached mode creates throwaway pools tracked in a per-scrape list and
/// closed by [`cleanup`](Self::cleanup).
pub struct DbConnectionProvider {
    config: PerDbConfig,
    factory: DbDatasourceFactory,
    cache: tokio::sync::Mutex<HashMap<String, PgPool>>,
    temporary: tokio::sync::Mutex<Vec<PgPool>>,
}

impl DbConnectionProvider {
    pub fn new(config: PerDbConfig, factory: DbDatasourceFactory) -> Self {
        Self {
            config,
            factory,
            cache: tokio::sync::Mutex::new(HashMap::new()),
            temporary: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Datasources for all allowed databases, enumerated through the base
    /// connection. Enumeration failure or an empty filter result yields an
    /// empty list and the scrape proceeds with general collectors only.
    pub async fn datasources(&self, base: &PgPool) -> Vec<(String, PgPool)> {
        if self.config.mode == PerDbMode::None {
            debug!("Per-db mode is none, skipping all databases");
            return Vec::new();
        }

        let all = self.fetch_all_databases(base).await;
        if all.is_empty() {
            warn!("No databases found");
            return Vec::new();
        }

        let allowed = filter_databases(&all, &self.config);
        if allowed.is_empty() {
            warn!("No databases allowed after filtering. Available databases: {all:?}");
            return Vec::new();
        }

        self.datasources_for(allowed).await
    }

    async fn datasources_for(&self, names: BTreeSet<String>) -> Vec<(String, PgPool)> {
        let mut datasources = Vec::with_capacity(names.len());
        for name in names {
            match self.create_or_get(&name).await {
                Ok(pool) => datasources.push((name, pool)),
                Err(e) => error!("Error creating datasource for database '{name}': {e}"),
            }
        }
        datasources
    }

    async fn create_or_get(&self, name: &str) -> anyhow::Result<PgPool> {
        if self.config.connection_cache_enabled {
            let mut cache = self.cache.lock().await;
            if let Some(pool) = cache.get(name) {
                return Ok(pool.clone());
            }
            debug!("Creating cached datasource for database '{name}'");
            let pool = self.factory.create(name)?;
            cache.insert(name.to_string(), pool.clone());
            Ok(pool)
        } else {
            debug!("Creating temporary datasource for database '{name}'");
            let pool = self.factory.create(name)?;
            self.temporary.lock().await.push(pool.clone());
            Ok(pool)
        }
    }

    /// Close every throwaway datasource created during the current scrape.
    /// Idempotent; cached datasources are untouched.
    pub async fn cleanup(&self) {
        let pools: Vec<PgPool> = std::mem::take(&mut *self.temporary.lock().await);
        if pools.is_empty() {
            return;
        }
        debug!("Cleaning up {} temporary datasources", pools.len());
        for pool in pools {
            pool.close().await;
        }
    }

    /// Close cached datasources; called once at shutdown.
    pub async fn close_cached(&self) {
        let pools: HashMap<String, PgPool> = std::mem::take(&mut *self.cache.lock().await);
        for (name, pool) in pools {
            debug!("Closing cached datasource for database '{name}'");
            pool.close().await;
        }
    }

    async fn fetch_all_databases(&self, base: &PgPool) -> BTreeSet<String> {
        match sqlx::query_scalar::<_, String>(LIST_DATABASES_SQL)
            .fetch_all(base)
            .await
        {
            Ok(names) => {
                debug!("Found {} databases", names.len());
                names.into_iter().collect()
            }
            Err(e) => {
                error!("Error fetching database list: {e}");
                BTreeSet::new()
            }
        }
    }
}

/// Apply the configured per-db mode to the enumerated databases.
pub fn filter_databases(all: &BTreeSet<String>, config: &PerDbConfig) -> BTreeSet<String> {
    match config.mode {
        PerDbMode::All => all.clone(),
        PerDbMode::Include => all.intersection(&config.db_list).cloned().collect(),
        PerDbMode::Exclude => all.difference(&config.db_list).cloned().collect(),
        PerDbMode::None => BTreeSet::new(),
    }
}
