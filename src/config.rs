use anyhow::{Result, anyhow};
use secrecy::SecretString;
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::time::Duration;

/// Default base DSN pointing at a local coordinator.
pub const DEFAULT_DSN: &str = "postgres://gpadmin@localhost:5432/postgres?sslmode=disable";

/// How per-database collectors choose which databases to visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerDbMode {
    All,
    Include,
    Exclude,
    None,
}

impl FromStr for PerDbMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            // `from_db` is a legacy spelling of `all`
            "all" | "from_db" => Ok(Self::All),
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            "none" => Ok(Self::None),
            other => Err(anyhow!(
                "invalid per-db mode '{other}', expected one of: all, include, exclude, none"
            )),
        }
    }
}

/// Per-database collection settings.
#[derive(Clone, Debug)]
pub struct PerDbConfig {
    pub mode: PerDbMode,
    pub db_list: BTreeSet<String>,
    pub connection_cache_enabled: bool,
}

impl Default for PerDbConfig {
    fn default() -> Self {
        Self {
            mode: PerDbMode::All,
            db_list: BTreeSet::from(["postgres".to_string()]),
            connection_cache_enabled: true,
        }
    }
}

/// Orchestrator retry / caching / circuit-breaker knobs.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub scrape_cache_max_age: Duration,
    pub connection_retry_attempts: u32,
    pub connection_retry_delay: Duration,
    pub collector_failure_threshold: u32,
    pub circuit_breaker_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scrape_cache_max_age: Duration::from_secs(30),
            connection_retry_attempts: 3,
            connection_retry_delay: Duration::from_secs(1),
            collector_failure_threshold: 3,
            circuit_breaker_enabled: true,
        }
    }
}

/// Primary connection pool sizing.
#[derive(Clone, Debug)]
pub struct DatasourceConfig {
    pub pool_max: u32,
    pub pool_min: u32,
    pub acquisition_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            pool_max: 5,
            pool_min: 1,
            acquisition_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Collector-facing configuration: which collectors run and their SQL knobs.
#[derive(Clone, Debug, Default)]
pub struct CollectorsConfig {
    pub enabled: HashSet<String>,
    pub per_db: PerDbConfig,
    pub table_vacuum_tuple_threshold: i32,
    pub gpbackup_history_url: Option<String>,
}

impl CollectorsConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Everything the exporter needs to run, assembled by the CLI dispatcher.
#[derive(Debug)]
pub struct Settings {
    pub http_port: u16,
    pub dsn: SecretString,
    pub scrape_interval: Duration,
    pub orchestrator: OrchestratorConfig,
    pub datasource: DatasourceConfig,
    pub collectors: CollectorsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_db_mode_from_str() {
        assert_eq!("all".parse::<PerDbMode>().unwrap(), PerDbMode::All);
        assert_eq!("include".parse::<PerDbMode>().unwrap(), PerDbMode::Include);
        assert_eq!("exclude".parse::<PerDbMode>().unwrap(), PerDbMode::Exclude);
        assert_eq!("none".parse::<PerDbMode>().unwrap(), PerDbMode::None);
        assert_eq!("NONE".parse::<PerDbMode>().unwrap(), PerDbMode::None);
    }

    #[test]
    fn test_per_db_mode_from_db_synonym() {
        // legacy config surface used `from_db` where the docs said `all`
        assert_eq!("from_db".parse::<PerDbMode>().unwrap(), PerDbMode::All);
    }

    #[test]
    fn test_per_db_mode_invalid() {
        assert!("some".parse::<PerDbMode>().is_err());
        assert!("".parse::<PerDbMode>().is_err());
    }

    #[test]
    fn test_orchestrator_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.scrape_cache_max_age, Duration::from_secs(30));
        assert_eq!(cfg.connection_retry_attempts, 3);
        assert_eq!(cfg.connection_retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.collector_failure_threshold, 3);
        assert!(cfg.circuit_breaker_enabled);
    }

    #[test]
    fn test_datasource_defaults() {
        let cfg = DatasourceConfig::default();
        assert_eq!(cfg.pool_max, 5);
        assert_eq!(cfg.pool_min, 1);
        assert_eq!(cfg.acquisition_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_per_db_defaults() {
        let cfg = PerDbConfig::default();
        assert_eq!(cfg.mode, PerDbMode::All);
        assert!(cfg.db_list.contains("postgres"));
        assert!(cfg.connection_cache_enabled);
    }
}
