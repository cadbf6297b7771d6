use crate::cli::actions::Action;
use crate::cli::commands::collectors::enabled_collectors;
use crate::config::{
    CollectorsConfig, DatasourceConfig, OrchestratorConfig, PerDbConfig, PerDbMode, Settings,
};
use anyhow::{Result, anyhow};
use secrecy::SecretString;
use std::collections::BTreeSet;
use std::time::Duration;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = SecretString::from(
        matches
            .get_one::<String>("dsn")
            .cloned()
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?,
    );

    let per_db = PerDbConfig {
        mode: matches
            .get_one::<String>("per-db-mode")
            .map(String::as_str)
            .unwrap_or("all")
            .parse::<PerDbMode>()?,
        db_list: parse_db_list(
            matches
                .get_one::<String>("per-db-list")
                .map(String::as_str)
                .unwrap_or_default(),
        ),
        connection_cache_enabled: flag(matches, "per-db-connection-cache", true),
    };

    let settings = Settings {
        http_port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        dsn,
        scrape_interval: duration(matches, "scrape-interval", Duration::from_secs(15)),
        orchestrator: OrchestratorConfig {
            scrape_cache_max_age: duration(matches, "scrape-cache-max-age", Duration::from_secs(30)),
            connection_retry_attempts: matches
                .get_one::<u32>("connection-retry-attempts")
                .copied()
                .unwrap_or(3),
            connection_retry_delay: duration(
                matches,
                "connection-retry-delay",
                Duration::from_secs(1),
            ),
            collector_failure_threshold: matches
                .get_one::<u32>("collector-failure-threshold")
                .copied()
                .unwrap_or(3),
            circuit_breaker_enabled: flag(matches, "circuit-breaker-enabled", true),
        },
        datasource: DatasourceConfig {
            pool_max: matches.get_one::<u32>("pool-max").copied().unwrap_or(5),
            pool_min: matches.get_one::<u32>("pool-min").copied().unwrap_or(1),
            acquisition_timeout: duration(matches, "acquisition-timeout", Duration::from_secs(5)),
            max_lifetime: duration(matches, "max-lifetime", Duration::from_secs(1800)),
        },
        collectors: CollectorsConfig {
            enabled: enabled_collectors(matches),
            per_db,
            table_vacuum_tuple_threshold: matches
                .get_one::<i32>("table-vacuum-tuple-threshold")
                .copied()
                .unwrap_or(1000),
            gpbackup_history_url: matches.get_one::<String>("gpbackup-history-url").cloned(),
        },
    };

    Ok(Action::Run { settings })
}

fn duration(matches: &clap::ArgMatches, id: &str, default: Duration) -> Duration {
    matches.get_one::<Duration>(id).copied().unwrap_or(default)
}

fn flag(matches: &clap::ArgMatches, id: &str, default: bool) -> bool {
    matches.get_one::<bool>(id).copied().unwrap_or(default)
}

fn parse_db_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
