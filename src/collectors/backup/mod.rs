use crate::collectors::entity::{EntityCollect, EntityDriver, EntitySupplier};
use crate::collectors::Collector;
use crate::config::CollectorsConfig;
use crate::gg::GreengageVersion;
use crate::metrics::{MeterId, MeterRegistry};
use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const SUCCESS_STATUS: &str = "success";
const FAILURE_STATUS: &str = "failure";

/// gpbackup stores timestamps as `YYYYMMDDhhmmss` strings in its SQLite
/// history database. The window function picks the latest row per
/// `(database, incremental, status)` deterministically.
const BACKUP_STATS_SQL: &str = r"
    WITH parsed AS (
        SELECT database_name,
               incremental,
               lower(status) AS status,
               CAST(strftime('%s',
                    substr(timestamp, 1, 4) || '-' || substr(timestamp, 5, 2) || '-' ||
                    substr(timestamp, 7, 2) || ' ' || substr(timestamp, 9, 2) || ':' ||
                    substr(timestamp, 11, 2) || ':' || substr(timestamp, 13, 2)) AS INTEGER)
                   AS start_epoch,
               CAST(strftime('%s',
                    substr(end_time, 1, 4) || '-' || substr(end_time, 5, 2) || '-' ||
                    substr(end_time, 7, 2) || ' ' || substr(end_time, 9, 2) || ':' ||
                    substr(end_time, 11, 2) || ':' || substr(end_time, 13, 2)) AS INTEGER)
                   AS end_epoch
        FROM backups
    ),
    ranked AS (
        SELECT parsed.*,
               ROW_NUMBER() OVER (
                   PARTITION BY database_name, incremental, status
                   ORDER BY start_epoch DESC
               ) AS rn
        FROM parsed
    ),
    counters AS (
        SELECT database_name, incremental, status, COUNT(*) AS backup_count
        FROM parsed
        GROUP BY database_name, incremental, status
    )
    SELECT r.database_name,
           r.incremental,
           r.status,
           c.backup_count,
           r.end_epoch - r.start_epoch AS duration_seconds,
           CAST(strftime('%s', 'now') AS INTEGER) - r.end_epoch AS seconds_since_completion
    FROM ranked r
    JOIN counters c ON c.database_name = r.database_name
                   AND c.incremental = r.incremental
                   AND c.status = r.status
    WHERE r.rn = 1";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackupKey {
    pub database_name: String,
    pub incremental: i64,
    pub status: String,
}

impl BackupKey {
    fn backup_type(&self) -> &'static str {
        if self.incremental == 0 {
            "full"
        } else {
            "incremental"
        }
    }

    fn backup_status(&self) -> &str {
        if self.status == SUCCESS_STATUS || self.status == FAILURE_STATUS {
            &self.status
        } else {
            "in_progress"
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupStats {
    pub count: i64,
    pub duration_seconds: f64,
    pub seconds_since_completion: f64,
}

/// Backup history from the gpbackup SQLite database, via its own pool.
/// Rows appear and age out, so deleted keys are unregistered.
pub struct GpBackupHistoryCollector {
    history: SqlitePool,
}

impl GpBackupHistoryCollector {
    pub fn new(history: SqlitePool) -> Self {
        Self { history }
    }
}

impl EntityCollect for GpBackupHistoryCollector {
    type Key = BackupKey;
    type Value = BackupStats;

    fn name(&self) -> &'static str {
        "gpbackup_history"
    }

    fn remove_deleted_metrics(&self) -> bool {
        true
    }

    fn collect_entities<'a>(
        &'a self,
        _pool: &'a PgPool,
        _version: &'a GreengageVersion,
    ) -> BoxFuture<'a, Result<HashMap<BackupKey, BackupStats>>> {
        Box::pin(async move {
            debug!("Collecting gpbackup history");

            let rows = sqlx::query(BACKUP_STATS_SQL)
                .fetch_all(&self.history)
                .await
                .context("error collecting gpbackup history stats")?;

            let mut entities = HashMap::with_capacity(rows.len());
            for row in rows {
                let key = BackupKey {
                    database_name: row.try_get("database_name")?,
                    incremental: row.try_get("incremental")?,
                    status: row.try_get("status")?,
                };
                entities.insert(
                    key,
                    BackupStats {
                        count: row.try_get("backup_count")?,
                        duration_seconds: row
                            .try_get::<Option<i64>, _>("duration_seconds")?
                            .unwrap_or(0) as f64,
                        seconds_since_completion: row
                            .try_get::<Option<i64>, _>("seconds_since_completion")?
                            .unwrap_or(0) as f64,
                    },
                );
            }

            Ok(entities)
        })
    }

    fn register_entity_metrics(
        &self,
        registry: &MeterRegistry,
        key: &BackupKey,
        supplier: EntitySupplier<BackupStats>,
    ) -> Result<Vec<MeterId>> {
        let mut meter_ids = Vec::with_capacity(3);

        let reader = supplier.clone();
        meter_ids.push(registry.register_gauge(
            "greengage_gpbackup_backup_count",
            "Total number of backups for the database and incremental/status. \
             Status can be success/failure/in_progress. Backup type can be full/incremental",
            &[
                ("database", &key.database_name),
                ("type", key.backup_type()),
                ("status", key.backup_status()),
            ],
            move || reader().map_or(f64::NAN, |s| s.count as f64),
        )?);

        if key.status == SUCCESS_STATUS || key.status == FAILURE_STATUS {
            let incremental = key.incremental.to_string();
            let reader = supplier.clone();
            meter_ids.push(registry.register_gauge(
                "greengage_gpbackup_last_backup_duration_seconds",
                "Duration of the last backup in seconds. Status can be success/failure. \
                 Backup type can be full/incremental",
                &[
                    ("database", &key.database_name),
                    ("incremental", &incremental),
                    ("status", &key.status),
                ],
                move || reader().map_or(f64::NAN, |s| s.duration_seconds),
            )?);
        }

        if key.status == SUCCESS_STATUS {
            let reader = supplier.clone();
            meter_ids.push(registry.register_gauge(
                "greengage_gpbackup_seconds_since_last_backup_completion",
                "Seconds since the last backup completion",
                &[
                    ("database", &key.database_name),
                    ("incremental", key.backup_type()),
                ],
                move || reader().map_or(f64::NAN, |s| s.seconds_since_completion),
            )?);
        }

        Ok(meter_ids)
    }
}

pub fn collector(config: &CollectorsConfig) -> Result<Arc<dyn Collector>> {
    let url = config
        .gpbackup_history_url
        .as_deref()
        .ok_or_else(|| anyhow!("gpbackup_history collector requires a history database URL"))?;
    let history = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_lazy(url)
        .context("invalid gpbackup history database URL")?;
    Ok(EntityDriver::shared(GpBackupHistoryCollector::new(history)))
}
