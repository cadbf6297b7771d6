use crate::gg::fault::{CircuitBreaker, FaultPolicy};
use crate::gg::version::GreengageVersion;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use sqlx::PgPool;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(5);

const VERSION_PROBE: FaultPolicy = FaultPolicy {
    attempts: 3,
    delay: Duration::from_secs(1),
    timeout: Duration::from_secs(5),
};

/// Version-detection breaker: after 10 failed probes stop hammering the
/// coordinator for 30 seconds.
const VERSION_BREAKER_THRESHOLD: u32 = 10;
const VERSION_BREAKER_OPEN: Duration = Duration::from_secs(30);

/// The orchestrator's view of the coordinator: connectivity test plus
/// version detection. Split out as a trait so scrape logic can be exercised
/// against scripted probes.
pub trait DatabaseProbe: Send + Sync {
    fn test_connection(&self) -> BoxFuture<'_, bool>;
    fn detect_version(&self) -> BoxFuture<'_, Result<GreengageVersion>>;
}

/// Coordinator-facing operations with fault tolerance.
pub struct DatabaseService {
    pool: PgPool,
    cached_version: RwLock<Option<GreengageVersion>>,
    probe_lock: tokio::sync::Mutex<()>,
    breaker: CircuitBreaker,
}

impl DatabaseService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cached_version: RwLock::new(None),
            probe_lock: tokio::sync::Mutex::new(()),
            breaker: CircuitBreaker::new(VERSION_BREAKER_THRESHOLD, VERSION_BREAKER_OPEN),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `SELECT 1` with a bounded timeout. Never errors, only reports
    /// reachability.
    pub async fn test_connection(&self) -> bool {
        let probe = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool);
        match tokio::time::timeout(CONNECTION_TEST_TIMEOUT, probe).await {
            Ok(Ok(1)) => true,
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                debug!("connection test failed: {e}");
                false
            }
            Err(_) => {
                warn!("connection test timed out after {CONNECTION_TEST_TIMEOUT:?}");
                false
            }
        }
    }

    /// Detect and cache the Greengage version.
    ///
    /// The first caller probes the server under the fault policy; everyone
    /// else reads the cache lock-free afterwards. A parse failure is an
    /// error, callers retry on the next scrape.
    pub async fn detect_version(&self) -> Result<GreengageVersion> {
        if let Some(version) = self.cached() {
            return Ok(version);
        }

        let _guard = self.probe_lock.lock().await;
        if let Some(version) = self.cached() {
            return Ok(version);
        }

        let version = VERSION_PROBE
            .run(&self.breaker, || self.query_version())
            .await?;

        info!("Detected Greengage version: {}", version.raw);
        self.cached_version
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(version.clone());

        Ok(version)
    }

    fn cached(&self) -> Option<GreengageVersion> {
        self.cached_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn query_version(&self) -> Result<GreengageVersion> {
        let raw: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await?;
        GreengageVersion::parse(&raw)
            .ok_or_else(|| anyhow!("could not parse Greengage version from: {raw}"))
    }
}

impl DatabaseProbe for DatabaseService {
    fn test_connection(&self) -> BoxFuture<'_, bool> {
        Box::pin(DatabaseService::test_connection(self))
    }

    fn detect_version(&self) -> BoxFuture<'_, Result<GreengageVersion>> {
        Box::pin(DatabaseService::detect_version(self))
    }
}
