//! Bounded connection pools with interruptible leases.
//!
//! Each pool owns a fixed number of connections for one role (reader, writer
//! or cache). Connections are validated when they are checked out; a broken
//! connection is discarded and replaced, and replacement is retried up to
//! `max_reconnect_attempts` times before the failure becomes fatal.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{self, Metrics, PoolError, RecycleError, RecycleResult, TimeoutType};
use deadpool::Runtime;
use deadpool_postgres::{ManagerConfig, RecyclingMethod};
use parking_lot::Mutex;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info, warn};

use super::connection::{BackendConnection, InterruptHandle, SqliteConnection};
use crate::config::{DatabaseConfig, ResourcesConfig};
use crate::dialect::{BackendKind, Dialect, DialectImpl};
use crate::error::{BulkError, Result};

/// What a pool is used for; each role is sized independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Reader,
    Writer,
    Cache,
}

impl PoolRole {
    pub fn name(self) -> &'static str {
        match self {
            PoolRole::Reader => "reader",
            PoolRole::Writer => "writer",
            PoolRole::Cache => "cache",
        }
    }
}

/// Sizing and timeout options of one pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub role: PoolRole,
    pub size: usize,
    pub acquire_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl PoolOptions {
    pub fn for_role(role: PoolRole, resources: &ResourcesConfig) -> Self {
        let size = match role {
            PoolRole::Reader => resources.get_reader_connections(),
            PoolRole::Writer => resources.get_writer_connections(),
            PoolRole::Cache => resources.get_cache_connections(),
        };
        Self {
            role,
            size,
            acquire_timeout: resources.acquire_timeout(),
            max_reconnect_attempts: resources.max_reconnect_attempts,
        }
    }
}

/// Creates and validates backend connections for deadpool.
pub struct BackendManager {
    target: ManagerTarget,
    validation_query: &'static str,
}

enum ManagerTarget {
    Postgres(deadpool_postgres::Manager),
    Sqlite { path: String },
}

impl managed::Manager for BackendManager {
    type Type = BackendConnection;
    type Error = BulkError;

    async fn create(&self) -> std::result::Result<BackendConnection, BulkError> {
        match &self.target {
            ManagerTarget::Postgres(manager) => {
                let client = managed::Manager::create(manager).await?;
                Ok(BackendConnection::Postgres(client))
            }
            ManagerTarget::Sqlite { path } => {
                let path = path.clone();
                let conn = tokio::task::spawn_blocking(move || SqliteConnection::open(&path))
                    .await
                    .map_err(|e| BulkError::Task(format!("SQLite open failed: {}", e)))??;
                Ok(BackendConnection::Sqlite(conn))
            }
        }
    }

    async fn recycle(
        &self,
        conn: &mut BackendConnection,
        metrics: &Metrics,
    ) -> RecycleResult<BulkError> {
        match (&self.target, conn) {
            (ManagerTarget::Postgres(manager), BackendConnection::Postgres(client)) => {
                managed::Manager::recycle(manager, client, metrics)
                    .await
                    .map_err(|e| match e {
                        RecycleError::Backend(e) => RecycleError::Backend(BulkError::from(e)),
                        RecycleError::Message(m) => RecycleError::Message(m),
                    })
            }
            (_, conn) => conn
                .validate(self.validation_query)
                .await
                .map_err(RecycleError::Backend),
        }
    }
}

type InnerPool = managed::Pool<BackendManager>;

struct PoolShared {
    pool: InnerPool,
    dialect: DialectImpl,
    options: PoolOptions,
    leases: Mutex<HashMap<u64, InterruptHandle>>,
    next_lease: AtomicU64,
}

/// A fixed-size pool of backend connections.
///
/// Cloning is cheap; clones share the same connections and leases.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("role", &self.shared.options.role)
            .field("dialect", &self.shared.dialect.name())
            .field("size", &self.shared.options.size)
            .finish()
    }
}

impl ConnectionPool {
    /// Open a pool against the configured database.
    pub async fn connect(db: &DatabaseConfig, options: PoolOptions) -> Result<Self> {
        let kind = db.kind()?;
        let dialect = DialectImpl::for_kind(kind);

        let target = match kind {
            BackendKind::Postgis => {
                let mut pg_config = PgConfig::new();
                pg_config.host(&db.host);
                pg_config.port(db.port.unwrap_or(dialect.capabilities().default_port));
                pg_config.dbname(&db.database);
                pg_config.user(&db.user);
                pg_config.password(&db.password);
                pg_config.connect_timeout(options.acquire_timeout);
                pg_config.application_name("featurebulk");
                pg_config.options(&format!("-c search_path={},public", db.schema));

                let mgr_config = ManagerConfig {
                    recycling_method: RecyclingMethod::Verified,
                };
                ManagerTarget::Postgres(deadpool_postgres::Manager::from_config(
                    pg_config, NoTls, mgr_config,
                ))
            }
            BackendKind::Sqlite => ManagerTarget::Sqlite {
                path: db.database.clone(),
            },
            BackendKind::Oracle => {
                return Err(BulkError::Config(
                    "Oracle connections require an OCI driver, which this build does not link; \
                     the Oracle dialect is available for SQL generation only"
                        .to_string(),
                ))
            }
        };

        let pool = Self::build(target, dialect, options).await?;
        info!(
            "Connected {} pool ({} connections) to {}: {}",
            pool.shared.options.role.name(),
            pool.shared.options.size,
            kind.name(),
            db.describe(pool.dialect().capabilities().default_port)
        );
        Ok(pool)
    }

    /// Open a pool over a local SQLite database file.
    pub async fn sqlite(path: impl Into<String>, options: PoolOptions) -> Result<Self> {
        let path = path.into();
        let pool = Self::build(
            ManagerTarget::Sqlite { path: path.clone() },
            DialectImpl::for_kind(BackendKind::Sqlite),
            options,
        )
        .await?;
        info!(
            "Opened {} pool ({} connections) on {}",
            pool.shared.options.role.name(),
            pool.shared.options.size,
            path
        );
        Ok(pool)
    }

    async fn build(target: ManagerTarget, dialect: DialectImpl, options: PoolOptions) -> Result<Self> {
        let manager = BackendManager {
            target,
            validation_query: dialect.validation_query(),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(options.size.max(1))
            .wait_timeout(Some(options.acquire_timeout))
            .create_timeout(Some(options.acquire_timeout))
            .recycle_timeout(Some(options.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BulkError::Config(format!("Failed to create pool: {}", e)))?;

        let this = Self {
            shared: Arc::new(PoolShared {
                pool,
                dialect,
                options,
                leases: Mutex::new(HashMap::new()),
                next_lease: AtomicU64::new(1),
            }),
        };

        // Test connection
        let conn = this.acquire().await?;
        conn.validate(this.dialect().validation_query()).await?;
        drop(conn);

        Ok(this)
    }

    /// Replace the dialect, e.g. to adjust capabilities for an older server.
    pub fn with_dialect(self, dialect: DialectImpl) -> Self {
        match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                shared.dialect = dialect;
                Self {
                    shared: Arc::new(shared),
                }
            }
            Err(shared) => {
                warn!("Pool is shared; keeping its dialect");
                Self { shared }
            }
        }
    }

    pub fn dialect(&self) -> &DialectImpl {
        &self.shared.dialect
    }

    pub fn role(&self) -> PoolRole {
        self.shared.options.role
    }

    /// Borrow a connection, waiting up to the acquire timeout.
    ///
    /// Waiting longer than the timeout is a fatal capacity error; failing to
    /// (re)connect more than `max_reconnect_attempts` times is a fatal
    /// connectivity error.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let options = &self.shared.options;
        let mut attempt = 0u32;

        loop {
            match self.shared.pool.get().await {
                Ok(conn) => {
                    let lease_id = self.shared.next_lease.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .leases
                        .lock()
                        .insert(lease_id, conn.interrupt_handle());
                    return Ok(PooledConnection {
                        conn,
                        lease_id,
                        shared: Arc::clone(&self.shared),
                    });
                }
                Err(PoolError::Timeout(TimeoutType::Wait)) => {
                    return Err(BulkError::capacity(format!(
                        "no {} connection available within {:?} (pool size {})",
                        options.role.name(),
                        options.acquire_timeout,
                        options.size
                    )));
                }
                Err(PoolError::Closed) => {
                    return Err(BulkError::connectivity(
                        "pool is closed",
                        format!("acquire {} connection", options.role.name()),
                    ));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > options.max_reconnect_attempts {
                        return Err(BulkError::connectivity(
                            e.to_string(),
                            format!(
                                "acquire {} connection after {} reconnect attempts",
                                options.role.name(),
                                options.max_reconnect_attempts
                            ),
                        ));
                    }
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(6)));
                    warn!(
                        "Failed to open {} connection (attempt {}/{}): {}; retrying in {:?}",
                        options.role.name(),
                        attempt,
                        options.max_reconnect_attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Cancel the statement running on one borrowed connection.
    pub async fn interrupt(&self, lease_id: u64) -> bool {
        let handle = self.shared.leases.lock().get(&lease_id).cloned();
        match handle {
            Some(handle) => {
                handle.interrupt().await;
                true
            }
            None => false,
        }
    }

    /// Cancel statements on every borrowed connection.
    pub async fn interrupt_all(&self) -> usize {
        let handles: Vec<_> = self.shared.leases.lock().values().cloned().collect();
        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.interrupt())).await;
        if count > 0 {
            info!(
                "Interrupted {} in-flight statement(s) on {} pool",
                count,
                self.role().name()
            );
        }
        count
    }

    /// Number of connections currently lent out.
    pub fn leased(&self) -> usize {
        self.shared.leases.lock().len()
    }

    /// Close the pool; outstanding leases are dropped when returned.
    pub fn close(&self) {
        self.shared.pool.close();
    }
}

/// A borrowed connection; returned to the pool on drop.
pub struct PooledConnection {
    conn: managed::Object<BackendManager>,
    lease_id: u64,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    pub fn dialect(&self) -> &DialectImpl {
        &self.shared.dialect
    }
}

impl Deref for PooledConnection {
    type Target = BackendConnection;

    fn deref(&self) -> &BackendConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.shared.leases.lock().remove(&self.lease_id);
        debug!(lease = self.lease_id, "Released connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(size: usize) -> PoolOptions {
        PoolOptions {
            role: PoolRole::Cache,
            size,
            acquire_timeout: Duration::from_millis(200),
            max_reconnect_attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_capacity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::sqlite(path.to_string_lossy(), options(1))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.leased(), 1);

        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Capacity);

        drop(held);
        assert_eq!(pool.leased(), 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_unopenable_database_is_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("nested").join("pool.db");
        let err = ConnectionPool::sqlite(path.to_string_lossy(), options(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }

    #[tokio::test]
    async fn test_interrupt_unknown_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.db");
        let pool = ConnectionPool::sqlite(path.to_string_lossy(), options(2))
            .await
            .unwrap();
        let conn = pool.acquire().await.unwrap();
        assert!(pool.interrupt(conn.lease_id()).await);
        assert!(!pool.interrupt(conn.lease_id() + 1000).await);
    }
}
