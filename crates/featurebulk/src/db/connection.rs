//! A live backend connection and the handle used to interrupt it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;
use tracing::debug;

use super::value::{pg_row_to_row, sqlite_row_to_row, Row, SqlValue};
use crate::error::{BulkError, Result};

/// An embedded SQLite connection shared with blocking tasks.
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    interrupt: Arc<rusqlite::InterruptHandle>,
}

impl SqliteConnection {
    /// Open a database file with the pragmas used for cache workloads.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| BulkError::Task(format!("SQLite task failed: {}", e)))?
        .map_err(BulkError::from)
    }
}

/// Cancels the statement currently running on one connection.
#[derive(Clone)]
pub enum InterruptHandle {
    Postgres(tokio_postgres::CancelToken),
    Sqlite(Arc<rusqlite::InterruptHandle>),
}

impl InterruptHandle {
    pub async fn interrupt(&self) {
        match self {
            InterruptHandle::Postgres(token) => {
                if let Err(e) = token.cancel_query(NoTls).await {
                    debug!("Cancel request failed: {}", e);
                }
            }
            InterruptHandle::Sqlite(handle) => handle.interrupt(),
        }
    }
}

/// A connection to one of the supported backends.
pub enum BackendConnection {
    Postgres(deadpool_postgres::ClientWrapper),
    Sqlite(SqliteConnection),
}

impl BackendConnection {
    pub fn interrupt_handle(&self) -> InterruptHandle {
        match self {
            BackendConnection::Postgres(client) => InterruptHandle::Postgres(client.cancel_token()),
            BackendConnection::Sqlite(conn) => InterruptHandle::Sqlite(Arc::clone(&conn.interrupt)),
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self {
            BackendConnection::Postgres(client) => {
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
                Ok(client.execute(sql, &refs).await?)
            }
            BackendConnection::Sqlite(conn) => {
                let sql = sql.to_string();
                let params = params.to_vec();
                conn.run(move |c| {
                    let mut stmt = c.prepare_cached(&sql)?;
                    stmt.execute(rusqlite::params_from_iter(params.iter()))
                        .map(|n| n as u64)
                })
                .await
            }
        }
    }

    /// Run a query and collect all rows.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match self {
            BackendConnection::Postgres(client) => {
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
                let rows = client.query(sql, &refs).await?;
                rows.iter().map(pg_row_to_row).collect()
            }
            BackendConnection::Sqlite(conn) => {
                let sql = sql.to_string();
                let params = params.to_vec();
                conn.run(move |c| {
                    let mut stmt = c.prepare_cached(&sql)?;
                    let columns = stmt.column_count();
                    let rows = stmt
                        .query_map(rusqlite::params_from_iter(params.iter()), |r| {
                            sqlite_row_to_row(r, columns)
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await
            }
        }
    }

    /// Run a query expected to return at most one row.
    pub async fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a query returning a single integer.
    pub async fn query_i64(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.query_opt(sql, params)
            .await?
            .ok_or_else(|| BulkError::conversion("query", format!("no rows returned: {}", sql)))?
            .get_i64(0)
    }

    /// Execute one or more statements without parameters.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        match self {
            BackendConnection::Postgres(client) => Ok(client.batch_execute(sql).await?),
            BackendConnection::Sqlite(conn) => {
                let sql = sql.to_string();
                conn.run(move |c| c.execute_batch(&sql)).await
            }
        }
    }

    pub async fn begin(&self) -> Result<()> {
        self.batch_execute("BEGIN").await
    }

    pub async fn commit(&self) -> Result<()> {
        self.batch_execute("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.batch_execute("ROLLBACK").await
    }

    /// Connection-level health check.
    pub async fn validate(&self, validation_query: &str) -> Result<()> {
        self.batch_execute(validation_query).await
    }
}
