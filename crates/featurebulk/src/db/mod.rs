//! Backend connections, pooling and values.

mod connection;
mod pool;
mod value;

pub use connection::{BackendConnection, InterruptHandle, SqliteConnection};
pub use pool::{ConnectionPool, PoolOptions, PoolRole, PooledConnection};
pub use value::{Row, SqlValue};
