//! Target tables of imported features.
//!
//! Every feature becomes one `feature` row; every reference becomes one
//! `feature_link` row whose `target_id` is filled in as soon as the target
//! is known, either inline or by the resolver.

use tracing::{debug, info};

use crate::cache::MAX_EXTERNAL_ID_LEN;
use crate::db::ConnectionPool;
use crate::dialect::{ColumnDef, Dialect, SqlType, TableDurability};
use crate::error::Result;

pub const FEATURE_TABLE: &str = "feature";
pub const LINK_TABLE: &str = "feature_link";

/// Column of `feature_link` written by the resolver.
pub const LINK_TARGET_COLUMN: &str = "target_id";
/// Column of `feature_link` written together with the target id.
pub const LINK_PAYLOAD_COLUMN: &str = "payload";

pub fn feature_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::identity("id"),
        ColumnDef::new("feature_type", SqlType::Varchar(128)).not_null(),
        ColumnDef::new("external_id", SqlType::Varchar(MAX_EXTERNAL_ID_LEN)).not_null(),
        ColumnDef::new("properties", SqlType::Text),
        ColumnDef::new("geometry", SqlType::Geometry),
    ]
}

pub fn link_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::identity("id"),
        ColumnDef::new("feature_id", SqlType::BigInt).not_null(),
        ColumnDef::new("role", SqlType::Varchar(128)).not_null(),
        ColumnDef::new("target_external_id", SqlType::Varchar(MAX_EXTERNAL_ID_LEN)).not_null(),
        ColumnDef::new(LINK_TARGET_COLUMN, SqlType::BigInt),
        ColumnDef::new(LINK_PAYLOAD_COLUMN, SqlType::Text),
    ]
}

/// Create the feature tables and their indexes if they do not exist.
pub async fn ensure_schema(pool: &ConnectionPool) -> Result<()> {
    let dialect = pool.dialect();
    let conn = pool.acquire().await?;

    for (table, columns) in [
        (FEATURE_TABLE, feature_columns()),
        (LINK_TABLE, link_columns()),
    ] {
        conn.batch_execute(&dialect.create_table_sql(
            table,
            &columns,
            None,
            TableDurability::Durable,
        ))
        .await?;
        debug!(table, "Ensured table");
    }

    let indexes: [(&str, &str, &[&str]); 4] = [
        (FEATURE_TABLE, "feature_external_id_idx", &["external_id"]),
        (FEATURE_TABLE, "feature_type_idx", &["feature_type"]),
        (LINK_TABLE, "feature_link_feature_idx", &["feature_id"]),
        (LINK_TABLE, "feature_link_target_idx", &["target_external_id"]),
    ];
    for (table, index, columns) in indexes {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        conn.batch_execute(&dialect.create_index_sql(table, index, &columns))
            .await?;
    }

    if let Some(sql) = dialect
        .spatial_index_sql(FEATURE_TABLE, "feature_geometry_idx", "geometry")
        .into_option()
    {
        conn.batch_execute(&sql).await?;
    }

    info!("Target schema ready ({})", dialect.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PoolOptions, PoolRole};
    use crate::dialect::{BackendKind, DialectImpl};
    use std::time::Duration;

    #[test]
    fn test_postgis_feature_ddl() {
        let dialect = DialectImpl::for_kind(BackendKind::Postgis);
        let sql = dialect.create_table_sql(
            FEATURE_TABLE,
            &feature_columns(),
            None,
            TableDurability::Durable,
        );
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"feature\""));
        assert!(sql.contains("\"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY"));
        assert!(sql.contains("\"geometry\" GEOMETRY"));
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.db");
        let pool = ConnectionPool::sqlite(
            path.to_str().unwrap(),
            PoolOptions {
                role: PoolRole::Writer,
                size: 1,
                acquire_timeout: Duration::from_secs(5),
                max_reconnect_attempts: 1,
            },
        )
        .await
        .unwrap();

        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        let tables = conn
            .query_i64(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'feature%'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(tables, 2);
    }
}
