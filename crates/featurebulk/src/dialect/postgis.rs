//! PostgreSQL/PostGIS SQL dialect.

use super::{
    BoundingBox, ColumnDef, Dialect, DialectCapabilities, SpatialPredicate, SqlColumn, SqlFragment,
    SqlType, TableDurability, BackendKind,
};

/// PostGIS dialect implementation.
#[derive(Debug, Clone)]
pub struct PostgisDialect {
    caps: DialectCapabilities,
}

impl PostgisDialect {
    pub fn new() -> Self {
        Self {
            caps: DialectCapabilities {
                kind: BackendKind::Postgis,
                default_port: 5432,
                max_batch_size: 10_000,
                // Bind parameter indexes are 16-bit in the wire protocol
                max_bind_params: 65_535,
                supports_fetch_first: true,
                supports_multi_row_values: true,
                supports_unlogged_tables: true,
                spatial_index_hint: false,
                driver: "tokio-postgres",
            },
        }
    }

    pub(crate) fn capabilities_mut(&mut self) -> &mut DialectCapabilities {
        &mut self.caps
    }
}

impl Default for PostgisDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for PostgisDialect {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.caps
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn sql_type(&self, ty: SqlType) -> String {
        match ty {
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Numeric { precision, scale } => format!("NUMERIC({},{})", precision, scale),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Timestamp => "TIMESTAMP WITH TIME ZONE".to_string(),
            SqlType::Blob => "BYTEA".to_string(),
            SqlType::Geometry => "GEOMETRY".to_string(),
        }
    }

    fn identity_column(&self, name: &str) -> String {
        format!(
            "{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
            self.quote_ident(name)
        )
    }

    fn geometry_from_text(&self, param: &str, srid: i32) -> String {
        format!("ST_GeomFromText({}, {})", param, srid)
    }

    fn geometry_to_text(&self, column: &str) -> String {
        format!("ST_AsText({})", column)
    }

    fn spatial_predicate(
        &self,
        predicate: SpatialPredicate,
        column: &str,
        geometry: &str,
    ) -> SqlFragment {
        let sql = match predicate {
            SpatialPredicate::Intersects => format!("ST_Intersects({}, {})", column, geometry),
            SpatialPredicate::Within => format!("ST_Within({}, {})", column, geometry),
            SpatialPredicate::Contains => format!("ST_Contains({}, {})", column, geometry),
            SpatialPredicate::BboxOverlaps => format!("{} && {}", column, geometry),
        };
        SqlFragment::Sql(sql)
    }

    fn envelope(&self, bbox: &BoundingBox, srid: i32) -> SqlFragment {
        SqlFragment::Sql(format!(
            "ST_MakeEnvelope({}, {}, {}, {}, {})",
            bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y, srid
        ))
    }

    fn spatial_index_sql(&self, table: &str, index: &str, column: &str) -> SqlFragment {
        SqlFragment::Sql(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
            self.quote_ident(index),
            self.quote_ident(table),
            self.quote_ident(column)
        ))
    }

    fn limit_query(&self, inner: &str, order_col: &str, limit: usize) -> String {
        if !self.caps.supports_fetch_first {
            return self.build_row_number_query(inner, order_col, 1, limit as i64);
        }
        format!("{} ORDER BY {} LIMIT {}", inner, self.quote_ident(order_col), limit)
    }

    fn create_table_sql(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
        durability: TableDurability,
    ) -> String {
        let mut defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        if let Some(pk) = primary_key {
            defs.push(format!("PRIMARY KEY ({})", self.quote_ident(pk)));
        }

        let unlogged = durability == TableDurability::Transient && self.caps.supports_unlogged_tables;
        format!(
            "CREATE {}TABLE IF NOT EXISTS {} ({})",
            if unlogged { "UNLOGGED " } else { "" },
            self.quote_ident(table),
            defs.join(", ")
        )
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_ident(table))
    }

    fn build_multi_row_upsert(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        rows: usize,
    ) -> String {
        let insert = self.build_multi_row_insert(table, columns, rows);
        let conflict_cols = self.column_list(key_columns);

        let non_key: Vec<_> = columns.iter().filter(|c| !key_columns.contains(c)).collect();
        if non_key.is_empty() {
            return format!("{} ON CONFLICT ({}) DO NOTHING", insert, conflict_cols);
        }

        let update_set = non_key
            .iter()
            .map(|c| format!("{} = EXCLUDED.{}", self.quote_ident(c), self.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            insert, conflict_cols, update_set
        )
    }

    fn insert_returning_id(
        &self,
        table: &str,
        columns: &[SqlColumn],
        id_column: &str,
    ) -> SqlFragment {
        let names = columns
            .iter()
            .map(|c| self.quote_ident(c.name()))
            .collect::<Vec<_>>()
            .join(", ");
        let values = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let param = self.param_placeholder(i + 1);
                match c {
                    SqlColumn::Value(_) => param,
                    SqlColumn::Geometry { srid, .. } => self.geometry_from_text(&param, *srid),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        SqlFragment::Sql(format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            self.quote_ident(table),
            names,
            values,
            self.quote_ident(id_column)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        let dialect = PostgisDialect::new();
        assert_eq!(dialect.quote_ident("feature"), "\"feature\"");
        assert_eq!(dialect.quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_limit_query() {
        let dialect = PostgisDialect::new();
        assert_eq!(
            dialect.limit_query("SELECT \"id\" FROM \"feature\"", "id", 50),
            "SELECT \"id\" FROM \"feature\" ORDER BY \"id\" LIMIT 50"
        );
    }

    #[test]
    fn test_transient_table_is_unlogged() {
        let dialect = PostgisDialect::new();
        let sql = dialect.create_table_sql(
            "tmp_ab12cd34_xlink_0",
            &[
                ColumnDef::new("id", SqlType::BigInt).not_null(),
                ColumnDef::new("target_external_id", SqlType::Varchar(256)),
            ],
            Some("id"),
            TableDurability::Transient,
        );
        assert_eq!(
            sql,
            "CREATE UNLOGGED TABLE IF NOT EXISTS \"tmp_ab12cd34_xlink_0\" \
             (\"id\" BIGINT NOT NULL, \"target_external_id\" VARCHAR(256), PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_multi_row_upsert() {
        let dialect = PostgisDialect::new();
        let sql = dialect.build_multi_row_upsert(
            "tmp_ids_1",
            &["external_id".to_string(), "internal_id".to_string()],
            &["external_id".to_string()],
            2,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"tmp_ids_1\" (\"external_id\", \"internal_id\") VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (\"external_id\") DO UPDATE SET \"internal_id\" = EXCLUDED.\"internal_id\""
        );
    }

    #[test]
    fn test_insert_returning_id_wraps_geometry() {
        let dialect = PostgisDialect::new();
        let sql = dialect
            .insert_returning_id(
                "feature",
                &[
                    SqlColumn::Value("feature_type".to_string()),
                    SqlColumn::Geometry {
                        name: "geometry".to_string(),
                        srid: 25832,
                    },
                ],
                "id",
            )
            .into_option()
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"feature\" (\"feature_type\", \"geometry\") \
             VALUES ($1, ST_GeomFromText($2, 25832)) RETURNING \"id\""
        );
    }

    #[test]
    fn test_bbox_predicate() {
        let dialect = PostgisDialect::new();
        let envelope = dialect
            .envelope(
                &BoundingBox {
                    min_x: 1.0,
                    min_y: 2.0,
                    max_x: 3.0,
                    max_y: 4.0,
                },
                4326,
            )
            .into_option()
            .unwrap();
        assert_eq!(envelope, "ST_MakeEnvelope(1, 2, 3, 4, 4326)");
        assert_eq!(
            dialect.spatial_predicate(SpatialPredicate::BboxOverlaps, "geometry", &envelope),
            SqlFragment::Sql("geometry && ST_MakeEnvelope(1, 2, 3, 4, 4326)".to_string())
        );
    }
}
