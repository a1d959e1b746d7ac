//! SQLite dialect for local cache tables and lightweight targets.
//!
//! Geometries are stored as WKT text; there are no spatial predicates.

use super::{
    BackendKind, BoundingBox, ColumnDef, Dialect, DialectCapabilities, SpatialPredicate, SqlColumn,
    SqlFragment, SqlType, TableDurability,
};

/// SQLite dialect implementation.
#[derive(Debug, Clone)]
pub struct SqliteDialect {
    caps: DialectCapabilities,
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self {
            caps: DialectCapabilities {
                kind: BackendKind::Sqlite,
                default_port: 0,
                max_batch_size: 5_000,
                // SQLITE_MAX_VARIABLE_NUMBER of the bundled library
                max_bind_params: 32_766,
                supports_fetch_first: true,
                supports_multi_row_values: true,
                supports_unlogged_tables: false,
                spatial_index_hint: false,
                driver: "rusqlite",
            },
        }
    }

    pub(crate) fn capabilities_mut(&mut self) -> &mut DialectCapabilities {
        &mut self.caps
    }
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for SqliteDialect {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.caps
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn sql_type(&self, ty: SqlType) -> String {
        match ty {
            SqlType::Integer | SqlType::BigInt | SqlType::Boolean => "INTEGER".to_string(),
            SqlType::Numeric { precision, scale } => format!("NUMERIC({},{})", precision, scale),
            SqlType::Double => "REAL".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR({})", len),
            SqlType::Text | SqlType::Timestamp | SqlType::Geometry => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
        }
    }

    fn identity_column(&self, name: &str) -> String {
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote_ident(name))
    }

    fn geometry_from_text(&self, param: &str, _srid: i32) -> String {
        param.to_string()
    }

    fn geometry_to_text(&self, column: &str) -> String {
        column.to_string()
    }

    fn spatial_predicate(
        &self,
        _predicate: SpatialPredicate,
        _column: &str,
        _geometry: &str,
    ) -> SqlFragment {
        SqlFragment::NotApplicable
    }

    fn envelope(&self, _bbox: &BoundingBox, _srid: i32) -> SqlFragment {
        SqlFragment::NotApplicable
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
        _durability: TableDurability,
    ) -> String {
        let mut defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        if let Some(pk) = primary_key {
            defs.push(format!("PRIMARY KEY ({})", self.quote_ident(pk)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
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
            .map(|c| format!("{} = excluded.{}", self.quote_ident(c), self.quote_ident(c)))
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
        let values = (1..=columns.len())
            .map(|i| self.param_placeholder(i))
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
