//! Oracle Spatial SQL dialect.
//!
//! Oracle has no `IF [NOT] EXISTS` for DDL before 23c, so create and drop are
//! wrapped in PL/SQL blocks that swallow the "already exists" (ORA-00955) and
//! "does not exist" (ORA-00942) errors. An IN-list holds at most 1000
//! expressions, which bounds the batch size.

use super::{
    BackendKind, BoundingBox, ColumnDef, Dialect, DialectCapabilities, SpatialPredicate, SqlColumn,
    SqlFragment, SqlType, TableDurability,
};

/// First release with `FETCH FIRST n ROWS ONLY` and identity columns.
const FETCH_FIRST_RELEASE: u32 = 12;

/// Oracle dialect implementation.
#[derive(Debug, Clone)]
pub struct OracleDialect {
    caps: DialectCapabilities,
    release: u32,
}

impl OracleDialect {
    /// Dialect for a current (19c) server.
    pub fn new() -> Self {
        Self::with_release(19)
    }

    /// Dialect for a specific major release, e.g. 11 for 11g.
    pub fn with_release(release: u32) -> Self {
        Self {
            caps: DialectCapabilities {
                kind: BackendKind::Oracle,
                default_port: 1521,
                max_batch_size: 1_000,
                max_bind_params: 65_535,
                supports_fetch_first: release >= FETCH_FIRST_RELEASE,
                supports_multi_row_values: false,
                supports_unlogged_tables: true,
                spatial_index_hint: true,
                driver: "oci",
            },
            release,
        }
    }

    pub fn release(&self) -> u32 {
        self.release
    }

    pub(crate) fn capabilities_mut(&mut self) -> &mut DialectCapabilities {
        &mut self.caps
    }

    fn ignore_error_block(statement: &str, ignored_code: i32) -> String {
        format!(
            "BEGIN EXECUTE IMMEDIATE '{}'; EXCEPTION WHEN OTHERS THEN IF SQLCODE != {} THEN RAISE; END IF; END;",
            statement.replace('\'', "''"),
            ignored_code
        )
    }
}

impl Default for OracleDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for OracleDialect {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.caps
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn sql_type(&self, ty: SqlType) -> String {
        match ty {
            SqlType::Integer => "NUMBER(10)".to_string(),
            SqlType::BigInt => "NUMBER(19)".to_string(),
            SqlType::Numeric { precision, scale } => format!("NUMBER({},{})", precision, scale),
            SqlType::Double => "BINARY_DOUBLE".to_string(),
            SqlType::Boolean => "NUMBER(1)".to_string(),
            SqlType::Varchar(len) => format!("VARCHAR2({} CHAR)", len.min(4000)),
            SqlType::Text => "CLOB".to_string(),
            SqlType::Timestamp => "TIMESTAMP WITH TIME ZONE".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Geometry => "MDSYS.SDO_GEOMETRY".to_string(),
        }
    }

    fn identity_column(&self, name: &str) -> String {
        if self.release >= FETCH_FIRST_RELEASE {
            format!(
                "{} NUMBER(19) GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
                self.quote_ident(name)
            )
        } else {
            // Pre-12c keys come from a sequence named after the table
            format!("{} NUMBER(19) PRIMARY KEY", self.quote_ident(name))
        }
    }

    fn geometry_from_text(&self, param: &str, srid: i32) -> String {
        format!("SDO_GEOMETRY(TO_CLOB({}), {})", param, srid)
    }

    fn geometry_to_text(&self, column: &str) -> String {
        format!("SDO_UTIL.TO_WKTGEOMETRY({})", column)
    }

    fn spatial_predicate(
        &self,
        predicate: SpatialPredicate,
        column: &str,
        geometry: &str,
    ) -> SqlFragment {
        let sql = match predicate {
            SpatialPredicate::Intersects => {
                format!("SDO_RELATE({}, {}, 'mask=ANYINTERACT') = 'TRUE'", column, geometry)
            }
            SpatialPredicate::Within => format!(
                "SDO_RELATE({}, {}, 'mask=INSIDE+COVEREDBY') = 'TRUE'",
                column, geometry
            ),
            SpatialPredicate::Contains => format!(
                "SDO_RELATE({}, {}, 'mask=CONTAINS+COVERS') = 'TRUE'",
                column, geometry
            ),
            SpatialPredicate::BboxOverlaps => {
                format!("SDO_FILTER({}, {}) = 'TRUE'", column, geometry)
            }
        };
        SqlFragment::Sql(sql)
    }

    fn envelope(&self, bbox: &BoundingBox, srid: i32) -> SqlFragment {
        SqlFragment::Sql(format!(
            "SDO_GEOMETRY(2003, {}, NULL, SDO_ELEM_INFO_ARRAY(1, 1003, 3), SDO_ORDINATE_ARRAY({}, {}, {}, {}))",
            srid, bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y
        ))
    }

    fn spatial_query_hint(&self, table: &str, index: &str) -> SqlFragment {
        SqlFragment::Sql(format!("/*+ INDEX({} {}) */", table, index))
    }

    fn validation_query(&self) -> &'static str {
        "SELECT 1 FROM DUAL"
    }

    fn limit_query(&self, inner: &str, order_col: &str, limit: usize) -> String {
        if !self.caps.supports_fetch_first {
            return self.build_row_number_query(inner, order_col, 1, limit as i64);
        }
        format!(
            "{} ORDER BY {} FETCH FIRST {} ROWS ONLY",
            inner,
            self.quote_ident(order_col),
            limit
        )
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

        let mut create = format!("CREATE TABLE {} ({})", self.quote_ident(table), defs.join(", "));
        if durability == TableDurability::Transient && self.caps.supports_unlogged_tables {
            create.push_str(" NOLOGGING");
        }
        Self::ignore_error_block(&create, -955)
    }

    fn drop_table_sql(&self, table: &str) -> String {
        Self::ignore_error_block(&format!("DROP TABLE {} PURGE", self.quote_ident(table)), -942)
    }

    fn create_index_sql(&self, table: &str, index: &str, columns: &[String]) -> String {
        let create = format!(
            "CREATE INDEX {} ON {} ({})",
            self.quote_ident(index),
            self.quote_ident(table),
            self.column_list(columns)
        );
        Self::ignore_error_block(&create, -955)
    }

    fn build_multi_row_insert(&self, table: &str, columns: &[String], rows: usize) -> String {
        let target = format!("{} ({})", self.quote_ident(table), self.column_list(columns));
        let intos = (0..rows)
            .map(|row| {
                format!(
                    "INTO {} VALUES {}",
                    target,
                    self.row_placeholders(row * columns.len(), columns.len())
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!("INSERT ALL {} SELECT 1 FROM DUAL", intos)
    }

    fn build_multi_row_upsert(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        rows: usize,
    ) -> String {
        let source_rows = (0..rows)
            .map(|row| {
                let values = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        format!(
                            "{} AS {}",
                            self.param_placeholder(row * columns.len() + i + 1),
                            self.quote_ident(c)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("SELECT {} FROM DUAL", values)
            })
            .collect::<Vec<_>>()
            .join(" UNION ALL ");

        let join_condition = key_columns
            .iter()
            .map(|k| format!("t.{} = s.{}", self.quote_ident(k), self.quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ");

        let non_key: Vec<_> = columns.iter().filter(|c| !key_columns.contains(c)).collect();

        let mut sql = format!(
            "MERGE INTO {} t USING ({}) s ON ({})",
            self.quote_ident(table),
            source_rows,
            join_condition
        );

        if !non_key.is_empty() {
            let update_set = non_key
                .iter()
                .map(|c| format!("t.{} = s.{}", self.quote_ident(c), self.quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", update_set));
        }

        let insert_vals = columns
            .iter()
            .map(|c| format!("s.{}", self.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            self.column_list(columns),
            insert_vals
        ));

        sql
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
        // The generated key comes back through an out-bind
        SqlFragment::Sql(format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {} INTO {}",
            self.quote_ident(table),
            names,
            values,
            self.quote_ident(id_column),
            self.param_placeholder(columns.len() + 1)
        ))
    }
}
