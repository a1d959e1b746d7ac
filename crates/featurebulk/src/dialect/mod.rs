//! SQL dialect adapters.
//!
//! One adapter per backend family, selected once at startup:
//!
//! - [`OracleDialect`]: Oracle Spatial (SDO_GEOMETRY)
//! - [`PostgisDialect`]: PostgreSQL with PostGIS
//! - [`SqliteDialect`]: embedded SQLite, used for local cache tables
//!
//! Callers depend only on the [`Dialect`] trait. [`DialectImpl`] provides
//! static dispatch over the concrete adapters.
//!
//! Adapters never fail: requests that have no meaning for a backend return
//! [`SqlFragment::NotApplicable`] so calling code can branch on the value.

mod oracle;
mod postgis;
mod sqlite;

pub use oracle::OracleDialect;
pub use postgis::PostgisDialect;
pub use sqlite::SqliteDialect;

use crate::error::{BulkError, Result};

/// Backend families understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Oracle,
    Postgis,
    Sqlite,
}

impl BackendKind {
    /// Parse a backend name as used in configuration files.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "oracle" | "oracle_spatial" => Some(BackendKind::Oracle),
            "postgis" | "postgres" | "postgresql" | "pg" => Some(BackendKind::Postgis),
            "sqlite" | "sqlite3" | "local" => Some(BackendKind::Sqlite),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Oracle => "oracle",
            BackendKind::Postgis => "postgis",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

/// Immutable description of what a backend supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectCapabilities {
    pub kind: BackendKind,
    /// Default network port; 0 for embedded backends.
    pub default_port: u16,
    /// Maximum rows per batch statement.
    pub max_batch_size: usize,
    /// Maximum bind parameters per statement.
    pub max_bind_params: usize,
    /// `FETCH FIRST` / `LIMIT` is available; otherwise row-number wrapping.
    pub supports_fetch_first: bool,
    /// `INSERT ... VALUES (..), (..)` is available.
    pub supports_multi_row_values: bool,
    /// Non-durable tables (no write-ahead logging) are available.
    pub supports_unlogged_tables: bool,
    /// Spatial predicates need an optimizer hint to use the spatial index.
    pub spatial_index_hint: bool,
    /// Name of the driver used to open connections.
    pub driver: &'static str,
}

impl DialectCapabilities {
    /// Rows that fit into one statement with `columns` bind parameters per row.
    pub fn rows_per_statement(&self, columns: usize) -> usize {
        let by_params = self.max_bind_params / columns.max(1);
        self.max_batch_size.min(by_params).max(1)
    }
}

/// Result of a SQL generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlFragment {
    Sql(String),
    /// The concept does not exist for this backend.
    NotApplicable,
}

impl SqlFragment {
    pub fn is_applicable(&self) -> bool {
        matches!(self, SqlFragment::Sql(_))
    }

    pub fn as_deref(&self) -> Option<&str> {
        match self {
            SqlFragment::Sql(sql) => Some(sql),
            SqlFragment::NotApplicable => None,
        }
    }

    pub fn into_option(self) -> Option<String> {
        match self {
            SqlFragment::Sql(sql) => Some(sql),
            SqlFragment::NotApplicable => None,
        }
    }
}

/// Type categories that can be requested from a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Numeric { precision: u8, scale: u8 },
    Double,
    Boolean,
    Varchar(u32),
    Text,
    Timestamp,
    Blob,
    Geometry,
}

/// Spatial predicate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialPredicate {
    Intersects,
    Within,
    Contains,
    /// Bounding boxes overlap (index-only filter).
    BboxOverlaps,
}

/// Axis-aligned bounding box in the storage SRID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Whether a table should survive a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableDurability {
    Durable,
    /// Transient data; skip write-ahead logging where possible.
    Transient,
}

/// Column definition for generated DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Auto-generated 64-bit primary key.
    pub identity: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            identity: false,
        }
    }

    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: SqlType::BigInt,
            nullable: false,
            identity: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Options for building a SELECT query.
#[derive(Debug, Clone, Default)]
pub struct SelectQueryOptions {
    /// Schema name; unqualified when `None`.
    pub schema: Option<String>,
    /// Table name.
    pub table: String,
    /// Columns to select (already-rendered expressions are allowed).
    pub columns: Vec<String>,
    /// Key column (for ordering and keyset pagination).
    pub pk_col: Option<String>,
    /// Minimum key value (exclusive).
    pub min_pk: Option<i64>,
    /// Additional WHERE clause.
    pub where_clause: Option<String>,
    /// Row limit (for batch reads).
    pub limit: Option<usize>,
}

/// SQL syntax strategy for one backend family.
///
/// Provides database-specific SQL generation while keeping the pipeline
/// database-agnostic. Default methods hold SQL that is portable across all
/// supported backends.
pub trait Dialect: Send + Sync {
    /// Immutable capability description.
    fn capabilities(&self) -> &DialectCapabilities;

    /// Get the dialect identifier (e.g., "oracle", "postgis").
    fn name(&self) -> &str {
        self.capabilities().kind.name()
    }

    /// Quote an identifier (table name, column name, etc.).
    fn quote_ident(&self, name: &str) -> String;

    /// Get a parameter placeholder for the given 1-based index.
    fn param_placeholder(&self, index: usize) -> String;

    /// Dialect type token for a type category.
    fn sql_type(&self, ty: SqlType) -> String;

    /// Column definition of an auto-generated 64-bit primary key.
    fn identity_column(&self, name: &str) -> String;

    /// Expression converting a WKT parameter into a stored geometry.
    fn geometry_from_text(&self, param: &str, srid: i32) -> String;

    /// Expression rendering a stored geometry column as WKT.
    fn geometry_to_text(&self, column: &str) -> String;

    /// Spatial predicate between a geometry column and a geometry expression.
    fn spatial_predicate(
        &self,
        predicate: SpatialPredicate,
        column: &str,
        geometry: &str,
    ) -> SqlFragment;

    /// Geometry expression for a bounding box.
    fn envelope(&self, bbox: &BoundingBox, srid: i32) -> SqlFragment;

    /// Optimizer hint that makes a spatial predicate use the spatial index.
    fn spatial_query_hint(&self, _table: &str, _index: &str) -> SqlFragment {
        SqlFragment::NotApplicable
    }

    /// Query used to validate pooled connections on checkout.
    fn validation_query(&self) -> &'static str {
        "SELECT 1"
    }

    /// Limit an ordered query to `limit` rows, using the native syntax when
    /// `supports_fetch_first` is set and row-number wrapping otherwise.
    fn limit_query(&self, inner: &str, order_col: &str, limit: usize) -> String;

    /// Build a SELECT query for reading rows.
    fn build_select_query(&self, opts: &SelectQueryOptions) -> String {
        let cols = if opts.columns.is_empty() {
            "*".to_string()
        } else {
            opts.columns.join(", ")
        };

        let table = match &opts.schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(&opts.table)),
            None => self.quote_ident(&opts.table),
        };

        let mut sql = format!("SELECT {} FROM {}", cols, table);

        let mut conditions = Vec::new();

        // Keyset pagination
        if let (Some(pk), Some(min_pk)) = (&opts.pk_col, opts.min_pk) {
            conditions.push(format!("{} > {}", self.quote_ident(pk), min_pk));
        }

        if let Some(ref where_clause) = opts.where_clause {
            if !where_clause.is_empty() {
                conditions.push(format!("({})", where_clause));
            }
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        match (&opts.pk_col, opts.limit) {
            (Some(pk), Some(limit)) => self.limit_query(&sql, pk, limit),
            (Some(pk), None) => format!("{} ORDER BY {}", sql, self.quote_ident(pk)),
            _ => sql,
        }
    }

    /// Build a ROW_NUMBER pagination query wrapper.
    fn build_row_number_query(
        &self,
        inner_query: &str,
        pk_col: &str,
        start_row: i64,
        end_row: i64,
    ) -> String {
        format!(
            "SELECT * FROM (SELECT fb_inner.*, ROW_NUMBER() OVER (ORDER BY {}) AS fb_rn FROM ({}) fb_inner) fb_numbered WHERE fb_rn >= {} AND fb_rn <= {} ORDER BY fb_rn",
            self.quote_ident(pk_col),
            inner_query,
            start_row,
            end_row
        )
    }

    /// Column clause of a CREATE TABLE statement.
    fn column_definition(&self, column: &ColumnDef) -> String {
        if column.identity {
            return self.identity_column(&column.name);
        }
        let mut def = format!(
            "{} {}",
            self.quote_ident(&column.name),
            self.sql_type(column.sql_type)
        );
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// CREATE INDEX statement; creating an existing index is a no-op.
    fn create_index_sql(&self, table: &str, index: &str, columns: &[String]) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote_ident(index),
            self.quote_ident(table),
            self.column_list(columns)
        )
    }

    /// Spatial index on a geometry column.
    fn spatial_index_sql(&self, _table: &str, _index: &str, _column: &str) -> SqlFragment {
        SqlFragment::NotApplicable
    }

    /// CREATE TABLE statement; creating an existing table is a no-op.
    fn create_table_sql(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
        durability: TableDurability,
    ) -> String;

    /// DROP TABLE statement; dropping a missing table is a no-op.
    fn drop_table_sql(&self, table: &str) -> String;

    /// Multi-row insert of `rows` rows with placeholders.
    fn build_multi_row_insert(&self, table: &str, columns: &[String], rows: usize) -> String {
        let col_list = self.column_list(columns);
        let values = (0..rows)
            .map(|row| self.row_placeholders(row * columns.len(), columns.len()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_ident(table),
            col_list,
            values
        )
    }

    /// Multi-row insert that overwrites rows with the same key.
    fn build_multi_row_upsert(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        rows: usize,
    ) -> String;

    /// Single-row insert returning the generated key.
    fn insert_returning_id(&self, table: &str, columns: &[SqlColumn], id_column: &str)
        -> SqlFragment;

    /// Batched UPDATE setting `set_columns` per key.
    ///
    /// Parameters are laid out per row as `key, value_1, .., value_n` in
    /// row order, followed by nothing else; the key list of the WHERE clause
    /// reuses the key placeholders.
    fn build_case_update(
        &self,
        table: &str,
        key_column: &str,
        set_columns: &[(String, SqlType)],
        rows: usize,
    ) -> String {
        let stride = set_columns.len() + 1;
        let key_type = self.sql_type(SqlType::BigInt);
        let assignments = set_columns
            .iter()
            .enumerate()
            .map(|(col_idx, (column, ty))| {
                let value_type = self.sql_type(*ty);
                let arms = (0..rows)
                    .map(|row| {
                        format!(
                            "WHEN {} THEN CAST({} AS {})",
                            self.param_placeholder(row * stride + 1),
                            self.param_placeholder(row * stride + 2 + col_idx),
                            value_type
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "{} = CASE {} {} END",
                    self.quote_ident(column),
                    self.quote_ident(key_column),
                    arms
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let keys = (0..rows)
            .map(|row| {
                format!(
                    "CAST({} AS {})",
                    self.param_placeholder(row * stride + 1),
                    key_type
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {} WHERE {} IN ({})",
            self.quote_ident(table),
            assignments,
            self.quote_ident(key_column),
            keys
        )
    }

    /// DELETE of `rows` keys.
    fn build_delete_by_keys(&self, table: &str, key_column: &str, rows: usize) -> String {
        let keys = (1..=rows)
            .map(|i| self.param_placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.quote_ident(table),
            self.quote_ident(key_column),
            keys
        )
    }

    /// Comma-separated quoted column list.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `(p, p, ..)` for one row starting after `offset` parameters.
    fn row_placeholders(&self, offset: usize, width: usize) -> String {
        let params = (1..=width)
            .map(|i| self.param_placeholder(offset + i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({})", params)
    }
}

/// Column of a single-row insert: a plain bind parameter, or a geometry
/// built from WKT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlColumn {
    Value(String),
    Geometry { name: String, srid: i32 },
}

impl SqlColumn {
    pub fn name(&self) -> &str {
        match self {
            SqlColumn::Value(name) => name,
            SqlColumn::Geometry { name, .. } => name,
        }
    }
}

/// Enum-based static dispatch for dialects.
///
/// The compiler generates a match statement instead of using vtable dispatch.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Oracle(OracleDialect),
    Postgis(PostgisDialect),
    Sqlite(SqliteDialect),
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $body:expr) => {
        match $self {
            DialectImpl::Oracle($d) => $body,
            DialectImpl::Postgis($d) => $body,
            DialectImpl::Sqlite($d) => $body,
        }
    };
}

impl DialectImpl {
    /// Create a dialect implementation from a database type string.
    ///
    /// # Errors
    ///
    /// Returns an error if the database type is not recognized.
    pub fn from_db_type(db_type: &str) -> Result<Self> {
        BackendKind::parse(db_type)
            .map(Self::for_kind)
            .ok_or_else(|| {
                BulkError::Config(format!(
                    "Unknown database type: '{}'. Supported types: oracle, postgis, sqlite",
                    db_type
                ))
            })
    }

    /// Default adapter for a backend kind.
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Oracle => DialectImpl::Oracle(OracleDialect::new()),
            BackendKind::Postgis => DialectImpl::Postgis(PostgisDialect::new()),
            BackendKind::Sqlite => DialectImpl::Sqlite(SqliteDialect::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.capabilities().kind
    }

    /// Adjust capabilities, e.g. to lower the batch size for a constrained
    /// server or to disable `FETCH FIRST` on an old release.
    pub fn with_capabilities(mut self, adjust: impl FnOnce(&mut DialectCapabilities)) -> Self {
        let capabilities = match &mut self {
            DialectImpl::Oracle(d) => d.capabilities_mut(),
            DialectImpl::Postgis(d) => d.capabilities_mut(),
            DialectImpl::Sqlite(d) => d.capabilities_mut(),
        };
        adjust(capabilities);
        self
    }
}

impl Dialect for DialectImpl {
    fn capabilities(&self) -> &DialectCapabilities {
        dispatch!(self, d => d.capabilities())
    }

    fn quote_ident(&self, name: &str) -> String {
        dispatch!(self, d => d.quote_ident(name))
    }

    fn param_placeholder(&self, index: usize) -> String {
        dispatch!(self, d => d.param_placeholder(index))
    }

    fn sql_type(&self, ty: SqlType) -> String {
        dispatch!(self, d => d.sql_type(ty))
    }

    fn identity_column(&self, name: &str) -> String {
        dispatch!(self, d => d.identity_column(name))
    }

    fn geometry_from_text(&self, param: &str, srid: i32) -> String {
        dispatch!(self, d => d.geometry_from_text(param, srid))
    }

    fn geometry_to_text(&self, column: &str) -> String {
        dispatch!(self, d => d.geometry_to_text(column))
    }

    fn spatial_predicate(
        &self,
        predicate: SpatialPredicate,
        column: &str,
        geometry: &str,
    ) -> SqlFragment {
        dispatch!(self, d => d.spatial_predicate(predicate, column, geometry))
    }

    fn envelope(&self, bbox: &BoundingBox, srid: i32) -> SqlFragment {
        dispatch!(self, d => d.envelope(bbox, srid))
    }

    fn spatial_query_hint(&self, table: &str, index: &str) -> SqlFragment {
        dispatch!(self, d => d.spatial_query_hint(table, index))
    }

    fn validation_query(&self) -> &'static str {
        dispatch!(self, d => d.validation_query())
    }

    fn limit_query(&self, inner: &str, order_col: &str, limit: usize) -> String {
        dispatch!(self, d => d.limit_query(inner, order_col, limit))
    }

    fn build_row_number_query(
        &self,
        inner_query: &str,
        pk_col: &str,
        start_row: i64,
        end_row: i64,
    ) -> String {
        dispatch!(self, d => d.build_row_number_query(inner_query, pk_col, start_row, end_row))
    }

    fn create_table_sql(
        &self,
        table: &str,
        columns: &[ColumnDef],
        primary_key: Option<&str>,
        durability: TableDurability,
    ) -> String {
        dispatch!(self, d => d.create_table_sql(table, columns, primary_key, durability))
    }

    fn drop_table_sql(&self, table: &str) -> String {
        dispatch!(self, d => d.drop_table_sql(table))
    }

    fn create_index_sql(&self, table: &str, index: &str, columns: &[String]) -> String {
        dispatch!(self, d => d.create_index_sql(table, index, columns))
    }

    fn spatial_index_sql(&self, table: &str, index: &str, column: &str) -> SqlFragment {
        dispatch!(self, d => d.spatial_index_sql(table, index, column))
    }

    fn build_multi_row_insert(&self, table: &str, columns: &[String], rows: usize) -> String {
        dispatch!(self, d => d.build_multi_row_insert(table, columns, rows))
    }

    fn build_multi_row_upsert(
        &self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        rows: usize,
    ) -> String {
        dispatch!(self, d => d.build_multi_row_upsert(table, columns, key_columns, rows))
    }

    fn insert_returning_id(
        &self,
        table: &str,
        columns: &[SqlColumn],
        id_column: &str,
    ) -> SqlFragment {
        dispatch!(self, d => d.insert_returning_id(table, columns, id_column))
    }
}
