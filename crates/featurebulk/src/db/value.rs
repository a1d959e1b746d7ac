//! Backend-neutral parameter and row values.

use std::error::Error;

use bytes::BytesMut;
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::error::{BulkError, Result};

/// A single bind parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(b) => Some(*b as i64),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::I64(v) => Some(v.to_string()),
            SqlValue::F64(v) => Some(v.to_string()),
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Null | SqlValue::Bytes(_) => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

// The server decides parameter types from the statement; integers and floats
// are narrowed or widened to whatever it inferred.
impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I64(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::F64(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Bytes(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Bool(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v as i64)),
            SqlValue::I64(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v)),
            SqlValue::F64(v) => ToSqlOutput::Owned(SqliteValue::Real(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::I64(v),
            ValueRef::Real(v) => SqlValue::F64(v),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, idx: usize) -> &SqlValue {
        self.values.get(idx).unwrap_or(&SqlValue::Null)
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64> {
        self.get_opt_i64(idx)?
            .ok_or_else(|| BulkError::conversion("row", format!("column {} is NULL", idx)))
    }

    pub fn get_opt_i64(&self, idx: usize) -> Result<Option<i64>> {
        match self.value(idx) {
            SqlValue::Null => Ok(None),
            v => v.as_i64().map(Some).ok_or_else(|| {
                BulkError::conversion("row", format!("column {} is not an integer: {:?}", idx, v))
            }),
        }
    }

    pub fn get_string(&self, idx: usize) -> Result<String> {
        self.get_opt_string(idx)?
            .ok_or_else(|| BulkError::conversion("row", format!("column {} is NULL", idx)))
    }

    pub fn get_opt_string(&self, idx: usize) -> Result<Option<String>> {
        match self.value(idx) {
            SqlValue::Null => Ok(None),
            v => v.clone().into_string().map(Some).ok_or_else(|| {
                BulkError::conversion("row", format!("column {} is not text: {:?}", idx, v))
            }),
        }
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// Convert a PostgreSQL row, column by column, into backend-neutral values.
pub(crate) fn pg_row_to_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
            Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).into(),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).into(),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
            Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(f64::from).into(),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.into(),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Bytes),
            _ => row.try_get::<_, Option<String>>(idx)?.into(),
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

/// Convert the current SQLite row into backend-neutral values.
pub(crate) fn sqlite_row_to_row(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(columns);
    for idx in 0..columns {
        values.push(SqlValue::from(row.get_ref(idx)?));
    }
    Ok(Row::new(values))
}
