//! Column layouts of the transient cache tables.

use crate::dialect::{ColumnDef, SqlType};

/// Longest external identifier stored in cache tables.
pub const MAX_EXTERNAL_ID_LEN: u32 = 256;

/// One kind of transient table. Several partitions of a model coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTableModel {
    /// Deferred references ("xlinks") waiting for their target.
    PendingReference,
    /// Identifier cache entries spilled from memory.
    IdCache,
}

impl CacheTableModel {
    /// Short name used in table names.
    pub fn name(self) -> &'static str {
        match self {
            CacheTableModel::PendingReference => "xlink",
            CacheTableModel::IdCache => "ids",
        }
    }

    /// Whether rows carry a manager-assigned sequential `id` key.
    pub fn has_sequence_key(self) -> bool {
        matches!(self, CacheTableModel::PendingReference)
    }

    pub fn key_column(self) -> &'static str {
        match self {
            CacheTableModel::PendingReference => "id",
            CacheTableModel::IdCache => "external_id",
        }
    }

    /// All columns, key first.
    pub fn columns(self) -> Vec<ColumnDef> {
        match self {
            CacheTableModel::PendingReference => vec![
                ColumnDef::new("id", SqlType::BigInt).not_null(),
                ColumnDef::new("origin_table", SqlType::Varchar(128)).not_null(),
                ColumnDef::new("origin_column", SqlType::Varchar(128)).not_null(),
                ColumnDef::new("origin_id", SqlType::BigInt).not_null(),
                ColumnDef::new("target_external_id", SqlType::Varchar(MAX_EXTERNAL_ID_LEN))
                    .not_null(),
                ColumnDef::new("payload_column", SqlType::Varchar(128)),
                ColumnDef::new("payload_value", SqlType::Text),
            ],
            CacheTableModel::IdCache => vec![
                ColumnDef::new("external_id", SqlType::Varchar(MAX_EXTERNAL_ID_LEN)).not_null(),
                ColumnDef::new("internal_id", SqlType::BigInt).not_null(),
                ColumnDef::new("consumed", SqlType::Boolean).not_null(),
            ],
        }
    }

    /// Columns supplied by callers when inserting (the sequence key is not).
    pub fn insert_columns(self) -> Vec<String> {
        self.columns()
            .into_iter()
            .map(|c| c.name)
            .filter(|name| !(self.has_sequence_key() && name == self.key_column()))
            .collect()
    }

    pub fn column_names(self) -> Vec<String> {
        self.columns().into_iter().map(|c| c.name).collect()
    }
}

/// Address of one partition of a cache table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheTableHandle {
    pub model: CacheTableModel,
    pub partition: usize,
    pub name: String,
}

impl CacheTableHandle {
    /// Deterministic table name `<prefix>_<model>_<partition>`.
    pub fn new(prefix: &str, model: CacheTableModel, partition: usize) -> Self {
        Self {
            model,
            partition,
            name: format!("{}_{}_{}", prefix, model.name(), partition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_name() {
        let handle = CacheTableHandle::new("tmp_0a1b2c3d", CacheTableModel::PendingReference, 3);
        assert_eq!(handle.name, "tmp_0a1b2c3d_xlink_3");
    }

    #[test]
    fn test_insert_columns_skip_sequence_key() {
        let cols = CacheTableModel::PendingReference.insert_columns();
        assert_eq!(cols.first().map(String::as_str), Some("origin_table"));
        assert_eq!(cols.len(), 6);

        let cols = CacheTableModel::IdCache.insert_columns();
        assert_eq!(cols, vec!["external_id", "internal_id", "consumed"]);
    }
}
