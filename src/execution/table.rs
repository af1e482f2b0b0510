//! Growing result-set store shared between the execution worker and its
//! readers.
//!
//! Single writer (the worker appends), any number of readers (paged views,
//! renderers). All structural access goes through a reader-writer lock;
//! an append is atomic from a reader's perspective.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::driver::{ColumnMeta, SqlType, SqlValue};
use crate::error::{DeskError, Result};

/// Name of the synthetic leading column carrying the row's sequential
/// display index.
pub const ROWID_COL_NAME: &str = "#";

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub seq: u64,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn value_at(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }
}

#[derive(Default)]
struct TableModel {
    columns: Vec<ColumnMeta>,
    rows: Vec<Row>,
}

pub struct ResultTable {
    id: Uuid,
    model: RwLock<TableModel>,
    col_index: DashMap<String, usize>,
}

impl ResultTable {
    /// Create an empty table tied to the execution request that owns it.
    /// Columns and rows arrive later, as the cursor produces them.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            model: RwLock::new(TableModel::default()),
            col_index: DashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fix the column schema and clear any existing rows. The synthetic
    /// row-id column is prepended here; callers pass driver metadata
    /// only. Calling this again is a full reset.
    pub fn set_columns(&self, columns: Vec<ColumnMeta>) -> Result<()> {
        if columns.is_empty() {
            return Err(DeskError::Table(
                "no column metadata (names, types) were found".to_string(),
            ));
        }
        let mut full = Vec::with_capacity(columns.len() + 1);
        full.push(ColumnMeta::new(ROWID_COL_NAME, SqlType::RowId));
        full.extend(columns);

        let mut model = self.model.write();
        self.col_index.clear();
        for (idx, col) in full.iter().enumerate() {
            self.col_index.insert(col.name.clone(), idx);
        }
        model.columns = full;
        model.rows.clear();
        Ok(())
    }

    /// Append one row. `values` must align with the driver columns; the
    /// sequence number is materialized as the synthetic first value.
    pub fn append_row(&self, seq: u64, values: Vec<SqlValue>) -> Result<()> {
        let mut model = self.model.write();
        if model.columns.is_empty() {
            return Err(DeskError::Table(
                "column metadata (names, types) not defined".to_string(),
            ));
        }
        if values.len() + 1 != model.columns.len() {
            return Err(DeskError::Table(format!(
                "row arity {} does not match column count {}",
                values.len(),
                model.columns.len() - 1
            )));
        }
        let mut full = Vec::with_capacity(values.len() + 1);
        full.push(Value::from(seq));
        full.extend(values);
        model.rows.push(Row { seq, values: full });
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.model.read().rows.len()
    }

    pub fn get_row(&self, idx: usize) -> Option<Row> {
        self.model.read().rows.get(idx).cloned()
    }

    pub fn value_at(&self, row_idx: usize, col_idx: usize) -> Option<SqlValue> {
        self.model
            .read()
            .rows
            .get(row_idx)
            .and_then(|row| row.values.get(col_idx))
            .cloned()
    }

    pub fn has_columns(&self) -> bool {
        !self.model.read().columns.is_empty()
    }

    /// Column count including the synthetic row-id column; 0 before the
    /// schema is set.
    pub fn column_count(&self) -> usize {
        self.model.read().columns.len()
    }

    pub fn column_name(&self, idx: usize) -> Option<String> {
        self.model.read().columns.get(idx).map(|c| c.name.clone())
    }

    pub fn column_type(&self, idx: usize) -> Option<SqlType> {
        self.model.read().columns.get(idx).map(|c| c.sql_type)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_index.get(name).map(|entry| *entry)
    }

    pub fn columns(&self) -> Vec<ColumnMeta> {
        self.model.read().columns.clone()
    }

    /// Message-style result: exactly one row holding a single VARCHAR
    /// cell (beyond the synthetic index).
    pub fn is_single_varchar_cell(&self) -> bool {
        let model = self.model.read();
        model.rows.len() == 1
            && model.columns.len() == 2
            && model.columns[1].sql_type == SqlType::Varchar
    }

    /// Clear schema and rows. Subsequent reads observe an empty table.
    pub fn close(&self) {
        let mut model = self.model.write();
        model.columns.clear();
        model.rows.clear();
        self.col_index.clear();
    }
}

impl std::fmt::Debug for ResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTable")
            .field("id", &self.id)
            .field("columns", &self.column_count())
            .field("rows", &self.row_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("status", SqlType::Varchar),
            ColumnMeta::new("source", SqlType::Varchar),
            ColumnMeta::new("uptime", SqlType::Integer),
        ]
    }

    #[test]
    fn test_empty_table() {
        let table = ResultTable::new(Uuid::new_v4());
        assert_eq!(table.row_count(), 0);
        assert_eq!(table.column_count(), 0);
        assert!(!table.has_columns());
        assert!(table.get_row(0).is_none());
    }

    #[test]
    fn test_set_columns_prepends_rowid() {
        let table = ResultTable::new(Uuid::new_v4());
        table.set_columns(schema()).unwrap();
        assert_eq!(table.column_count(), 4);
        assert_eq!(table.column_name(0).unwrap(), ROWID_COL_NAME);
        assert_eq!(table.column_type(0).unwrap(), SqlType::RowId);
        assert_eq!(table.column_name(1).unwrap(), "status");
        assert_eq!(table.column_index("uptime"), Some(3));
    }

    #[test]
    fn test_append_before_columns_fails() {
        let table = ResultTable::new(Uuid::new_v4());
        assert!(table.append_row(0, vec![json!("OK")]).is_err());
    }

    #[test]
    fn test_append_and_read() {
        let table = ResultTable::new(Uuid::new_v4());
        table.set_columns(schema()).unwrap();
        table
            .append_row(0, vec![json!("OK"), json!("Entropy generator"), json!(42)])
            .unwrap();
        assert_eq!(table.row_count(), 1);
        let row = table.get_row(0).unwrap();
        assert_eq!(row.seq, 0);
        assert_eq!(row.values[0], json!(0));
        assert_eq!(row.value_at(3), Some(&json!(42)));
        assert_eq!(row.value_at(9), None);
        assert_eq!(table.value_at(0, 1), Some(json!("OK")));
    }

    #[test]
    fn test_arity_mismatch_fails() {
        let table = ResultTable::new(Uuid::new_v4());
        table.set_columns(schema()).unwrap();
        assert!(table.append_row(0, vec![json!("OK")]).is_err());
    }

    #[test]
    fn test_set_columns_again_resets_rows() {
        let table = ResultTable::new(Uuid::new_v4());
        table.set_columns(schema()).unwrap();
        table
            .append_row(0, vec![json!("OK"), json!("x"), json!(1)])
            .unwrap();
        table
            .set_columns(vec![ColumnMeta::new("n", SqlType::BigInt)])
            .unwrap();
        assert_eq!(table.row_count(), 0);
        assert_eq!(table.column_count(), 2);
        assert_eq!(table.column_index("status"), None);
    }

    #[test]
    fn test_close_clears_everything() {
        let table = ResultTable::new(Uuid::new_v4());
        table.set_columns(schema()).unwrap();
        table
            .append_row(0, vec![json!("OK"), json!("x"), json!(1)])
            .unwrap();
        table.close();
        assert_eq!(table.row_count(), 0);
        assert_eq!(table.column_count(), 0);
        assert!(!table.has_columns());
    }

    #[test]
    fn test_single_varchar_cell() {
        let table = ResultTable::new(Uuid::new_v4());
        table
            .set_columns(vec![ColumnMeta::new("message", SqlType::Varchar)])
            .unwrap();
        table.append_row(0, vec![json!("OK")]).unwrap();
        assert!(table.is_single_varchar_cell());
        table.append_row(1, vec![json!("more")]).unwrap();
        assert!(!table.is_single_varchar_cell());
    }

    #[test]
    fn test_concurrent_reads_see_monotonic_counts() {
        let table = Arc::new(ResultTable::new(Uuid::new_v4()));
        table
            .set_columns(vec![ColumnMeta::new("n", SqlType::BigInt)])
            .unwrap();

        let writer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for seq in 0..2000u64 {
                    table.append_row(seq, vec![json!(seq)]).unwrap();
                }
            })
        };
        let reader = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                let mut last = 0;
                while last < 2000 {
                    let count = table.row_count();
                    assert!(count >= last, "row count went backwards");
                    // a row visible in the count is fully readable
                    if count > 0 {
                        let row = table.get_row(count - 1).expect("counted row missing");
                        assert_eq!(row.values.len(), 2);
                    }
                    last = count;
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(table.row_count(), 2000);
    }
}
