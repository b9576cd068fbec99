// src/process/table.rs

use anyhow::{Context, Result};
use arrow::array::{Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

/// A table held as ordered record batches sharing one schema.
#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

/// Output of the fixed-width decoder: every column is `Utf8`.
pub type DecodedTable = Table;

/// Decoded table after the deflator join.
pub type MergedTable = Table;

impl Table {
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
        }
    }

    /// Append a batch. Its schema must be the table's.
    pub fn push(&mut self, batch: RecordBatch) {
        debug_assert_eq!(batch.schema(), self.schema);
        self.batches.push(batch);
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.fields().iter().map(|f| f.name().as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.index_of(name).ok()
    }

    /// All batches glued into one.
    pub fn concat(&self) -> Result<RecordBatch> {
        concat_batches(&self.schema, &self.batches).context("concatenating batches")
    }

    /// Text of cell (`row`, `col`) for a `Utf8` column, `None` when null.
    /// Rows are counted across batches.
    pub fn text(&self, mut row: usize, col: usize) -> Option<&str> {
        for b in &self.batches {
            if row < b.num_rows() {
                let arr = b.column(col).as_any().downcast_ref::<StringArray>()?;
                return (!arr.is_null(row)).then(|| arr.value(row));
            }
            row -= b.num_rows();
        }
        None
    }
}
