// src/process/merge.rs

use anyhow::{bail, Result};
use arrow::array::{Array, ArrayRef, Float64Builder, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use calamine::Data;
use std::{collections::HashMap, path::Path, sync::Arc};
use tracing::{info, instrument, warn};

use super::sheet::{cell_float, cell_int, cell_text, parse_int, read_first_sheet};
use super::table::{DecodedTable, MergedTable, Table};
use crate::config::Strictness;
use crate::error::PnadcError;

pub const YEAR: &str = "Ano";
pub const QUARTER: &str = "Trimestre";
pub const REGION: &str = "UF";

/// Correction factors carried over from the deflator table.
pub const FACTORS: [&str; 5] = ["CO1", "CO1e", "CO2", "CO2e", "CO3"];

/// Deflator header names and the decoded-table names they map to.
const KEY_RENAMES: [(&str, &str); 3] = [("ano", YEAR), ("trim", QUARTER), ("uf", REGION)];

/// (year, quarter, region code). Rows with a null component never match.
pub type DeflatorKey = (i64, i64, String);

/// Deflator rows by composite key.
#[derive(Debug, Default, Clone)]
pub struct DeflatorTable {
    rows: HashMap<DeflatorKey, [Option<f64>; 5]>,
}

impl DeflatorTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &DeflatorKey) -> Option<&[Option<f64>; 5]> {
        self.rows.get(key)
    }

    /// Build from spreadsheet rows; the first row is the header.
    ///
    /// Keys must be unique. Duplicates fail in strict mode; otherwise the
    /// first occurrence is kept and the count is logged.
    pub fn from_rows(rows: &[Vec<Data>], strictness: Strictness) -> Result<Self> {
        let Some(header) = rows.first() else {
            bail!("deflator sheet is empty");
        };
        let names: Vec<Option<String>> = header.iter().map(cell_text).collect();
        let find = |wanted: &str| {
            let renamed = KEY_RENAMES
                .iter()
                .find(|(_, to)| *to == wanted)
                .map(|(from, _)| *from);
            names.iter().position(|n| {
                n.as_deref()
                    .map_or(false, |n| n == wanted || Some(n) == renamed)
            })
        };

        let mut key_cols = [0usize; 3];
        for (slot, key) in key_cols.iter_mut().zip([YEAR, QUARTER, REGION]) {
            *slot = match find(key) {
                Some(i) => i,
                None => bail!("deflator has no `{}` column (header {:?})", key, names),
            };
        }
        let mut factor_cols = [0usize; 5];
        for (slot, f) in factor_cols.iter_mut().zip(FACTORS) {
            *slot = match find(f) {
                Some(i) => i,
                None => bail!("deflator has no `{}` column (header {:?})", f, names),
            };
        }

        let cell = |row: &[Data], i: usize| row.get(i).cloned().unwrap_or(Data::Empty);
        let mut table = DeflatorTable::default();
        let mut duplicates = 0usize;
        let mut first_dup = None;
        let mut null_keys = 0usize;

        for (i, row) in rows.iter().enumerate().skip(1) {
            let row = row.as_slice();
            if row.iter().all(|c| matches!(c, Data::Empty)) {
                continue;
            }
            let year = cell_int(&cell(row, key_cols[0]));
            let quarter = cell_int(&cell(row, key_cols[1]));
            let region = cell_text(&cell(row, key_cols[2]));
            let (Some(y), Some(q), Some(r)) = (year, quarter, region) else {
                null_keys += 1;
                continue;
            };

            let mut factors = [None; 5];
            for (slot, &col) in factors.iter_mut().zip(&factor_cols) {
                *slot = cell_float(&cell(row, col));
            }

            let key = (y, q, r);
            if table.rows.contains_key(&key) {
                duplicates += 1;
                first_dup.get_or_insert(i);
                continue;
            }
            table.rows.insert(key, factors);
        }

        if null_keys > 0 {
            warn!(rows = null_keys, "deflator rows with unusable keys dropped");
        }
        if let Some(first_row) = first_dup {
            if strictness.is_strict() {
                return Err(PnadcError::DuplicateDeflatorKey {
                    count: duplicates,
                    first_row,
                }
                .into());
            }
            warn!(duplicates, first_row, "duplicate deflator keys; keeping first occurrence");
        }
        Ok(table)
    }
}

/// Read the deflator spreadsheet at `path`.
#[instrument(level = "info", skip(strictness), fields(path = %path.display()))]
pub fn load_deflator(path: &Path, strictness: Strictness) -> Result<DeflatorTable> {
    let rows = read_first_sheet(path)?;
    let table = DeflatorTable::from_rows(&rows, strictness)?;
    info!(keys = table.len(), "deflator loaded");
    Ok(table)
}

fn merged_schema(base: &Schema, year: usize, quarter: usize) -> SchemaRef {
    let mut fields: Vec<Field> = base
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            if i == year || i == quarter {
                Field::new(f.name(), DataType::Int64, true)
            } else {
                f.as_ref().clone()
            }
        })
        .collect();
    fields.extend(FACTORS.iter().map(|n| Field::new(*n, DataType::Float64, true)));
    Arc::new(Schema::new(fields))
}

fn text_column<'a>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a StringArray> {
    match batch.column(idx).as_any().downcast_ref::<StringArray>() {
        Some(a) => Ok(a),
        None => bail!("key column `{}` is not text", name),
    }
}

fn to_int64(arr: &StringArray) -> Int64Array {
    arr.iter().map(|v| v.and_then(parse_int)).collect()
}

fn merge_batch(
    batch: &RecordBatch,
    schema: &SchemaRef,
    cols: [usize; 3],
    deflator: &DeflatorTable,
) -> Result<(RecordBatch, usize)> {
    let years = to_int64(text_column(batch, cols[0], YEAR)?);
    let quarters = to_int64(text_column(batch, cols[1], QUARTER)?);
    let regions = text_column(batch, cols[2], REGION)?;

    let mut builders: Vec<Float64Builder> = FACTORS
        .iter()
        .map(|_| Float64Builder::with_capacity(batch.num_rows()))
        .collect();
    let mut matched = 0;

    for row in 0..batch.num_rows() {
        let hit = if years.is_null(row) || quarters.is_null(row) || regions.is_null(row) {
            None
        } else {
            let key = (
                years.value(row),
                quarters.value(row),
                regions.value(row).trim().to_string(),
            );
            deflator.get(&key)
        };
        match hit {
            Some(factors) => {
                matched += 1;
                for (b, f) in builders.iter_mut().zip(factors) {
                    b.append_option(*f);
                }
            }
            None => builders.iter_mut().for_each(|b| b.append_null()),
        }
    }

    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    columns[cols[0]] = Arc::new(years) as ArrayRef;
    columns[cols[1]] = Arc::new(quarters) as ArrayRef;
    columns.extend(builders.iter_mut().map(|b| Arc::new(b.finish()) as ArrayRef));

    Ok((RecordBatch::try_new(schema.clone(), columns)?, matched))
}

/// Left join `decoded` with `deflator` on (Ano, Trimestre, UF).
///
/// Row count and order are unchanged. Year and quarter become nullable
/// `Int64` (unparseable text is null); the region code is compared as text
/// with blanks trimmed. Unmatched rows get null factors.
pub fn left_join(decoded: &DecodedTable, deflator: &DeflatorTable) -> Result<MergedTable> {
    let mut cols = [0usize; 3];
    for (slot, key) in cols.iter_mut().zip([YEAR, QUARTER, REGION]) {
        *slot = decoded
            .column_index(key)
            .ok_or_else(|| PnadcError::MissingKeyColumn(key.to_string()))?;
    }

    let schema = merged_schema(decoded.schema(), cols[0], cols[1]);
    let mut merged = Table::empty(schema.clone());
    let mut matched = 0;
    for batch in decoded.batches() {
        let (b, m) = merge_batch(batch, &schema, cols, deflator)?;
        matched += m;
        merged.push(b);
    }
    info!(
        rows = merged.num_rows(),
        matched,
        unmatched = merged.num_rows() - matched,
        "deflator merged"
    );
    Ok(merged)
}

/// Attach correction factors when a deflator file is available.
///
/// No file, or a file that cannot be read, leaves the table as decoded. A
/// decoded table without the key columns is passed through in lenient mode
/// and fails in strict mode, as do duplicate deflator keys.
pub fn merge(
    decoded: DecodedTable,
    deflator_path: Option<&Path>,
    strictness: Strictness,
) -> Result<MergedTable> {
    let Some(path) = deflator_path else {
        info!("no deflator; output is the decoded table");
        return Ok(decoded);
    };

    let deflator = match load_deflator(path, strictness) {
        Ok(d) => d,
        Err(e) if e.downcast_ref::<PnadcError>().is_some() => return Err(e),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "deflator unreadable; skipping merge");
            return Ok(decoded);
        }
    };

    match left_join(&decoded, &deflator) {
        Ok(m) => Ok(m),
        Err(e) if !strictness.is_strict() && e.downcast_ref::<PnadcError>().is_some() => {
            warn!(error = %e, "skipping merge");
            Ok(decoded)
        }
        Err(e) => Err(e),
    }
}
