// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Domain failures that callers may want to match on.
///
/// Everything else travels as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum PnadcError {
    #[error("invalid run parameters: {0}")]
    InvalidParams(String),

    #[error("layout has {names} field names but the records decode into {columns} columns")]
    SchemaMismatch { columns: usize, names: usize },

    #[error("layout widths sum to {expected} characters but the first record has {actual}")]
    RecordLength { expected: usize, actual: usize },

    #[error("deflator table has {count} duplicate (Ano, Trimestre, UF) keys, first at row {first_row}")]
    DuplicateDeflatorKey { count: usize, first_row: usize },

    #[error("decoded table has no `{0}` column to join on")]
    MissingKeyColumn(String),

    #[error("another run holds the lock at {0}")]
    RunLocked(PathBuf),
}
