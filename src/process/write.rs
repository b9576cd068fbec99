// src/process/write.rs

use anyhow::{Context, Result};
use arrow::csv::WriterBuilder;
use arrow::record_batch::RecordBatch;
use glob::glob;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

use super::table::Table;
use crate::config::OutputFormat;

/// Raw inputs removed once the output exists.
const TRANSIENT_EXTENSIONS: [&str; 2] = ["txt", "zip"];

fn write_csv(table: &Table, file: File) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .with_header(true)
        .with_delimiter(b';')
        .build(BufWriter::new(file));
    if table.batches().is_empty() {
        // the header is emitted on the first write, even of zero rows
        writer.write(&RecordBatch::new_empty(table.schema().clone()))?;
    }
    for batch in table.batches() {
        writer.write(batch).context("writing CSV batch")?;
    }
    writer.into_inner().flush().context("flushing CSV")?;
    Ok(())
}

fn write_parquet(table: &Table, file: File) -> Result<()> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(true)
        .build();
    let mut writer = ArrowWriter::try_new(file, table.schema().clone(), Some(props))
        .context("creating Arrow writer")?;
    for batch in table.batches() {
        writer.write(batch).context("writing parquet batch")?;
    }
    writer.close().context("closing parquet writer")?;
    Ok(())
}

/// Write `table` to `path`, `;`-delimited with a header row for CSV.
///
/// The file is written next to `path` with a `.tmp` extension and renamed
/// into place, so `path` only ever holds a complete table.
#[instrument(level = "info", skip(table), fields(path = %path.display(), rows = table.num_rows()))]
pub fn write(table: &Table, path: &Path, format: OutputFormat) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;

    let res = match format {
        OutputFormat::Csv => write_csv(table, file),
        OutputFormat::Parquet => write_parquet(table, file),
    };
    if let Err(e) = res {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    info!("output written");
    Ok(())
}

/// Delete the extracted text and downloaded archives in `data_dir`.
///
/// `keep` (the output artifact) is never removed, whatever its extension.
/// Failures to delete single files are logged; the rest still go.
pub fn cleanup(data_dir: &Path, keep: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for ext in TRANSIENT_EXTENSIONS {
        let pattern = format!("{}/*.{}", glob::Pattern::escape(&data_dir.to_string_lossy()), ext);
        for entry in glob(&pattern)? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "unreadable path during cleanup");
                    continue;
                }
            };
            if path == keep || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed");
                    removed.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete"),
            }
        }
    }
    info!(files = removed.len(), dir = %data_dir.display(), "raw files cleaned up");
    Ok(removed)
}
