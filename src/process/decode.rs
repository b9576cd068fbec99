// src/process/decode.rs

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::{
    borrow::Cow,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

use super::layout::LayoutDictionary;
use super::table::DecodedTable;
use crate::config::Strictness;
use crate::error::PnadcError;

/// Bytes as text: UTF-8 when valid, otherwise Latin-1 (one char per byte).
pub fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

/// Cut `line` into consecutive `widths`-character slices, untrimmed.
///
/// A record that ends early gives a short slice for the field it ends in
/// and `None` for every field after it.
pub fn split_record<'a>(line: &'a str, widths: &[usize]) -> Vec<Option<&'a str>> {
    let mut rest = line;
    widths
        .iter()
        .map(|&w| {
            if rest.is_empty() {
                return None;
            }
            let end = rest.char_indices().nth(w).map_or(rest.len(), |(i, _)| i);
            let (field, tail) = rest.split_at(end);
            rest = tail;
            Some(field)
        })
        .collect()
}

/// `Utf8` schema with one nullable column per label.
pub fn text_schema(labels: &[String]) -> SchemaRef {
    let fields: Vec<Field> = labels
        .iter()
        .map(|l| Field::new(l, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Compares every record's length with the layout's.
#[derive(Debug)]
struct LengthCheck {
    expected: usize,
    strict: bool,
    short: u64,
    long: u64,
}

impl LengthCheck {
    /// Strict mode fails on the first record of the wrong length; lenient
    /// mode counts them for [`LengthCheck::report`].
    fn check(&mut self, line: &str, record: u64) -> Result<()> {
        let actual = line.chars().count();
        if actual == self.expected {
            return Ok(());
        }
        if self.strict {
            warn!(record, actual, "record length differs from layout");
            return Err(PnadcError::RecordLength {
                expected: self.expected,
                actual,
            }
            .into());
        }
        if actual < self.expected {
            self.short += 1;
        } else {
            self.long += 1;
        }
        Ok(())
    }

    fn report(&self) {
        if self.short > 0 {
            warn!(
                short = self.short,
                expected = self.expected,
                "records shorter than the layout; missing fields are null"
            );
        }
        if self.long > 0 {
            warn!(
                long = self.long,
                expected = self.expected,
                "records longer than the layout; trailing characters dropped"
            );
        }
    }
}

/// Lazily decodes a fixed-width record stream into batches of at most
/// `batch_rows` rows. Single pass; blank lines are skipped.
pub struct RecordBatches<R> {
    reader: R,
    widths: Vec<usize>,
    schema: SchemaRef,
    batch_rows: usize,
    lengths: LengthCheck,
    buf: Vec<u8>,
    records: u64,
    done: bool,
}

impl<R: BufRead> RecordBatches<R> {
    pub fn new(
        reader: R,
        layout: &LayoutDictionary,
        schema: SchemaRef,
        batch_rows: usize,
        strictness: Strictness,
    ) -> Self {
        Self {
            reader,
            widths: layout.widths().to_vec(),
            schema,
            batch_rows: batch_rows.max(1),
            lengths: LengthCheck {
                expected: layout.record_len(),
                strict: strictness.is_strict(),
                short: 0,
                long: 0,
            },
            buf: Vec::new(),
            records: 0,
            done: false,
        }
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let mut builders: Vec<StringBuilder> =
            self.widths.iter().map(|_| StringBuilder::new()).collect();
        let mut rows = 0;

        while rows < self.batch_rows {
            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .with_context(|| format!("reading record {}", self.records + 1))?;
            if n == 0 {
                self.done = true;
                self.lengths.report();
                break;
            }
            let raw = trim_eol(&self.buf);
            if raw.is_empty() {
                continue;
            }
            let line = decode_line(raw);
            self.lengths.check(&line, self.records + 1)?;

            let fields = split_record(&line, &self.widths);
            for (b, f) in builders.iter_mut().zip(fields) {
                b.append_option(f);
            }
            rows += 1;
            self.records += 1;
        }

        if rows == 0 {
            return Ok(None);
        }
        let columns: Vec<ArrayRef> = builders
            .iter_mut()
            .map(|b| Arc::new(b.finish()) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(self.schema.clone(), columns)
            .context("building decoded RecordBatch")?;
        debug!(rows, total = self.records, "decoded batch");
        Ok(Some(batch))
    }
}

fn trim_eol(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    &buf[..end]
}

impl<R: BufRead> Iterator for RecordBatches<R> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_batch() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode every record of `reader` with `layout`, folding the batches into
/// one table in record order.
pub fn decode<R: BufRead>(
    layout: &LayoutDictionary,
    reader: R,
    batch_rows: usize,
    strictness: Strictness,
) -> Result<DecodedTable> {
    let labels = layout.column_labels(strictness)?;
    let schema = text_schema(&labels);
    RecordBatches::new(reader, layout, schema.clone(), batch_rows, strictness).try_fold(
        DecodedTable::empty(schema),
        |mut table, batch| {
            table.push(batch?);
            Ok(table)
        },
    )
}

/// [`decode`] over the raw microdata file at `path`.
#[instrument(level = "info", skip(layout, strictness), fields(path = %path.display()))]
pub fn decode_file(
    layout: &LayoutDictionary,
    path: &Path,
    batch_rows: usize,
    strictness: Strictness,
) -> Result<DecodedTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let table = decode(layout, BufReader::new(file), batch_rows, strictness)?;
    info!(
        rows = table.num_rows(),
        columns = table.num_columns(),
        batches = table.batches().len(),
        "decoded"
    );
    Ok(table)
}
