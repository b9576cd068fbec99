// src/process/layout.rs

use anyhow::{bail, Context, Result};
use calamine::Data;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, path::Path};
use tracing::{debug, info, instrument, warn};

use super::sheet::{cell_int, cell_text, read_first_sheet};
use crate::config::Strictness;
use crate::error::PnadcError;

/// Header label of the width column in the dictionary spreadsheet.
pub const WIDTH_HEADER: &str = "Tamanho";
/// The variable code sits in the third column.
pub const NAME_COLUMN: usize = 2;
/// The first sheet row is a title; the header is on the second.
const HEADER_ROW: usize = 1;

/// `@0001 Ano $4.` or `@0120 V1028 15.` in an IBGE SAS input script.
static SAS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\s*(\d+)\s+([A-Za-z_][A-Za-z0-9_]*)\s+\$?\s*(\d+)\.").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub width: usize,
}

/// Field widths and names in record order.
///
/// The two lists are read from the same rows but kept apart: a row missing
/// one of them makes the counts differ, which the decoder reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutDictionary {
    widths: Vec<usize>,
    names: Vec<String>,
}

impl LayoutDictionary {
    pub fn new(widths: Vec<usize>, names: Vec<String>) -> Self {
        Self { widths, names }
    }

    pub fn from_fields(fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        let (names, widths) = fields.into_iter().map(|f| (f.name, f.width)).unzip();
        Self { widths, names }
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Characters in one record according to the layout.
    pub fn record_len(&self) -> usize {
        self.widths.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    /// Column labels for the decoded table, one per width.
    ///
    /// When the counts differ: lenient mode warns, drops surplus names and
    /// labels surplus columns `col_<n>` (1-based); strict mode fails.
    pub fn column_labels(&self, strictness: Strictness) -> Result<Vec<String>, PnadcError> {
        let (columns, names) = (self.widths.len(), self.names.len());
        if columns != names {
            if strictness.is_strict() {
                return Err(PnadcError::SchemaMismatch { columns, names });
            }
            warn!(columns, names, "column count differs from field names; labels are positional");
        }
        Ok((0..columns)
            .map(|i| {
                self.names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("col_{}", i + 1))
            })
            .collect())
    }

    /// Build from the rows of the dictionary spreadsheet.
    ///
    /// The header row is the second row. Widths come from the column headed
    /// `Tamanho`, names from the third column. Category rows leave both
    /// blank and are skipped.
    pub fn from_dictionary_rows(rows: &[Vec<Data>]) -> Result<Self> {
        let Some(header) = rows.get(HEADER_ROW) else {
            bail!("dictionary has no header row");
        };
        let Some(width_col) = header
            .iter()
            .position(|c| cell_text(c).as_deref() == Some(WIDTH_HEADER))
        else {
            let seen: Vec<String> = header.iter().filter_map(cell_text).collect();
            bail!("no `{}` column in dictionary header {:?}", WIDTH_HEADER, seen);
        };

        let mut layout = Self::default();
        for (i, row) in rows.iter().enumerate().skip(HEADER_ROW + 1) {
            let width = row.get(width_col).and_then(|c| match cell_int(c) {
                Some(w) if w > 0 => Some(w as usize),
                Some(_) => None,
                None => {
                    if cell_text(c).is_some() {
                        debug!(row = i, cell = %c, "ignoring non-numeric width");
                    }
                    None
                }
            });
            let name = row.get(NAME_COLUMN).and_then(cell_text);

            match (width, name) {
                (Some(w), Some(n)) => {
                    layout.widths.push(w);
                    layout.names.push(n);
                }
                (Some(w), None) => {
                    debug!(row = i, width = w, "width without a name");
                    layout.widths.push(w);
                }
                (None, Some(n)) => {
                    debug!(row = i, name = %n, "name without a width");
                    layout.names.push(n);
                }
                (None, None) => {}
            }
        }
        Ok(layout)
    }

    /// Build from an IBGE SAS `input` script, one `@pos name [$]width.`
    /// statement per field.
    pub fn from_sas_input(text: &str) -> Result<Self> {
        let mut fields = Vec::new();
        let mut expected_pos = 1usize;
        for caps in SAS_FIELD.captures_iter(text) {
            let pos: usize = caps[1].parse()?;
            let width: usize = caps[3].parse()?;
            if width == 0 {
                bail!("field {} has zero width", &caps[2]);
            }
            if pos != expected_pos {
                warn!(
                    field = &caps[2],
                    pos,
                    expected = expected_pos,
                    "input script positions are not contiguous"
                );
            }
            expected_pos = pos + width;
            fields.push(FieldSpec {
                name: caps[2].to_string(),
                width,
            });
        }
        if fields.is_empty() {
            bail!("no `@pos name width.` statements found");
        }
        Ok(Self::from_fields(fields))
    }
}

/// Read the dictionary spreadsheet at `path`.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_dictionary(path: &Path) -> Result<LayoutDictionary> {
    let rows = read_first_sheet(path)?;
    let layout = LayoutDictionary::from_dictionary_rows(&rows)
        .with_context(|| format!("parsing dictionary {}", path.display()))?;
    info!(
        fields = layout.widths().len(),
        names = layout.names().len(),
        record_len = layout.record_len(),
        "dictionary loaded"
    );
    Ok(layout)
}

/// Read the SAS input script at `path`. IBGE ships it in Latin-1.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_sas_input(path: &Path) -> Result<LayoutDictionary> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = super::decode::decode_line(&bytes);
    let layout = LayoutDictionary::from_sas_input(&text)
        .with_context(|| format!("parsing input script {}", path.display()))?;
    info!(
        fields = layout.widths().len(),
        record_len = layout.record_len(),
        "input script loaded"
    );
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Data {
        Data::String(v.to_string())
    }

    fn dictionary_rows() -> Vec<Vec<Data>> {
        vec![
            vec![s("Dicionário das variáveis da PNAD Contínua")],
            vec![s("Posição Inicial"), s("Tamanho"), s("Código da variável"), s("Quesito")],
            vec![Data::Float(1.0), Data::Float(4.0), s("Ano"), s("Ano de referência")],
            vec![Data::Float(5.0), Data::Float(1.0), s("Trimestre"), s("Trimestre")],
            vec![Data::Float(6.0), Data::Float(2.0), s("UF"), s("Unidade da Federação")],
            vec![Data::Empty, Data::Empty, Data::Empty, Data::Empty, s("11"), s("Rondônia")],
            vec![Data::Float(8.0), s("3"), s("V2009"), s("Idade")],
        ]
    }

    #[test]
    fn dictionary_rows_align_by_position() {
        let layout = LayoutDictionary::from_dictionary_rows(&dictionary_rows()).unwrap();
        assert_eq!(layout.widths(), &[4, 1, 2, 3]);
        assert_eq!(layout.names(), &["Ano", "Trimestre", "UF", "V2009"]);
        assert_eq!(layout.record_len(), 10);
    }

    #[test]
    fn missing_width_header_is_an_error() {
        let mut rows = dictionary_rows();
        rows[1][1] = s("Largura");
        let err = LayoutDictionary::from_dictionary_rows(&rows).unwrap_err();
        assert!(err.to_string().contains("Tamanho"));
    }

    #[test]
    fn lopsided_rows_surface_as_count_mismatch() {
        let mut rows = dictionary_rows();
        rows.push(vec![Data::Float(11.0), Data::Float(2.0), Data::Empty]);
        let layout = LayoutDictionary::from_dictionary_rows(&rows).unwrap();
        assert_eq!(layout.widths().len(), 5);
        assert_eq!(layout.names().len(), 4);

        let labels = layout.column_labels(Strictness::Lenient).unwrap();
        assert_eq!(labels.last().map(String::as_str), Some("col_5"));
        assert!(matches!(
            layout.column_labels(Strictness::Strict),
            Err(PnadcError::SchemaMismatch { columns: 5, names: 4 })
        ));
    }

    #[test]
    fn surplus_names_are_dropped_when_lenient() {
        let layout = LayoutDictionary::new(vec![2, 1], vec!["UF".into(), "V".into(), "X".into()]);
        assert_eq!(layout.column_labels(Strictness::Lenient).unwrap(), vec!["UF", "V"]);
    }

    #[test]
    fn dictionary_workbook_from_disk() {
        use crate::process::sheet::fixtures::{write_workbook, Cell};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dicionario_PNADC_microdados_2024_visita1.xls");
        let field = |pos: f64, width: f64, name: &'static str| {
            vec![Cell::Num(pos), Cell::Num(width), Cell::Text(name), Cell::Text("quesito")]
        };
        write_workbook(
            &path,
            &[
                vec![Cell::Text("Dicionário das variáveis da PNAD Contínua")],
                vec![
                    Cell::Text("Posição Inicial"),
                    Cell::Text("Tamanho"),
                    Cell::Text("Código da variável"),
                    Cell::Text("Quesito"),
                ],
                field(1.0, 4.0, "Ano"),
                field(5.0, 1.0, "Trimestre"),
                vec![Cell::Blank, Cell::Blank, Cell::Blank, Cell::Blank, Cell::Text("1"), Cell::Text("Janeiro")],
                field(6.0, 2.0, "UF"),
            ],
        );

        let layout = load_dictionary(&path).unwrap();
        assert_eq!(layout.names(), &["Ano", "Trimestre", "UF"]);
        assert_eq!(layout.widths(), &[4, 1, 2]);
    }

    #[test]
    fn sas_input_script() {
        let script = r#"
/* PNAD Contínua - visita 1 */
data pnadc;
infile "PNADC_2024_visita1.txt" lrecl = 200;
input
@0001 Ano $4. /* Ano de referência */
@0005 Trimestre $1.
@0006 UF $2.
@0008 V1028 15. /* Peso */
;
run;
"#;
        let layout = LayoutDictionary::from_sas_input(script).unwrap();
        assert_eq!(layout.names(), &["Ano", "Trimestre", "UF", "V1028"]);
        assert_eq!(layout.widths(), &[4, 1, 2, 15]);
        assert!(LayoutDictionary::from_sas_input("run;").is_err());
    }
}
