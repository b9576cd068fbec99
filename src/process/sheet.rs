// src/process/sheet.rs

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use std::{fs, io::Cursor, path::Path};

/// All rows of the first worksheet, cells as read.
///
/// The format (xls, xlsx, ods) is detected from the content, not the
/// extension. calamine trims leading blank rows and columns off a range;
/// they are put back so row and column indices match the sheet as a user
/// sees it.
pub fn read_first_sheet(path: &Path) -> Result<Vec<Vec<Data>>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .with_context(|| format!("opening spreadsheet {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("{} has no worksheets", path.display()))?
        .with_context(|| format!("reading first worksheet of {}", path.display()))?;

    let (row0, col0) = range.start().unwrap_or((0, 0));
    let mut rows = vec![Vec::new(); row0 as usize];
    rows.extend(range.rows().map(|r| {
        let mut row = vec![Data::Empty; col0 as usize];
        row.extend_from_slice(r);
        row
    }));
    Ok(rows)
}

/// Cell rendered as text, `None` when blank.
///
/// Whole floats lose their fractional part so a region code stored as `35.0`
/// compares equal to the `"35"` sliced from a record.
pub fn cell_text(cell: &Data) -> Option<String> {
    let s = match cell {
        Data::Empty | Data::Error(_) => return None,
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    (!s.is_empty()).then_some(s)
}

/// Cell as an integer; text is parsed, fractional floats and junk give `None`.
pub fn cell_int(cell: &Data) -> Option<i64> {
    match cell {
        Data::Int(i) => Some(*i),
        Data::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        Data::String(s) => parse_int(s),
        _ => None,
    }
}

/// Cell as a float; text is parsed.
pub fn cell_float(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(i) => Some(*i as f64),
        Data::Float(f) => Some(*f),
        Data::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Lenient integer parse: surrounding blanks are ignored and `"2024.0"` is
/// accepted; anything else is `None`.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .map(|f| f as i64)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{write_workbook, Cell};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn leading_blank_rows_and_columns_keep_their_place() {
        let dir = tempdir().unwrap();
        // saved under the legacy extension, as IBGE names its files
        let path = dir.path().join("sheet.xls");
        write_workbook(
            &path,
            &[
                vec![],
                vec![Cell::Blank, Cell::Blank, Cell::Text("Tamanho")],
                vec![Cell::Blank, Cell::Num(4.0), Cell::Num(2.0)],
            ],
        );

        let rows = read_first_sheet(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_empty());
        assert_eq!(cell_text(&rows[1][2]).as_deref(), Some("Tamanho"));
        assert_eq!(cell_int(&rows[2][1]), Some(4));
        assert_eq!(cell_int(&rows[2][2]), Some(2));
        assert_eq!(rows[2][0], Data::Empty);
    }

    #[test]
    fn non_spreadsheet_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.xls");
        std::fs::write(&path, "not a workbook").unwrap();
        assert!(read_first_sheet(&path).is_err());
    }

    #[test]
    fn text_rendering() {
        assert_eq!(cell_text(&Data::Float(35.0)).as_deref(), Some("35"));
        assert_eq!(cell_text(&Data::Float(1.05)).as_deref(), Some("1.05"));
        assert_eq!(cell_text(&Data::String(" UF ".into())).as_deref(), Some("UF"));
        assert_eq!(cell_text(&Data::String("   ".into())), None);
        assert_eq!(cell_text(&Data::Empty), None);
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(cell_int(&Data::Float(2024.0)), Some(2024));
        assert_eq!(cell_int(&Data::Float(2.5)), None);
        assert_eq!(cell_int(&Data::String("03".into())), Some(3));
        assert_eq!(cell_int(&Data::String("abc".into())), None);
        assert_eq!(parse_int(" 2024.0 "), Some(2024));
        assert_eq!(parse_int(""), None);
    }
}
