use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use thiserror::Error;
use tracing::{debug, info};

pub const FALLBACK_SHEETS: [&str; 5] = [
    "Term_Summary",
    "term_summary",
    "02_term_summary",
    "ML_Dataset",
    "ml_dataset",
];

pub const NUMERIC_COLUMNS: [&str; 5] = [
    "term_gpa",
    "term_points",
    "cum_gpa",
    "term_registered_hours",
    "cum_points",
];

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("Worksheet '{requested}' not found. Available sheets: {available:?}")]
    SheetNotFound {
        requested: String,
        available: Vec<String>,
    },
    #[error("failed to open workbook {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("failed to read sheet '{sheet}': {source}")]
    Sheet {
        sheet: String,
        #[source]
        source: calamine::Error,
    },
    #[error("failed to read {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("sheet '{0}' has no header row")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            Cell::Text(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Cell::Empty => None,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{value:.0}")
            }
            Cell::Number(value) => value.to_string(),
            Cell::Text(text) => text.trim().to_string(),
        }
    }

    fn from_text(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Cell::Empty
        } else {
            Cell::Text(raw.to_string())
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Int(value) => Cell::Number(*value as f64),
            Data::Float(value) => Cell::Number(*value),
            Data::Bool(value) => Cell::Number(if *value { 1.0 } else { 0.0 }),
            Data::String(text) | Data::DateTimeIso(text) | Data::DurationIso(text) => {
                Cell::from_text(text)
            }
            Data::DateTime(value) => Cell::Number(value.as_f64()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(|c| c.trim().to_string()).collect();
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Empty);
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Turns text in the given columns into numbers; anything unparseable becomes empty.
    pub fn coerce_numeric(&mut self, names: &[&str]) {
        let indices: Vec<usize> = names.iter().filter_map(|n| self.column_index(n)).collect();
        for row in &mut self.rows {
            for &idx in &indices {
                row[idx] = match row[idx].to_f64() {
                    Some(value) => Cell::Number(value),
                    None => Cell::Empty,
                };
            }
        }
    }
}

/// Picks the sheet to read: exact name, then case-insensitive, then the fallbacks.
pub fn resolve_sheet_name(available: &[String], requested: &str) -> Option<String> {
    if let Some(exact) = available.iter().find(|s| s.as_str() == requested) {
        return Some(exact.clone());
    }

    let find_ci = |wanted: &str| {
        let wanted = wanted.to_lowercase();
        available.iter().find(|s| s.to_lowercase() == wanted).cloned()
    };

    find_ci(requested).or_else(|| FALLBACK_SHEETS.iter().find_map(|cand| find_ci(cand)))
}

pub fn read_table(path: &Path, sheet: &str) -> Result<Table, WorkbookError> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

    let mut table = if is_csv {
        read_csv_table(path)?
    } else {
        read_sheet(path, sheet)?
    };
    table.coerce_numeric(&NUMERIC_COLUMNS);
    info!(
        path = %path.display(),
        rows = table.rows.len(),
        columns = table.columns.len(),
        "loaded term records"
    );
    Ok(table)
}

fn read_sheet(path: &Path, requested: &str) -> Result<Table, WorkbookError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| WorkbookError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let available = workbook.sheet_names();
    let sheet = resolve_sheet_name(&available, requested).ok_or_else(|| {
        WorkbookError::SheetNotFound {
            requested: requested.to_string(),
            available: available.clone(),
        }
    })?;
    if sheet != requested {
        debug!(requested, resolved = %sheet, "using substitute sheet");
    }

    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|source| WorkbookError::Sheet {
            sheet: sheet.clone(),
            source,
        })?;

    let mut rows = range.rows();
    let header = rows.next().ok_or_else(|| WorkbookError::Empty(sheet.clone()))?;
    let columns = header.iter().map(|c| Cell::from(c).to_text()).collect();
    let body = rows
        .map(|row| row.iter().map(Cell::from).collect())
        .collect();

    Ok(Table::new(columns, body))
}

fn read_csv_table(path: &Path) -> Result<Table, WorkbookError> {
    let to_err = |source| WorkbookError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(to_err)?;

    let columns = reader
        .headers()
        .map_err(to_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut body = Vec::new();
    for record in reader.records() {
        let record = record.map_err(to_err)?;
        body.push(record.iter().map(Cell::from_text).collect());
    }

    Ok(Table::new(columns, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_sheet_name_wins() {
        let available = names(&["term_summary", "Term_Summary"]);
        assert_eq!(
            resolve_sheet_name(&available, "Term_Summary").as_deref(),
            Some("Term_Summary")
        );
    }

    #[test]
    fn sheet_lookup_ignores_case() {
        let available = names(&["Students", "TERM_SUMMARY"]);
        assert_eq!(
            resolve_sheet_name(&available, "term_summary").as_deref(),
            Some("TERM_SUMMARY")
        );
    }

    #[test]
    fn falls_back_to_known_sheet_names() {
        let available = names(&["Cover", "02_Term_Summary"]);
        assert_eq!(
            resolve_sheet_name(&available, "Grades").as_deref(),
            Some("02_Term_Summary")
        );
    }

    #[test]
    fn unknown_sheet_resolves_to_nothing() {
        let available = names(&["Cover", "Notes"]);
        assert_eq!(resolve_sheet_name(&available, "Grades"), None);
    }

    fn term_workbook(sheets: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcripts_clean_en.xlsx");
        let mut workbook = rust_xlsxwriter::Workbook::new();
        for name in sheets {
            let sheet = workbook.add_worksheet();
            sheet.set_name(*name).unwrap();
            let header = [" student_id ", "term_key", "term_gpa", "term_points", "is_active"];
            for (col, title) in header.iter().enumerate() {
                sheet.write_string(0, col as u16, *title).unwrap();
            }
            sheet.write_number(1, 0, 10203.0).unwrap();
            sheet.write_string(1, 1, "1447-S").unwrap();
            sheet.write_string(1, 2, "3.4").unwrap();
            sheet.write_number(1, 3, 48.0).unwrap();
            sheet.write_boolean(1, 4, true).unwrap();
        }
        workbook.save(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_xlsx_sheet_ignoring_case() {
        let (_dir, path) = term_workbook(&["Cover", "term_summary"]);
        let table = read_table(&path, "TERM_SUMMARY").unwrap();

        assert_eq!(
            table.columns,
            names(&["student_id", "term_key", "term_gpa", "term_points", "is_active"])
        );
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row[0].to_text(), "10203");
        assert_eq!(row[1], Cell::Text("1447-S".into()));
        assert_eq!(row[2], Cell::Number(3.4));
        assert_eq!(row[3], Cell::Number(48.0));
        assert_eq!(row[4], Cell::Number(1.0));
    }

    #[test]
    fn reads_xlsx_fallback_sheet() {
        let (_dir, path) = term_workbook(&["Cover", "ML_Dataset"]);
        let table = read_table(&path, "Grades").unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][3], Cell::Number(48.0));
    }

    #[test]
    fn missing_xlsx_sheet_lists_available_names() {
        let (_dir, path) = term_workbook(&["Cover", "Notes"]);
        let err = read_table(&path, "Grades").unwrap_err();

        match &err {
            WorkbookError::SheetNotFound {
                requested,
                available,
            } => {
                assert_eq!(requested, "Grades");
                assert_eq!(available, &names(&["Cover", "Notes"]));
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("Cover") && message.contains("Notes"));
    }

    #[test]
    fn spreadsheet_values_convert_to_cells() {
        use calamine::{CellErrorType, ExcelDateTime, ExcelDateTimeType};

        assert_eq!(Cell::from(&Data::Float(10203.0)).to_text(), "10203");
        assert_eq!(Cell::from(&Data::Float(2.75)), Cell::Number(2.75));
        assert_eq!(Cell::from(&Data::Int(7)), Cell::Number(7.0));
        assert_eq!(Cell::from(&Data::Bool(true)), Cell::Number(1.0));
        assert_eq!(Cell::from(&Data::Bool(false)), Cell::Number(0.0));
        assert_eq!(Cell::from(&Data::String("1447-2".into())), Cell::Text("1447-2".into()));
        assert_eq!(Cell::from(&Data::String("   ".into())), Cell::Empty);
        assert_eq!(Cell::from(&Data::Error(CellErrorType::Div0)), Cell::Empty);
        assert_eq!(Cell::from(&Data::Empty), Cell::Empty);

        let serial = ExcelDateTime::new(45000.5, ExcelDateTimeType::DateTime, false);
        assert_eq!(Cell::from(&Data::DateTime(serial)), Cell::Number(45000.5));
    }

    #[test]
    fn coercion_turns_bad_numbers_into_blanks() {
        let mut table = Table::new(
            names(&["student_id", "term_gpa"]),
            vec![
                vec![Cell::Text("1".into()), Cell::Text(" 3.25 ".into())],
                vec![Cell::Text("2".into()), Cell::Text("n/a".into())],
                vec![Cell::Text("3".into())],
            ],
        );
        table.coerce_numeric(&NUMERIC_COLUMNS);
        assert_eq!(table.rows[0][1], Cell::Number(3.25));
        assert_eq!(table.rows[1][1], Cell::Empty);
        assert_eq!(table.rows[2][1], Cell::Empty);
        assert_eq!(table.rows[0][0], Cell::Text("1".into()));
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(Cell::Number(10203.0).to_text(), "10203");
        assert_eq!(Cell::Number(3.5).to_text(), "3.5");
        assert_eq!(Cell::Text(" 0010203 ".into()).to_text(), "0010203");
    }

    #[test]
    fn reads_csv_input_and_strips_bom() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        write!(
            file,
            "\u{feff}student_id, term_key ,term_gpa\n0010203,1447-1,3.1\n0010204,1447-2,abc\n"
        )
        .unwrap();

        let table = read_table(file.path(), "ignored").unwrap();
        assert_eq!(table.columns, names(&["student_id", "term_key", "term_gpa"]));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0].to_text(), "0010203");
        assert_eq!(table.rows[0][2], Cell::Number(3.1));
        assert_eq!(table.rows[1][2], Cell::Empty);
    }
}
