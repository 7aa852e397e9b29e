use std::io;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::StudentPrediction;

pub const ID_COLUMN: &str = "student_id";

// Accepted source columns per output field, first non-empty one wins.
pub const NAME_COLUMNS: &[&str] = &["student_name_en", "student_label", "student_name"];
pub const CURRENT_GPA_COLUMNS: &[&str] = &["cum_gpa", "current_gpa", "gpa"];
pub const PREDICTED_GPA_COLUMNS: &[&str] = &["predicted_next_term_gpa", "predicted_gpa", "pred"];
pub const RISK_LEVEL_COLUMNS: &[&str] = &["predicted_risk_level", "risk_level", "risk"];
pub const PROB_HIGH_COLUMNS: &[&str] = &["risk_probability_high", "prob_high", "risk_prob"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{file} not found at {path}")]
    NotFound { file: String, path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed predictions CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV missing column: {0}")]
    MissingColumn(&'static str),
}

impl StoreError {
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound {
                file: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                path: path.to_path_buf(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionTable {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    id_idx: usize,
}

impl PredictionTable {
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let id_idx = headers
            .iter()
            .position(|h| h == ID_COLUMN)
            .ok_or(StoreError::MissingColumn(ID_COLUMN))?;
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            headers,
            rows,
            id_idx,
        })
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::from_io(path, e))?;
        let table = Self::parse(&text)?;
        debug!(path = %path.display(), rows = table.len(), "loaded predictions");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn first_present<'a>(&self, record: &'a StringRecord, names: &[&str]) -> Option<&'a str> {
        names.iter().find_map(|name| {
            let idx = self.headers.iter().position(|h| h == *name)?;
            let value = record.get(idx)?.trim();
            (!value.is_empty()).then_some(value)
        })
    }

    fn resolve(&self, student_id: &str, record: &StringRecord) -> StudentPrediction {
        let field = |names: &[&str]| self.first_present(record, names).map(str::to_string);
        StudentPrediction {
            student_id: student_id.to_string(),
            student_name: field(NAME_COLUMNS).unwrap_or_default(),
            current_gpa: field(CURRENT_GPA_COLUMNS),
            predicted_next_term_gpa: field(PREDICTED_GPA_COLUMNS),
            risk_level: field(RISK_LEVEL_COLUMNS),
            risk_probability_high: field(PROB_HIGH_COLUMNS),
        }
    }

    fn id_of<'a>(&self, record: &'a StringRecord) -> &'a str {
        record.get(self.id_idx).map(str::trim).unwrap_or_default()
    }

    /// The row for `student_id`, compared as text. With duplicate rows the
    /// last one in file order is returned.
    pub fn latest_for(&self, student_id: &str) -> Option<StudentPrediction> {
        let matches: Vec<&StringRecord> = self
            .rows
            .iter()
            .filter(|record| self.id_of(record) == student_id)
            .collect();

        if matches.len() > 1 {
            warn!(
                student_id,
                rows = matches.len(),
                "duplicate prediction rows for student, using the last one"
            );
        }
        matches
            .last()
            .map(|record| self.resolve(student_id, record))
    }

    pub fn students(&self) -> Vec<StudentPrediction> {
        self.rows
            .iter()
            .filter(|record| !self.id_of(record).is_empty())
            .map(|record| self.resolve(self.id_of(record), record))
            .collect()
    }
}
