use std::cmp::Ordering;

use thiserror::Error;
use tracing::debug;

use crate::workbook::{Cell, Table};

#[derive(Debug, Error, PartialEq)]
pub enum TermError {
    #[error("Term_Summary must contain 'term_gpa' and 'term_points' columns.")]
    MissingGradeColumns,
    #[error("Term_Summary must contain 'student_id' and 'term_key' columns.")]
    MissingKeyColumns,
    #[error("No completed terms found (term_gpa>0 and term_points>0).")]
    NoCompletedTerms,
}

/// Sortable form of a term key such as `1447-2` or `1447-S`.
///
/// Summer terms sort after the second regular term of the same year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TermKey {
    pub year: i64,
    pub ordinal: i64,
}

impl TermKey {
    pub const SUMMER_ORDINAL: i64 = 3;

    pub fn parse(raw: &str) -> Self {
        let Some((year, term)) = raw.split_once('-') else {
            return Self { year: 0, ordinal: 0 };
        };
        let year = year.trim().parse().unwrap_or(0);
        let term = term.trim();
        let ordinal = if term.eq_ignore_ascii_case("s") {
            Self::SUMMER_ORDINAL
        } else {
            term.parse().unwrap_or(0)
        };
        Self { year, ordinal }
    }
}

pub fn is_completed(term_gpa: &Cell, term_points: &Cell) -> bool {
    matches!(
        (term_gpa.as_f64(), term_points.as_f64()),
        (Some(gpa), Some(points)) if gpa > 0.0 && points > 0.0
    )
}

/// Orders student ids numerically when both are plain digits, as text otherwise.
pub fn compare_student_ids(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let (ta, tb) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
        ta.len()
            .cmp(&tb.len())
            .then_with(|| ta.cmp(tb))
            .then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

/// The most recent completed term of one student.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestTerm {
    pub student_id: String,
    pub term_key: String,
    /// Index of the source row in the table.
    pub row: usize,
}

/// Keeps, for each student, the completed term with the greatest term key.
///
/// Results are ordered by student id. When two rows share the greatest key the
/// later one in the sheet is kept.
pub fn select_latest_terms(table: &Table) -> Result<Vec<LatestTerm>, TermError> {
    let (Some(gpa_idx), Some(points_idx)) =
        (table.column_index("term_gpa"), table.column_index("term_points"))
    else {
        return Err(TermError::MissingGradeColumns);
    };

    let completed: Vec<usize> = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| is_completed(&row[gpa_idx], &row[points_idx]))
        .map(|(idx, _)| idx)
        .collect();

    if completed.is_empty() {
        return Err(TermError::NoCompletedTerms);
    }

    let (Some(id_idx), Some(key_idx)) =
        (table.column_index("student_id"), table.column_index("term_key"))
    else {
        return Err(TermError::MissingKeyColumns);
    };

    let mut candidates: Vec<(String, TermKey, LatestTerm)> = completed
        .into_iter()
        .filter_map(|row| {
            let cells = &table.rows[row];
            let student_id = cells[id_idx].to_text();
            if student_id.is_empty() {
                return None;
            }
            // numeric keys such as 14471 have no '-' and sort as (0, 0)
            let term_key = cells[key_idx].to_text();
            Some((
                student_id.clone(),
                TermKey::parse(&term_key),
                LatestTerm {
                    student_id,
                    term_key,
                    row,
                },
            ))
        })
        .collect();

    candidates.sort_by(|a, b| compare_student_ids(&a.0, &b.0).then(a.1.cmp(&b.1)));

    let mut latest: Vec<LatestTerm> = Vec::new();
    for (student_id, _, term) in candidates {
        match latest.last_mut() {
            Some(last) if last.student_id == student_id => *last = term,
            _ => latest.push(term),
        }
    }

    debug!(students = latest.len(), "selected latest completed terms");
    Ok(latest)
}
