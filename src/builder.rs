use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::estimator::{ModelBundle, ModelError};
use crate::models::PredictionRecord;
use crate::terms::{select_latest_terms, TermError};
use crate::workbook::{self, Table, WorkbookError};

/// Display label columns in order of preference; the student id is the last resort.
pub const LABEL_COLUMNS: [&str; 3] = ["student_label", "student_name_en", "student_name"];

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Workbook(#[from] WorkbookError),
    #[error(transparent)]
    Terms(#[from] TermError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Missing required feature columns in Term_Summary: {0:?}")]
    MissingFeatures(Vec<String>),
    #[error("Term_Summary must contain '{0}' column.")]
    MissingColumn(&'static str),
    #[error("student {student_id}: feature '{column}' is blank or not numeric")]
    FeatureValue { student_id: String, column: String },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub input: PathBuf,
    pub sheet: String,
    pub models_dir: PathBuf,
    pub out: PathBuf,
}

/// Loads models and term records, predicts, and writes the results CSV.
/// Returns the number of students written.
pub fn run(options: &PredictOptions) -> Result<usize, BuildError> {
    let bundle = ModelBundle::load(&options.models_dir)?;
    let table = workbook::read_table(&options.input, &options.sheet)?;
    let records = build_predictions(&table, &bundle)?;
    write_predictions(&options.out, &records)?;
    info!(students = records.len(), out = %options.out.display(), "predictions written");
    Ok(records.len())
}

/// Column names from `wanted` that the table lacks, in `wanted` order.
pub fn missing_columns(table: &Table, wanted: &[String]) -> Vec<String> {
    wanted
        .iter()
        .filter(|c| !table.has_column(c))
        .cloned()
        .collect()
}

pub fn label_column(table: &Table) -> Option<usize> {
    LABEL_COLUMNS.iter().find_map(|c| table.column_index(c))
}

pub fn build_predictions(
    table: &Table,
    bundle: &ModelBundle,
) -> Result<Vec<PredictionRecord>, BuildError> {
    let latest = select_latest_terms(table)?;

    let missing = missing_columns(table, &bundle.feature_cols);
    if !missing.is_empty() {
        return Err(BuildError::MissingFeatures(missing));
    }
    let cum_gpa_idx = table
        .column_index("cum_gpa")
        .ok_or(BuildError::MissingColumn("cum_gpa"))?;
    let term_gpa_idx = table
        .column_index("term_gpa")
        .ok_or(BuildError::MissingColumn("term_gpa"))?;
    let feature_idx: Vec<usize> = bundle
        .feature_cols
        .iter()
        .filter_map(|c| table.column_index(c))
        .collect();

    let mut matrix = Vec::with_capacity(latest.len());
    for term in &latest {
        let row = &table.rows[term.row];
        let values = feature_idx
            .iter()
            .zip(&bundle.feature_cols)
            .map(|(&idx, column)| {
                row[idx].to_f64().ok_or_else(|| BuildError::FeatureValue {
                    student_id: term.student_id.clone(),
                    column: column.clone(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        matrix.push(values);
    }

    let predicted_gpa = bundle.regressor.predict(&matrix);
    let predicted_risk = bundle.classifier.predict(&matrix);
    let prob_high = bundle
        .classifier
        .predict_proba(&matrix)
        .map(|probs| probs.high_risk());
    if prob_high.is_none() {
        warn!("classifier has no class probabilities; risk_probability_high omitted");
    }

    let label_idx = label_column(table);

    let records = latest
        .into_iter()
        .enumerate()
        .map(|(i, term)| {
            let row = &table.rows[term.row];
            let student_label = match label_idx {
                Some(idx) => row[idx].to_text(),
                None => term.student_id.clone(),
            };
            PredictionRecord {
                student_label,
                term_key: term.term_key,
                term_gpa: row[term_gpa_idx].as_f64(),
                cum_gpa: row[cum_gpa_idx].as_f64(),
                predicted_next_term_gpa: predicted_gpa[i],
                predicted_risk_level: predicted_risk[i].clone(),
                risk_probability_high: prob_high.as_ref().map(|p| p[i]),
                student_id: term.student_id,
            }
        })
        .collect();

    Ok(records)
}

fn number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes records as a BOM-prefixed UTF-8 CSV. The probability column is only
/// present when the classifier produced probabilities.
pub fn write_predictions(path: &Path, records: &[PredictionRecord]) -> Result<(), BuildError> {
    let to_err = |source: csv::Error| BuildError::Write {
        path: path.to_path_buf(),
        source,
    };
    let with_probability = records.iter().any(|r| r.risk_probability_high.is_some());

    let mut file = File::create(path).map_err(|e| to_err(e.into()))?;
    file.write_all(BOM).map_err(|e| to_err(e.into()))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = vec![
        "student_id",
        "student_label",
        "term_key",
        "term_gpa",
        "cum_gpa",
        "predicted_next_term_gpa",
        "predicted_risk_level",
    ];
    if with_probability {
        header.push("risk_probability_high");
    }
    writer.write_record(&header).map_err(to_err)?;

    for record in records {
        let mut fields = vec![
            record.student_id.clone(),
            record.student_label.clone(),
            record.term_key.clone(),
            number(record.term_gpa),
            number(record.cum_gpa),
            record.predicted_next_term_gpa.to_string(),
            record.predicted_risk_level.clone(),
        ];
        if with_probability {
            fields.push(number(record.risk_probability_high));
        }
        writer.write_record(&fields).map_err(to_err)?;
    }

    writer.flush().map_err(|e| to_err(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{Classifier, ModelConfig, Regressor};
    use crate::store::PredictionTable;
    use crate::workbook::Cell;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn sample_table(with_name: bool) -> Table {
        let mut columns = vec!["student_id", "term_key", "term_gpa", "term_points", "cum_gpa"];
        if with_name {
            columns.push("student_name_en");
        }
        let row = |id: &str, key: &str, gpa: f64, points: f64, cum: f64, name: &str| {
            let mut cells = vec![
                text(id),
                text(key),
                Cell::Number(gpa),
                Cell::Number(points),
                Cell::Number(cum),
            ];
            if with_name {
                cells.push(text(name));
            }
            cells
        };
        Table::new(
            columns.into_iter().map(String::from).collect(),
            vec![
                row("0010203", "1447-1", 3.0, 45.0, 3.0, "Sara"),
                row("0010203", "1447-2", 1.5, 20.0, 2.25, "Sara"),
                row("0000042", "1447-S", 3.8, 30.0, 3.7, "Omar"),
                row("0000042", "1448-1", 0.0, 0.0, 3.7, "Omar"),
            ],
        )
    }

    fn bundle(features: &[&str], classifier: Classifier) -> ModelBundle {
        let width = features.len();
        ModelBundle::new(
            ModelConfig {
                feature_cols: features.iter().map(|s| s.to_string()).collect(),
            },
            Regressor::Linear {
                coefficients: vec![1.0 / width as f64; width],
                intercept: 0.0,
                scaler: None,
                clip: None,
            },
            classifier,
        )
        .unwrap()
    }

    fn logistic() -> Classifier {
        Classifier::Logistic {
            classes: vec!["HIGH".into(), "LOW".into()],
            coefficients: vec![vec![2.0, 0.0]],
            intercepts: vec![-5.0],
            scaler: None,
        }
    }

    #[test]
    fn predicts_from_latest_completed_term() {
        let table = sample_table(true);
        let records = build_predictions(&table, &bundle(&["term_gpa", "cum_gpa"], logistic())).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].student_id, "0000042");
        assert_eq!(records[0].term_key, "1447-S");
        assert_eq!(records[0].student_label, "Omar");
        assert!((records[0].predicted_next_term_gpa - 3.75).abs() < 1e-9);
        // binary classifier: column 1 (LOW) is the modelled class
        assert_eq!(records[0].predicted_risk_level, "LOW");

        assert_eq!(records[1].student_id, "0010203");
        assert_eq!(records[1].term_key, "1447-2");
        assert_eq!(records[1].cum_gpa, Some(2.25));
        assert_eq!(records[1].predicted_risk_level, "HIGH");
        let prob = records[1].risk_probability_high.unwrap();
        assert!(prob > 0.5 && prob < 1.0);
    }

    #[test]
    fn reports_every_missing_feature_column() {
        let table = sample_table(true);
        let err = build_predictions(
            &table,
            &bundle(
                &["term_gpa", "attendance_rate", "cum_gpa", "credit_load"],
                Classifier::Logistic {
                    classes: vec!["HIGH".into(), "LOW".into()],
                    coefficients: vec![vec![0.0; 4]],
                    intercepts: vec![0.0],
                    scaler: None,
                },
            ),
        )
        .unwrap_err();

        match err {
            BuildError::MissingFeatures(missing) => {
                assert_eq!(missing, vec!["attendance_rate", "credit_load"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blank_feature_value_aborts_the_run() {
        let mut table = sample_table(false);
        let cum = table.column_index("cum_gpa").unwrap();
        table.rows[1][cum] = Cell::Empty;
        let err = build_predictions(&table, &bundle(&["cum_gpa"], logistic_one())).unwrap_err();
        assert!(err.to_string().contains("0010203"));
        assert!(err.to_string().contains("cum_gpa"));
    }

    fn logistic_one() -> Classifier {
        Classifier::Logistic {
            classes: vec!["HIGH".into(), "LOW".into()],
            coefficients: vec![vec![1.0]],
            intercepts: vec![0.0],
            scaler: None,
        }
    }

    #[test]
    fn label_falls_back_to_student_id() {
        let table = sample_table(false);
        assert_eq!(label_column(&table), None);
        let records = build_predictions(&table, &bundle(&["cum_gpa"], logistic_one())).unwrap();
        assert_eq!(records[0].student_label, records[0].student_id);
    }

    #[test]
    fn label_prefers_explicit_label_column() {
        let table = Table::new(
            vec!["student_name".into(), "student_label".into(), "student_name_en".into()],
            vec![],
        );
        assert_eq!(label_column(&table), Some(1));
    }

    #[test]
    fn writes_bom_and_omits_probability_without_proba() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        let classifier = Classifier::Thresholds {
            feature: "cum_gpa".into(),
            bands: vec![],
            otherwise: "LOW".into(),
            feature_index: 0,
        };
        let records = build_predictions(&sample_table(true), &bundle(&["cum_gpa"], classifier)).unwrap();
        write_predictions(&out, &records).unwrap();

        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(BOM));
        let text = String::from_utf8(bytes[BOM.len()..].to_vec()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "student_id,student_label,term_key,term_gpa,cum_gpa,predicted_next_term_gpa,predicted_risk_level"
        );
    }

    #[test]
    fn written_csv_reads_back_with_identical_ids() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("predictions_next_term.csv");
        let records =
            build_predictions(&sample_table(true), &bundle(&["term_gpa", "cum_gpa"], logistic())).unwrap();
        write_predictions(&out, &records).unwrap();

        let table = PredictionTable::load(&out).unwrap();
        for record in &records {
            let row = table.latest_for(&record.student_id).unwrap();
            assert_eq!(row.student_id, record.student_id);
            assert_eq!(row.student_name, record.student_label);
            assert_eq!(row.risk_level.as_deref(), Some(record.predicted_risk_level.as_str()));
        }
        assert!(table.latest_for("10203").is_none());
    }

    #[test]
    fn run_reads_csv_input_and_models_dir() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir(&models).unwrap();
        std::fs::write(
            models.join("gpa_regressor.json"),
            r#"{"type":"linear","coefficients":[1.0],"intercept":0.0}"#,
        )
        .unwrap();
        std::fs::write(
            models.join("risk_classifier.json"),
            r#"{"type":"logistic","classes":["HIGH","LOW","MEDIUM"],
                "coefficients":[[-1.0],[1.0],[0.0]],"intercepts":[2.5,-2.5,0.0]}"#,
        )
        .unwrap();
        std::fs::write(models.join("config.json"), r#"{"feature_cols":["cum_gpa"]}"#).unwrap();

        let input = dir.path().join("terms.csv");
        std::fs::write(
            &input,
            "student_id,term_key,term_gpa,term_points,cum_gpa,student_name\n\
             7,1447-1,2.0,30,2.0,Huda\n\
             7,1447-2,3.0,45,2.5,Huda\n",
        )
        .unwrap();

        let out = dir.path().join("predictions.csv");
        let written = run(&PredictOptions {
            input,
            sheet: "Term_Summary".into(),
            models_dir: models,
            out: out.clone(),
        })
        .unwrap();
        assert_eq!(written, 1);

        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("risk_probability_high"));
        assert!(text.contains("7,Huda,1447-2,3,2.5,2.5,"));
    }
}
