use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const REGRESSOR_FILE: &str = "gpa_regressor.json";
pub const CLASSIFIER_FILE: &str = "risk_classifier.json";
pub const CONFIG_FILE: &str = "config.json";

pub const HIGH_RISK_CLASS: &str = "HIGH";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{file}: {reason}")]
    Shape { file: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub feature_cols: Vec<String>,
}

/// Standardisation applied before the linear terms: `(x - mean) / scale`.
#[derive(Debug, Clone, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mean, scale))| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                (x - mean) / scale
            })
            .collect()
    }

    fn check(&self, width: usize, file: &'static str) -> Result<(), ModelError> {
        if self.mean.len() != width || self.scale.len() != width {
            return Err(ModelError::Shape {
                file,
                reason: format!(
                    "scaler has {}/{} entries, expected {width}",
                    self.mean.len(),
                    self.scale.len()
                ),
            });
        }
        Ok(())
    }
}

fn scaled(scaler: &Option<Scaler>, row: &[f64]) -> Vec<f64> {
    match scaler {
        Some(scaler) => scaler.transform(row),
        None => row.to_vec(),
    }
}

fn dot(weights: &[f64], row: &[f64]) -> f64 {
    weights.iter().zip(row).map(|(w, x)| w * x).sum()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Regressor {
    Linear {
        coefficients: Vec<f64>,
        intercept: f64,
        #[serde(default)]
        scaler: Option<Scaler>,
        #[serde(default)]
        clip: Option<[f64; 2]>,
    },
}

impl Regressor {
    fn check(&self, width: usize) -> Result<(), ModelError> {
        let Regressor::Linear {
            coefficients,
            scaler,
            ..
        } = self;
        if coefficients.len() != width {
            return Err(ModelError::Shape {
                file: REGRESSOR_FILE,
                reason: format!(
                    "{} coefficients for {width} feature columns",
                    coefficients.len()
                ),
            });
        }
        if let Some(scaler) = scaler {
            scaler.check(width, REGRESSOR_FILE)?;
        }
        Ok(())
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        let Regressor::Linear {
            coefficients,
            intercept,
            scaler,
            clip,
        } = self;
        rows.iter()
            .map(|row| {
                let value = intercept + dot(coefficients, &scaled(scaler, row));
                match clip {
                    Some([lo, hi]) => value.clamp(*lo, *hi),
                    None => value,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Band {
    pub below: f64,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Classifier {
    /// Binary (one coefficient row) or multinomial logistic regression.
    Logistic {
        classes: Vec<String>,
        coefficients: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
        #[serde(default)]
        scaler: Option<Scaler>,
    },
    /// Cut-offs on a single feature. Exposes no probabilities.
    Thresholds {
        feature: String,
        bands: Vec<Band>,
        otherwise: String,
        #[serde(skip)]
        feature_index: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities {
    pub classes: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl ClassProbabilities {
    /// Probability of the `HIGH` class, or each row's largest probability when
    /// the classifier has no such class.
    pub fn high_risk(&self) -> Vec<f64> {
        match self.classes.iter().position(|c| c == HIGH_RISK_CLASS) {
            Some(idx) => self.rows.iter().map(|row| row[idx]).collect(),
            None => self
                .rows
                .iter()
                .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
                .collect(),
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl Classifier {
    fn prepare(&mut self, feature_cols: &[String]) -> Result<(), ModelError> {
        let width = feature_cols.len();
        let shape = |reason: String| ModelError::Shape {
            file: CLASSIFIER_FILE,
            reason,
        };
        match self {
            Classifier::Logistic {
                classes,
                coefficients,
                intercepts,
                scaler,
            } => {
                let expected_rows = if classes.len() == 2 { 1 } else { classes.len() };
                if classes.len() < 2 {
                    return Err(shape(format!("needs at least 2 classes, got {}", classes.len())));
                }
                if coefficients.len() != expected_rows || intercepts.len() != expected_rows {
                    return Err(shape(format!(
                        "{} classes need {expected_rows} coefficient rows and intercepts, got {} and {}",
                        classes.len(),
                        coefficients.len(),
                        intercepts.len()
                    )));
                }
                if let Some(row) = coefficients.iter().find(|row| row.len() != width) {
                    return Err(shape(format!(
                        "coefficient row of length {} for {width} feature columns",
                        row.len()
                    )));
                }
                if let Some(scaler) = scaler {
                    scaler.check(width, CLASSIFIER_FILE)?;
                }
            }
            Classifier::Thresholds {
                feature,
                feature_index,
                ..
            } => {
                *feature_index = feature_cols
                    .iter()
                    .position(|c| c.as_str() == feature.as_str())
                    .ok_or_else(|| shape(format!("feature '{feature}' is not a configured feature column")))?;
            }
        }
        Ok(())
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Vec<String> {
        match self {
            Classifier::Logistic { classes, .. } => self
                .predict_proba(rows)
                .map(|probs| {
                    probs
                        .rows
                        .iter()
                        .map(|row| {
                            let best = row
                                .iter()
                                .enumerate()
                                .fold(0, |best, (idx, p)| if *p > row[best] { idx } else { best });
                            classes[best].clone()
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Classifier::Thresholds {
                bands,
                otherwise,
                feature_index,
                ..
            } => rows
                .iter()
                .map(|row| {
                    let value = row[*feature_index];
                    bands
                        .iter()
                        .find(|band| value < band.below)
                        .map_or_else(|| otherwise.clone(), |band| band.label.clone())
                })
                .collect(),
        }
    }

    /// `None` for classifiers that only produce labels.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Option<ClassProbabilities> {
        let Classifier::Logistic {
            classes,
            coefficients,
            intercepts,
            scaler,
        } = self
        else {
            return None;
        };

        let rows = rows
            .iter()
            .map(|row| {
                let row = scaled(scaler, row);
                let scores: Vec<f64> = coefficients
                    .iter()
                    .zip(intercepts)
                    .map(|(weights, b)| b + dot(weights, &row))
                    .collect();
                if classes.len() == 2 {
                    let p = sigmoid(scores[0]);
                    vec![1.0 - p, p]
                } else {
                    softmax(&scores)
                }
            })
            .collect();

        Some(ClassProbabilities {
            classes: classes.clone(),
            rows,
        })
    }
}

/// Regressor, classifier and the feature columns they were trained on.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub feature_cols: Vec<String>,
    pub regressor: Regressor,
    pub classifier: Classifier,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let raw = fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ModelError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl ModelBundle {
    pub fn new(
        config: ModelConfig,
        regressor: Regressor,
        mut classifier: Classifier,
    ) -> Result<Self, ModelError> {
        regressor.check(config.feature_cols.len())?;
        classifier.prepare(&config.feature_cols)?;
        Ok(Self {
            feature_cols: config.feature_cols,
            regressor,
            classifier,
        })
    }

    pub fn load(models_dir: &Path) -> Result<Self, ModelError> {
        let regressor: Regressor = read_json(&models_dir.join(REGRESSOR_FILE))?;
        let classifier: Classifier = read_json(&models_dir.join(CLASSIFIER_FILE))?;
        let config: ModelConfig = read_json(&models_dir.join(CONFIG_FILE))?;
        let bundle = Self::new(config, regressor, classifier)?;
        info!(
            models_dir = %models_dir.display(),
            features = bundle.feature_cols.len(),
            "loaded models"
        );
        Ok(bundle)
    }
}
