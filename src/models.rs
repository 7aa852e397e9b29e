/// One output row of the `predict` command.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub student_id: String,
    pub student_label: String,
    pub term_key: String,
    pub term_gpa: Option<f64>,
    pub cum_gpa: Option<f64>,
    pub predicted_next_term_gpa: f64,
    pub predicted_risk_level: String,
    pub risk_probability_high: Option<f64>,
}

/// A predictions CSV row with its columns resolved through the synonym lists.
/// Values stay as the text found in the file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StudentPrediction {
    pub student_id: String,
    pub student_name: String,
    pub current_gpa: Option<String>,
    pub predicted_next_term_gpa: Option<String>,
    pub risk_level: Option<String>,
    pub risk_probability_high: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RiskLevelSummary {
    pub risk_level: String,
    pub count: usize,
    pub avg_predicted_gpa: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GpaDrop {
    pub student_id: String,
    pub student_name: String,
    pub current_gpa: f64,
    pub predicted_gpa: f64,
}
