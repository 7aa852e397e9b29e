use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{GpaDrop, RiskLevelSummary, StudentPrediction};

fn parse(value: Option<&String>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite())
}

fn display_name(student: &StudentPrediction) -> &str {
    if student.student_name.is_empty() {
        &student.student_id
    } else {
        &student.student_name
    }
}

pub fn summarize_by_risk(students: &[StudentPrediction]) -> Vec<RiskLevelSummary> {
    let mut map: HashMap<String, (usize, f64, usize)> = HashMap::new();

    for student in students {
        let level = student
            .risk_level
            .clone()
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let entry = map.entry(level).or_insert((0, 0.0, 0));
        entry.0 += 1;
        if let Some(gpa) = parse(student.predicted_next_term_gpa.as_ref()) {
            entry.1 += gpa;
            entry.2 += 1;
        }
    }

    let mut summaries: Vec<RiskLevelSummary> = map
        .into_iter()
        .map(|(risk_level, (count, gpa_total, gpa_count))| RiskLevelSummary {
            risk_level,
            count,
            avg_predicted_gpa: (gpa_count > 0).then(|| gpa_total / gpa_count as f64),
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.risk_level.cmp(&b.risk_level)));
    summaries
}

/// Students ordered by high-risk probability, then by lowest predicted GPA.
pub fn highest_risk(students: &[StudentPrediction], limit: usize) -> Vec<&StudentPrediction> {
    let mut ranked: Vec<&StudentPrediction> = students.iter().collect();
    ranked.sort_by(|a, b| {
        let prob = |s: &StudentPrediction| parse(s.risk_probability_high.as_ref()).unwrap_or(-1.0);
        let gpa = |s: &StudentPrediction| {
            parse(s.predicted_next_term_gpa.as_ref()).unwrap_or(f64::INFINITY)
        };
        prob(b)
            .total_cmp(&prob(a))
            .then_with(|| gpa(a).total_cmp(&gpa(b)))
    });
    ranked.truncate(limit);
    ranked
}

/// Students whose predicted GPA falls furthest below their cumulative GPA.
pub fn largest_drops(students: &[StudentPrediction], limit: usize) -> Vec<GpaDrop> {
    let mut drops: Vec<GpaDrop> = students
        .iter()
        .filter_map(|s| {
            let current_gpa = parse(s.current_gpa.as_ref())?;
            let predicted_gpa = parse(s.predicted_next_term_gpa.as_ref())?;
            (predicted_gpa < current_gpa).then(|| GpaDrop {
                student_id: s.student_id.clone(),
                student_name: display_name(s).to_string(),
                current_gpa,
                predicted_gpa,
            })
        })
        .collect();

    drops.sort_by(|a, b| {
        (b.current_gpa - b.predicted_gpa).total_cmp(&(a.current_gpa - a.predicted_gpa))
    });
    drops.truncate(limit);
    drops
}

pub fn build_report(
    source: &str,
    generated_on: NaiveDate,
    students: &[StudentPrediction],
    limit: usize,
) -> String {
    let summaries = summarize_by_risk(students);

    let mut output = String::new();

    let _ = writeln!(output, "# Next Term Risk Report");
    let _ = writeln!(
        output,
        "Generated on {} from {} ({} students)",
        generated_on,
        source,
        students.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No predictions found.");
    } else {
        for summary in &summaries {
            match summary.avg_predicted_gpa {
                Some(avg) => {
                    let _ = writeln!(
                        output,
                        "- {}: {} students (avg predicted GPA {:.2})",
                        summary.risk_level, summary.count, avg
                    );
                }
                None => {
                    let _ = writeln!(output, "- {}: {} students", summary.risk_level, summary.count);
                }
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");

    let ranked = highest_risk(students, limit);
    if ranked.is_empty() {
        let _ = writeln!(output, "No predictions found.");
    } else {
        for student in ranked {
            let _ = writeln!(
                output,
                "- {} ({}) risk {} p(high) {} predicted GPA {}",
                display_name(student),
                student.student_id,
                student.risk_level.as_deref().unwrap_or("-"),
                student.risk_probability_high.as_deref().unwrap_or("-"),
                student.predicted_next_term_gpa.as_deref().unwrap_or("-"),
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Largest Predicted GPA Drops");

    let drops = largest_drops(students, limit);
    if drops.is_empty() {
        let _ = writeln!(output, "No student is predicted to fall below their cumulative GPA.");
    } else {
        for drop in drops {
            let _ = writeln!(
                output,
                "- {} ({}) {:.2} -> {:.2}",
                drop.student_name, drop.student_id, drop.current_gpa, drop.predicted_gpa
            );
        }
    }

    output
}
