//! Offline analysis of labeled HRV datasets
//!
//! Reads a CSV with one row per measurement:
//!
//! ```text
//! Subject,HRV (ms),Stress or not
//! S01,42.5,Yes
//! S01,71.0,No
//! ```
//!
//! and summarizes each subject's stressed and calm readings. The suggested
//! threshold is the midpoint between the stressed and calm medians, the same
//! shape of rule the calibration engine applies to live training data.

use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::io::Read;
use std::path::Path;
use tabled::{Table, Tabled};
use tracing::{debug, warn};

use crate::calibration::median;
use crate::models::StressLabel;

pub const SUBJECT_COLUMN: &str = "Subject";
pub const HRV_COLUMN: &str = "HRV (ms)";
pub const LABEL_COLUMN: &str = "Stress or not";

/// Map a dataset label cell; only the exact values `Yes` and `No` count
pub fn dataset_label(value: &str) -> Option<StressLabel> {
    match value {
        "Yes" => Some(StressLabel::Stressed),
        "No" => Some(StressLabel::Calm),
        _ => None,
    }
}

/// Count, median and mean of one group of readings
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupStats {
    pub count: usize,
    pub median: f64,
    pub mean: f64,
}

impl GroupStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        Some(Self {
            count: values.len(),
            median: median(values)?,
            mean: values.iter().mean(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSummary {
    pub subject: String,
    pub stressed: Option<GroupStats>,
    pub calm: Option<GroupStats>,
    /// Midpoint of the two medians, when both groups exist
    pub threshold: Option<f64>,
}

#[derive(Default)]
struct Readings {
    stressed: Vec<f64>,
    calm: Vec<f64>,
}

/// Summarize a labeled dataset, subjects in order of first appearance
pub fn analyze_reader<R: Read>(input: R) -> Result<Vec<SubjectSummary>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| {
                anyhow!(
                    "Required column '{}' missing. Found: {:?}",
                    name,
                    headers.iter().collect::<Vec<_>>()
                )
            })
    };
    let subject_idx = column(SUBJECT_COLUMN)?;
    let hrv_idx = column(HRV_COLUMN)?;
    let label_idx = column(LABEL_COLUMN)?;

    let mut subjects: Vec<(String, Readings)> = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
        let subject = record.get(subject_idx).unwrap_or_default();
        let hrv = record.get(hrv_idx).and_then(|v| v.parse::<f64>().ok());
        let label = record.get(label_idx).and_then(dataset_label);

        let (Some(hrv), Some(label)) = (hrv, label) else {
            warn!(row = line + 2, "skipping row without numeric HRV or yes/no label");
            continue;
        };
        if subject.is_empty() || !hrv.is_finite() {
            warn!(row = line + 2, "skipping row without subject or finite HRV");
            continue;
        }

        let index = match subjects.iter().position(|(s, _)| s == subject) {
            Some(index) => index,
            None => {
                subjects.push((subject.to_string(), Readings::default()));
                subjects.len() - 1
            }
        };
        let readings = &mut subjects[index].1;
        match label {
            StressLabel::Stressed => readings.stressed.push(hrv),
            StressLabel::Calm => readings.calm.push(hrv),
        }
    }

    debug!(subjects = subjects.len(), "dataset parsed");

    Ok(subjects
        .into_iter()
        .map(|(subject, readings)| {
            let stressed = GroupStats::from_values(&readings.stressed);
            let calm = GroupStats::from_values(&readings.calm);
            let threshold = match (stressed, calm) {
                (Some(s), Some(c)) => Some((s.median + c.median) / 2.0),
                _ => None,
            };
            SubjectSummary {
                subject,
                stressed,
                calm,
                threshold,
            }
        })
        .collect())
}

pub fn analyze_file<P: AsRef<Path>>(path: P) -> Result<Vec<SubjectSummary>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
    analyze_reader(file)
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Subject")]
    subject: String,
    #[tabled(rename = "Stressed n")]
    stressed_count: usize,
    #[tabled(rename = "Stressed median")]
    stressed_median: String,
    #[tabled(rename = "Stressed mean")]
    stressed_mean: String,
    #[tabled(rename = "Calm n")]
    calm_count: usize,
    #[tabled(rename = "Calm median")]
    calm_median: String,
    #[tabled(rename = "Calm mean")]
    calm_mean: String,
    #[tabled(rename = "Threshold")]
    threshold: String,
}

fn fmt_ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", v))
}

/// Render summaries as a text table
pub fn render_table(summaries: &[SubjectSummary]) -> String {
    let rows = summaries.iter().map(|s| SummaryRow {
        subject: s.subject.clone(),
        stressed_count: s.stressed.map_or(0, |g| g.count),
        stressed_median: fmt_ms(s.stressed.map(|g| g.median)),
        stressed_mean: fmt_ms(s.stressed.map(|g| g.mean)),
        calm_count: s.calm.map_or(0, |g| g.count),
        calm_median: fmt_ms(s.calm.map(|g| g.median)),
        calm_mean: fmt_ms(s.calm.map(|g| g.mean)),
        threshold: fmt_ms(s.threshold),
    });
    Table::new(rows).to_string()
}
