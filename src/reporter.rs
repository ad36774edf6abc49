use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use prettytable::{Cell, Row, Table, row};
use serde::Serialize;

use crate::error::{ErrorKind, PatientError};

/// One per-patient failure collected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub patient_id: String,
    /// Set when only one payer's row failed.
    pub rank: Option<u32>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub patients_seen: usize,
    pub patients_emitted: usize,
    pub rows_emitted: usize,
    pub errors: Vec<ReportEntry>,
}

impl RunReport {
    pub fn record_error(&mut self, patient_id: &str, rank: Option<u32>, error: &PatientError) {
        self.errors.push(ReportEntry {
            patient_id: patient_id.to_string(),
            rank,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Patients with at least one error, in run order.
    pub fn failed_patients(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.errors.iter().map(|e| e.patient_id.as_str()).collect();
        ids.dedup();
        ids
    }
}

/// Render the error table. Empty when the run was clean.
pub fn render_errors(report: &RunReport) -> String {
    if report.errors.is_empty() {
        return String::new();
    }
    let mut table = Table::new();
    table.add_row(row!["Patient", "Rank", "Error", "Detail"]);
    for entry in &report.errors {
        let rank = entry.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        table.add_row(Row::new(vec![
            Cell::new(&entry.patient_id),
            Cell::new(&rank),
            Cell::new(&entry.kind.to_string()),
            Cell::new(&entry.message),
        ]));
    }
    table.to_string()
}

/// Print the run summary to stderr, keeping stdout free for CSV output.
pub fn print_report(report: &RunReport) {
    eprintln!("\n--- Mapping Report ---");
    eprintln!(
        "patients: {} seen, {} emitted | rows: {}",
        report.patients_seen, report.patients_emitted, report.rows_emitted
    );
    if report.is_clean() {
        eprintln!("{}", "no errors".green());
        return;
    }
    eprintln!("{}", summary_line(report).yellow().bold());
    eprint!("{}", render_errors(report));
}

fn summary_line(report: &RunReport) -> String {
    format!(
        "{} error(s) across {} patient(s)",
        report.errors.len(),
        report.failed_patients().len()
    )
}

/// Write the report as pretty JSON.
pub fn write_report_json(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MappingError, RankingError};

    fn sample_report() -> RunReport {
        let mut report = RunReport {
            patients_seen: 3,
            patients_emitted: 2,
            rows_emitted: 3,
            errors: Vec::new(),
        };
        report.record_error(
            "p2",
            None,
            &RankingError {
                patient_id: "p2".to_string(),
            }
            .into(),
        );
        report.record_error(
            "p3",
            Some(2),
            &MappingError::UnknownCode {
                field: "gender".to_string(),
                patient_id: "p3".to_string(),
                code: "Q".to_string(),
            }
            .into(),
        );
        report
    }

    #[test]
    fn test_record_error() {
        let report = sample_report();
        assert!(!report.is_clean());
        assert_eq!(report.failed_patients(), vec!["p2", "p3"]);
        assert_eq!(report.errors[1].kind, ErrorKind::UnknownCode);
        assert_eq!(report.errors[1].rank, Some(2));
    }

    /// Test the summary line printed above the error table.
    /// Expected: two row errors on one patient count that patient once.
    #[test]
    fn test_summary_counts_failed_patients() {
        let mut report = sample_report();
        report.record_error(
            "p3",
            Some(3),
            &MappingError::UnknownCode {
                field: "gender".to_string(),
                patient_id: "p3".to_string(),
                code: "Z".to_string(),
            }
            .into(),
        );
        assert_eq!(summary_line(&report), "3 error(s) across 2 patient(s)");
    }

    /// Test the rendered error table.
    /// Expected: one line per error with kind names, nothing for a clean run.
    #[test]
    fn test_render_errors() {
        let rendered = render_errors(&sample_report());
        assert!(rendered.contains("RankingError"));
        assert!(rendered.contains("UnknownCodeError"));
        assert!(rendered.contains("p3"));
        assert!(render_errors(&RunReport::default()).is_empty());
    }

    #[test]
    fn test_write_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report_json(&sample_report(), &path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["patients_seen"], 3);
        assert_eq!(value["errors"][0]["kind"], "RankingError");
        assert_eq!(value["errors"][1]["rank"], 2);
    }
}
