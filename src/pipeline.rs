use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::classifier::Classifier;
use crate::error::{MalformedRecordError, PatientError, PipelineError, SchemaError};
use crate::logging::log_patient_event;
use crate::mapper::{MappedPatient, Mapper, OutputRow};
use crate::message::{PatientOutcome, RawRecord};
use crate::patient::normalize;
use crate::payer::rank;
use crate::reporter::RunReport;
use crate::schema::{self, RowPolicy, Schema};
use crate::sink::{OutputMode, OutputTarget, RowSink};

/// What happens to the run when one patient fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Drop the patient, record the error, keep going.
    #[default]
    Skip,
    /// Stop at the first patient error.
    Abort,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Used when the schema does not declare a row policy itself.
    pub default_policy: RowPolicy,
    pub failure_policy: FailurePolicy,
    pub output_mode: OutputMode,
    /// Patients processed concurrently. Output order never depends on it.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_policy: RowPolicy::default(),
            failure_policy: FailurePolicy::default(),
            output_mode: OutputMode::default(),
            workers: 1,
        }
    }
}

/// Rows and report of an in-memory run.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub rows: Vec<OutputRow>,
    pub report: RunReport,
}

/// Drives a batch through normalize, rank and map, one job per patient.
///
/// Jobs run on the blocking pool; results are consumed in input order by a
/// single writer, so the artifact is identical for any worker count.
pub struct Pipeline {
    schema: Arc<Schema>,
    config: PipelineConfig,
    classifier: Option<Arc<dyn Classifier>>,
}

impl Pipeline {
    pub fn new(schema: Schema, config: PipelineConfig) -> Self {
        Self {
            schema: Arc::new(schema),
            config,
            classifier: None,
        }
    }

    /// Load the schema table and build a pipeline around it.
    pub fn from_schema_source(source: &str, config: PipelineConfig) -> Result<Self, SchemaError> {
        let schema = schema::load(source, config.default_policy)?;
        Ok(Self::new(schema, config))
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Run the batch and keep the rows in memory.
    pub async fn process(&self, records: Vec<RawRecord>) -> Result<BatchOutput, PipelineError> {
        let mut rows = Vec::new();
        let report = self
            .drive(records, |mapped| {
                rows.extend(mapped.rows.iter().cloned());
                Ok(())
            })
            .await?;
        Ok(BatchOutput { rows, report })
    }

    /// Run the batch and write the CSV artifact to `target`.
    ///
    /// On abort in atomic mode the target is left untouched.
    pub async fn run(&self, records: Vec<RawRecord>, target: &OutputTarget) -> Result<RunReport, PipelineError> {
        let mut sink = RowSink::open(target, self.config.output_mode, self.schema.layout())?;
        let mut report = self
            .drive(records, |mapped| {
                sink.write_rows(&mapped.rows)?;
                Ok(())
            })
            .await?;
        report.rows_emitted = sink.commit()?;
        tracing::info!(
            patients = report.patients_seen,
            emitted = report.patients_emitted,
            rows = report.rows_emitted,
            errors = report.errors.len(),
            "Run complete"
        );
        Ok(report)
    }

    async fn drive<F>(&self, records: Vec<RawRecord>, mut consume: F) -> Result<RunReport, PipelineError>
    where
        F: FnMut(&MappedPatient) -> Result<(), PipelineError>,
    {
        let mut report = RunReport {
            patients_seen: records.len(),
            ..RunReport::default()
        };
        let abort = self.config.failure_policy == FailurePolicy::Abort;

        let mut outcomes = stream::iter(records.into_iter().enumerate())
            .map(|(index, record)| {
                let schema = Arc::clone(&self.schema);
                let classifier = self.classifier.clone();
                tokio::task::spawn_blocking(move || process_record(&schema, classifier.as_deref(), index, record))
            })
            .buffered(self.config.workers.max(1));

        while let Some(joined) = outcomes.next().await {
            let outcome = joined.map_err(|e| PipelineError::Worker(e.to_string()))?;
            match outcome {
                PatientOutcome::Mapped(mapped) => {
                    for row_error in &mapped.row_errors {
                        let error = PatientError::from(row_error.error.clone());
                        if abort {
                            return Err(PipelineError::Aborted {
                                patient_id: mapped.patient_id.clone(),
                                source: error,
                            });
                        }
                        report.record_error(&mapped.patient_id, Some(row_error.rank), &error);
                    }
                    consume(&mapped)?;
                    if !mapped.rows.is_empty() {
                        report.patients_emitted += 1;
                    }
                    report.rows_emitted += mapped.rows.len();
                }
                PatientOutcome::Failed { patient_id, error } => {
                    tracing::warn!(patient_id = %patient_id, kind = %error.kind(), "Patient skipped");
                    if abort {
                        return Err(PipelineError::Aborted {
                            patient_id,
                            source: error,
                        });
                    }
                    report.record_error(&patient_id, None, &error);
                }
            }
        }
        Ok(report)
    }
}

/// One patient job: normalize, rank, map. Never touches shared mutable state.
fn process_record(
    schema: &Schema,
    classifier: Option<&dyn Classifier>,
    index: usize,
    record: RawRecord,
) -> PatientOutcome {
    let raw = match record {
        RawRecord::Json(raw) => raw,
        RawRecord::Unparseable { line, reason } => {
            return PatientOutcome::Failed {
                patient_id: format!("line {line}"),
                error: MalformedRecordError { index, reason }.into(),
            };
        }
    };

    let patient = match normalize(&raw, index, classifier) {
        Ok(patient) => patient,
        Err(e) => {
            return PatientOutcome::Failed {
                patient_id: format!("record {index}"),
                error: e.into(),
            };
        }
    };
    let patient_id = patient.patient_id.clone();
    log_patient_event(
        "normalizer",
        &patient_id,
        "normalized",
        &format!("{} payer(s) found", patient.payers.len()),
    );

    let ranked = match rank(&patient_id, &patient.payers) {
        Ok(ranked) => ranked,
        Err(e) => {
            return PatientOutcome::Failed {
                patient_id,
                error: e.into(),
            };
        }
    };
    log_patient_event("ranker", &patient_id, "ranked", "payers ranked");

    match Mapper::new(schema).with_classifier(classifier).map(&patient, &ranked) {
        Ok(mapped) => {
            log_patient_event(
                "mapper",
                &patient_id,
                "mapped",
                &format!("{} row(s), {} row error(s)", mapped.rows.len(), mapped.row_errors.len()),
            );
            PatientOutcome::Mapped(mapped)
        }
        Err(e) => PatientOutcome::Failed {
            patient_id,
            error: e.into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::patient::mock_patient_json;
    use crate::schema::mock_schema;
    use serde_json::json;

    fn pipeline(policy: RowPolicy, failure_policy: FailurePolicy, workers: usize) -> Pipeline {
        Pipeline::new(
            mock_schema(policy),
            PipelineConfig {
                default_policy: policy,
                failure_policy,
                workers,
                ..PipelineConfig::default()
            },
        )
    }

    fn batch() -> Vec<RawRecord> {
        let mut second = mock_patient_json();
        second["patientId"] = json!("P002");
        second["payers"] = json!([]);
        let mut third = mock_patient_json();
        third["patientId"] = json!("P003");
        vec![
            RawRecord::Json(mock_patient_json()),
            RawRecord::Json(second),
            RawRecord::Json(third),
        ]
    }

    /// Test that one failing patient does not stop the others under skip.
    /// Expected: rows for P001 and P003 only, one RankingError for P002.
    #[tokio::test]
    async fn test_skip_isolates_failure() {
        let out = pipeline(RowPolicy::Wide { slots: 2 }, FailurePolicy::Skip, 2)
            .process(batch())
            .await
            .unwrap();
        let ids: Vec<&str> = out.rows.iter().map(|r| r.patient_id.as_str()).collect();
        assert_eq!(ids, vec!["P001", "P003"]);
        assert_eq!(out.report.patients_seen, 3);
        assert_eq!(out.report.patients_emitted, 2);
        assert_eq!(out.report.errors.len(), 1);
        assert_eq!(out.report.errors[0].patient_id, "P002");
        assert_eq!(out.report.errors[0].kind, ErrorKind::Ranking);
    }

    #[tokio::test]
    async fn test_abort_stops_run() {
        let err = pipeline(RowPolicy::Wide { slots: 2 }, FailurePolicy::Abort, 1)
            .process(batch())
            .await
            .unwrap_err();
        match err {
            PipelineError::Aborted { patient_id, source } => {
                assert_eq!(patient_id, "P002");
                assert_eq!(source.kind(), ErrorKind::Ranking);
            }
            other => panic!("Expected Aborted, got {:?}", other),
        }
    }

    /// Test that tall rows come out in patient then rank order.
    /// Expected: Medicare ranks first for both patients.
    #[tokio::test]
    async fn test_tall_rows_in_order() {
        let out = pipeline(RowPolicy::Tall, FailurePolicy::Skip, 4)
            .process(batch())
            .await
            .unwrap();
        let keys: Vec<(String, Option<u32>)> = out.rows.iter().map(|r| (r.patient_id.clone(), r.rank)).collect();
        assert_eq!(
            keys,
            vec![
                ("P001".to_string(), Some(1)),
                ("P001".to_string(), Some(2)),
                ("P003".to_string(), Some(1)),
                ("P003".to_string(), Some(2)),
            ]
        );
        assert_eq!(out.rows[0].fields["plan_name"], "Medicare");
        assert_eq!(out.report.rows_emitted, 4);
    }

    #[tokio::test]
    async fn test_unparseable_line_reported() {
        let records = vec![
            RawRecord::Unparseable {
                line: 1,
                reason: "expected value".to_string(),
            },
            RawRecord::Json(mock_patient_json()),
        ];
        let out = pipeline(RowPolicy::Tall, FailurePolicy::Skip, 1)
            .process(records)
            .await
            .unwrap();
        assert_eq!(out.report.errors[0].patient_id, "line 1");
        assert_eq!(out.report.errors[0].kind, ErrorKind::MalformedRecord);
        assert_eq!(out.report.patients_emitted, 1);
    }
}
