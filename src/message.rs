use serde_json::Value;

use crate::error::PatientError;
use crate::mapper::MappedPatient;

/// One entry of the input batch, as handed from the reader to the pipeline.
#[derive(Debug, Clone)]
pub enum RawRecord {
    Json(Value),
    /// A JSONL line that did not parse. Reported as a malformed record.
    Unparseable { line: usize, reason: String },
}

/// Result of one patient job, sent from a worker back to the single writer.
#[derive(Debug)]
pub enum PatientOutcome {
    Mapped(MappedPatient),
    Failed {
        patient_id: String,
        error: PatientError,
    },
}
