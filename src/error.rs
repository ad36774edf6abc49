//! Error types for schema loading, patient processing and output.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A malformed or ambiguous mapping schema. Fatal for the whole run.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema is missing required column '{column}'")]
    MissingColumn { column: &'static str },

    #[error("schema row {row}: output_column is empty")]
    EmptyOutputColumn { row: usize },

    #[error("schema row {row}: duplicate output column '{column}'")]
    DuplicateOutputColumn { column: String, row: usize },

    #[error("schema field '{column}': unknown transform '{transform}'")]
    UnknownTransform { column: String, transform: String },

    #[error("schema field '{column}': invalid transform argument: {reason}")]
    InvalidTransformArg { column: String, reason: String },

    #[error("schema field '{column}': invalid source path '{path}': {reason}")]
    InvalidSourcePath {
        column: String,
        path: String,
        reason: String,
    },

    #[error("schema field '{column}': invalid payer_scope value '{value}'")]
    InvalidFlag { column: String, value: String },

    #[error("invalid row policy '{value}'")]
    InvalidPolicy { value: String },

    #[error("schema declares conflicting row policies '{first}' and '{second}'")]
    ConflictingPolicy { first: String, second: String },

    #[error("schema declares no fields")]
    Empty,

    #[error("failed to parse schema table: {0}")]
    Csv(#[from] csv::Error),
}

/// A single patient record lacks required structure.
#[derive(Debug, Clone, Error)]
#[error("record {index}: {reason}")]
pub struct MalformedRecordError {
    /// Position of the record in the input batch.
    pub index: usize,
    pub reason: String,
}

/// No payers were available to rank for a patient.
#[derive(Debug, Clone, Error)]
#[error("patient '{patient_id}' has no payers to rank")]
pub struct RankingError {
    pub patient_id: String,
}

/// A schema field could not be resolved to a usable value.
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    #[error("patient '{patient_id}': required field '{field}' is absent")]
    MissingField { field: String, patient_id: String },

    #[error("patient '{patient_id}': field '{field}' has unknown code '{code}'")]
    UnknownCode {
        field: String,
        patient_id: String,
        code: String,
    },

    #[error("patient '{patient_id}': field '{field}' value '{value}' is not a recognized date")]
    InvalidDate {
        field: String,
        patient_id: String,
        value: String,
    },
}

/// Writing the CSV artifact failed. Never retried by the core.
#[derive(Debug, Error)]
#[error("failed to write output to {target}: {source}")]
pub struct SinkWriteError {
    pub target: String,
    #[source]
    pub source: std::io::Error,
}

/// A row does not match the column layout it is being written against.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("row for patient '{patient_id}' is missing column '{column}'")]
    IncompleteRow { patient_id: String, column: String },

    #[error("row for patient '{patient_id}' has {actual} columns, layout has {expected}")]
    ColumnCount {
        patient_id: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Sink(#[from] SinkWriteError),
}

/// Any error scoped to one patient. Collected into the run report under the
/// skip policy.
#[derive(Debug, Clone, Error)]
pub enum PatientError {
    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    Ranking(#[from] RankingError),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl PatientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatientError::Malformed(_) => ErrorKind::MalformedRecord,
            PatientError::Ranking(_) => ErrorKind::Ranking,
            PatientError::Mapping(MappingError::MissingField { .. }) => ErrorKind::MissingField,
            PatientError::Mapping(MappingError::UnknownCode { .. }) => ErrorKind::UnknownCode,
            PatientError::Mapping(MappingError::InvalidDate { .. }) => ErrorKind::InvalidValue,
        }
    }
}

/// Report category for a per-patient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "MalformedRecordError")]
    MalformedRecord,
    #[serde(rename = "RankingError")]
    Ranking,
    #[serde(rename = "MissingFieldError")]
    MissingField,
    #[serde(rename = "UnknownCodeError")]
    UnknownCode,
    #[serde(rename = "InvalidValueError")]
    InvalidValue,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedRecord => "MalformedRecordError",
            ErrorKind::Ranking => "RankingError",
            ErrorKind::MissingField => "MissingFieldError",
            ErrorKind::UnknownCode => "UnknownCodeError",
            ErrorKind::InvalidValue => "InvalidValueError",
        };
        f.write_str(name)
    }
}

/// Errors that halt a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Sink(#[from] SinkWriteError),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error("run aborted at patient '{patient_id}': {source}")]
    Aborted {
        patient_id: String,
        #[source]
        source: PatientError,
    },

    #[error("patient worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_error_kinds() {
        let missing: PatientError = MappingError::MissingField {
            field: "dob".to_string(),
            patient_id: "p1".to_string(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::MissingField);
        assert!(missing.to_string().contains("required field 'dob'"));

        let ranking: PatientError = RankingError {
            patient_id: "p2".to_string(),
        }
        .into();
        assert_eq!(ranking.kind(), ErrorKind::Ranking);
        assert_eq!(ranking.kind().to_string(), "RankingError");
    }

    /// Test that the JSON report and the table use the same kind names.
    /// Expected: every kind serializes to its Display text.
    #[test]
    fn test_error_kind_serializes_as_display() {
        for kind in [
            ErrorKind::MalformedRecord,
            ErrorKind::Ranking,
            ErrorKind::MissingField,
            ErrorKind::UnknownCode,
            ErrorKind::InvalidValue,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(kind.to_string()));
        }
    }
}
