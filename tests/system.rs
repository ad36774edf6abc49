use claimmapper::error::{ErrorKind, PipelineError};
use claimmapper::json_faker::write_fake_patients_jsonl;
use claimmapper::pipeline::{FailurePolicy, Pipeline, PipelineConfig};
use claimmapper::reader::{read_patients, read_schema};
use claimmapper::reporter::write_report_json;
use claimmapper::schema::RowPolicy;
use claimmapper::sink::{OutputMode, OutputTarget};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

async fn fixture_pipeline(config: PipelineConfig) -> Pipeline {
    let schema = read_schema(&fixture("cms1500_schema.csv")).await.unwrap();
    Pipeline::from_schema_source(&schema, config).expect("fixture schema should load")
}

/// Read a CSV file back into header-keyed records.
fn reparse(path: &Path) -> (Vec<String>, Vec<HashMap<String, String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| {
            let record = r.unwrap();
            let row: HashMap<String, String> = headers.iter().cloned().zip(record.iter().map(str::to_string)).collect();
            row
        })
        .collect();
    (headers, rows)
}

/// Test the full file-based flow with the CMS-1500 fixture schema.
/// Expected: tall rows for P100 (two payers) and P300, P200 reported, values survive a reparse.
#[tokio::test]
async fn test_fixture_batch_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("cms1500.csv");
    let pipeline = fixture_pipeline(PipelineConfig {
        workers: 4,
        ..PipelineConfig::default()
    })
    .await;
    assert_eq!(pipeline.schema().policy, RowPolicy::Tall);

    let records = read_patients(&fixture("patients.json")).await.unwrap();
    let report = pipeline.run(records, &OutputTarget::File(output.clone())).await.unwrap();

    assert_eq!(report.patients_seen, 3);
    assert_eq!(report.patients_emitted, 2);
    assert_eq!(report.rows_emitted, 3);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].patient_id, "P200");
    assert_eq!(report.errors[0].kind, ErrorKind::Ranking);

    let (headers, rows) = reparse(&output);
    assert_eq!(headers.len(), 23);
    assert_eq!(headers[0], "patient_insurance_id");
    assert_eq!(headers[22], "policy_EndDate");
    assert_eq!(rows.len(), 3);

    let medicare = &rows[0];
    assert_eq!(medicare["rank"], "Primary");
    assert_eq!(medicare["payer_name"], "Medicare");
    assert_eq!(medicare["patient_insurance_id"], "ROOT-100");
    assert_eq!(medicare["medicare"], "1EG4-TE5-MK72");
    assert_eq!(medicare["medicaid"], "");
    assert_eq!(medicare["patient_dob"], "02/14/1980");
    assert_eq!(medicare["patient_gender"], "Female");
    assert_eq!(medicare["relation"], "Self");
    assert_eq!(medicare["policy_EndDate"], "");

    let commercial = &rows[1];
    assert_eq!(commercial["rank"], "Secondary");
    assert_eq!(commercial["patient_insurance_id"], "COV-1");
    assert_eq!(commercial["payer_name"], "Blue Shield, Inc.");
    assert_eq!(commercial["group_name"], "Acme \"Gold\" Plan");
    assert_eq!(commercial["group_number"], "4411");
    assert_eq!(commercial["medicare"], "");
    assert_eq!(commercial["patient_middle_name"], "");
    assert_eq!(commercial["patient_zip"], "62701");
    assert_eq!(commercial["policy_StartDate"], "2019-01-01");

    let medicaid = &rows[2];
    assert_eq!(medicaid["rank"], "Primary");
    assert_eq!(medicaid["patient_insurance_id"], "ROOT-300");
    assert_eq!(medicaid["medicaid"], "MCD-9");
    assert_eq!(medicaid["patient_gender"], "Male");
}

/// Test that an aborted atomic run leaves no artifact.
/// Expected: Aborted error and no output file.
#[tokio::test]
async fn test_abort_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");
    let pipeline = fixture_pipeline(PipelineConfig {
        failure_policy: FailurePolicy::Abort,
        ..PipelineConfig::default()
    })
    .await;
    let records = read_patients(&fixture("patients.json")).await.unwrap();

    let err = pipeline.run(records, &OutputTarget::File(output.clone())).await.unwrap_err();
    assert!(matches!(err, PipelineError::Aborted { ref patient_id, .. } if patient_id == "P200"));
    assert!(!output.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// Test streaming mode under abort.
/// Expected: rows written before the failing patient remain on disk.
#[tokio::test]
async fn test_streaming_abort_keeps_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.csv");
    let pipeline = fixture_pipeline(PipelineConfig {
        failure_policy: FailurePolicy::Abort,
        output_mode: OutputMode::Streaming,
        workers: 2,
        ..PipelineConfig::default()
    })
    .await;
    let records = read_patients(&fixture("patients.json")).await.unwrap();

    assert!(pipeline.run(records, &OutputTarget::File(output.clone())).await.is_err());
    let (_, rows) = reparse(&output);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["patient_member_id"] != "MCD-9"));
}

/// Test generated patients through the fixture schema.
/// Expected: every generated patient is emitted without errors.
#[tokio::test]
async fn test_generated_batch_maps_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("fake.jsonl");
    let output = dir.path().join("fake.csv");
    write_fake_patients_jsonl(&input, 25).unwrap();

    let pipeline = fixture_pipeline(PipelineConfig {
        workers: 3,
        ..PipelineConfig::default()
    })
    .await;
    let records = read_patients(&input).await.unwrap();
    let report = pipeline.run(records, &OutputTarget::File(output.clone())).await.unwrap();

    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    assert_eq!(report.patients_emitted, 25);
    let (_, rows) = reparse(&output);
    assert_eq!(rows.len(), report.rows_emitted);
    assert!(rows.iter().all(|r| !r["patient_member_id"].is_empty()));

    let report_path = dir.path().join("report.json");
    write_report_json(&report, &report_path).unwrap();
    assert!(report_path.exists());
}

/// Test the binary's map command against the fixtures.
/// Expected: exit success, CSV file and JSON report written.
#[test]
fn test_cli_map_command() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("cli.csv");
    let report = dir.path().join("report.json");
    let status = Command::new(env!("CARGO_BIN_EXE_claimmapper"))
        .arg("map")
        .arg("--schema")
        .arg(fixture("cms1500_schema.csv"))
        .arg("--input")
        .arg(fixture("patients.json"))
        .arg("--output")
        .arg(&output)
        .arg("--report")
        .arg(&report)
        .status()
        .expect("binary should start");
    assert!(status.success());

    let (_, rows) = reparse(&output);
    assert_eq!(rows.len(), 3);
    let report: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(report["errors"][0]["patient_id"], "P200");
}

#[test]
fn test_cli_rejects_bad_schema() {
    let dir = tempfile::tempdir().unwrap();
    let schema = dir.path().join("bad.csv");
    std::fs::write(&schema, "output_column,source_path,transform\nx,y,frobnicate\n").unwrap();
    let output = dir.path().join("never.csv");
    let status = Command::new(env!("CARGO_BIN_EXE_claimmapper"))
        .arg("map")
        .arg("--schema")
        .arg(&schema)
        .arg("--input")
        .arg(fixture("patients.json"))
        .arg("--output")
        .arg(&output)
        .status()
        .expect("binary should start");
    assert!(!status.success());
    assert!(!output.exists());
}
