use std::path::Path;

use anyhow::Context;

use crate::message::RawRecord;
use crate::patient::split_batch;

/// Read the schema table as text.
pub async fn read_schema(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read schema {}", path.display()))
}

/// Read a patient batch from a JSON document or a JSONL file.
pub async fn read_patients(path: &Path) -> anyhow::Result<Vec<RawRecord>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read patients {}", path.display()))?;
    let records = parse_patients(&text);
    tracing::debug!(path = %path.display(), records = records.len(), "Read patient batch");
    Ok(records)
}

/// Split input text into raw records.
///
/// The whole text is tried as one JSON document first; failing that, each
/// non-blank line is parsed on its own. A line that fails to parse stays in
/// the batch so it can be reported.
pub fn parse_patients(text: &str) -> Vec<RawRecord> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if let Ok(document) = serde_json::from_str(text) {
        return split_batch(document).into_iter().map(RawRecord::Json).collect();
    }

    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(document) => records.extend(split_batch(document).into_iter().map(RawRecord::Json)),
            Err(err) => {
                tracing::warn!(line = i + 1, error = %err, "Invalid patient line");
                records.push(RawRecord::Unparseable {
                    line: i + 1,
                    reason: err.to_string(),
                });
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(records: &[RawRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| match r {
                RawRecord::Json(v) => v["patient_id"].as_str().unwrap_or("?").to_string(),
                RawRecord::Unparseable { line, .. } => format!("line {line}"),
            })
            .collect()
    }

    #[test]
    fn test_parse_json_document() {
        let records = parse_patients(r#"{"patients": [{"patient_id": "a"}, {"patient_id": "b"}]}"#);
        assert_eq!(ids(&records), vec!["a", "b"]);

        let records = parse_patients(r#"[{"patient_id": "a"}]"#);
        assert_eq!(ids(&records), vec!["a"]);
    }

    /// Test JSONL input with a broken line in the middle.
    /// Expected: good lines kept in order, the broken line kept as unparseable.
    #[test]
    fn test_parse_jsonl_with_bad_line() {
        let text = "{\"patient_id\": \"a\"}\n{not json\n\n{\"patient_id\": \"c\"}\n";
        let records = parse_patients(text);
        assert_eq!(ids(&records), vec!["a", "line 2", "c"]);
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(parse_patients("  \n").is_empty());
    }

    #[tokio::test]
    async fn test_read_patients_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patients.jsonl");
        std::fs::write(&path, "{\"patient_id\": \"a\"}\n{\"patient_id\": \"b\"}\n").unwrap();
        let records = read_patients(&path).await.unwrap();
        assert_eq!(ids(&records), vec!["a", "b"]);

        assert!(read_patients(&dir.path().join("missing.json")).await.is_err());
    }
}
