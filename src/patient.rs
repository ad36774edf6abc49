use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::classifier::{Classifier, ClassifierContext};
use crate::error::MalformedRecordError;
use crate::payer::{CoverageType, EffectiveDates, Payer, parse_ordinal};
use crate::transform::parse_date;

/// Keys under which payer data may appear, at any depth.
const PAYER_CONTAINER_KEYS: &[&str] = &["payers", "insurances", "coverages", "insurance", "coverage", "payer"];

/// Keys that mark an object as a single payer record.
const PAYER_MARKER_KEYS: &[&str] = &[
    "payer_id",
    "payerId",
    "payer_name",
    "payerName",
    "issuer",
    "insuredParty",
    "plan_name",
    "planName",
    "policy_number",
    "policyNumber",
    "accountNumber",
    "memberId",
    "coverageId",
    "payPlanType",
    "coverage_type",
    "coverageType",
    "payerRank",
    "priority_hint",
    "effective_dates",
    "effectiveDate",
];

const PATIENT_ID_KEYS: &[&str] = &["patient_id", "patientId"];
const NESTED_DEMOGRAPHIC_KEYS: &[&str] = &["demographics", "patient"];

const PAYER_ID_KEYS: &[&str] = &["payer_id", "payerId", "issuer.issuerId", "id"];
const PLAN_NAME_KEYS: &[&str] = &["plan_name", "planName", "issuer.planName", "issuer.issuerName"];
const POLICY_NUMBER_KEYS: &[&str] = &["policy_number", "policyNumber", "accountNumber", "memberId", "coverageId"];
const START_DATE_KEYS: &[&str] = &["effective_dates.start", "effectiveDate", "issuer.planEffectiveDate", "startDate"];
const END_DATE_KEYS: &[&str] = &["effective_dates.end", "expirationDate", "issuer.planExpirationDate", "endDate"];
const COVERAGE_TYPE_KEYS: &[&str] = &["coverage_type", "coverageType", "payPlanType", "planType", "type"];
const PRIORITY_KEYS: &[&str] = &["priority_hint", "priorityHint", "payerRank", "rank", "priority"];

/// A source attribute. Absence is distinct from an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Absent,
    Present(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Absent => None,
            FieldValue::Present(s) => Some(s),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, FieldValue::Present(_))
    }
}

static ABSENT: FieldValue = FieldValue::Absent;

/// JSON flattened to `a.b[0].c` keys. Nulls are kept as explicit `Absent` markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, FieldValue>);

impl Attributes {
    pub fn from_json(value: &Value) -> Self {
        let mut attributes = Attributes::default();
        flatten_into(&mut attributes, "", value, false);
        attributes
    }

    /// Missing keys read as `Absent`.
    pub fn get(&self, key: &str) -> &FieldValue {
        self.0.get(key).unwrap_or(&ABSENT)
    }

    /// First of `keys` holding a non-empty value.
    pub fn first_present(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.get(k).as_str())
            .find(|v| !v.trim().is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert_if_missing(&mut self, key: String, value: FieldValue) {
        self.0.entry(key).or_insert(value);
    }
}

fn scalar(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Null => Some(FieldValue::Absent),
        Value::String(s) => Some(FieldValue::Present(s.clone())),
        Value::Number(n) => Some(FieldValue::Present(n.to_string())),
        Value::Bool(b) => Some(FieldValue::Present(b.to_string())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn is_payer_container(key: &str) -> bool {
    PAYER_CONTAINER_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

fn flatten_into(out: &mut Attributes, prefix: &str, value: &Value, skip_payers: bool) {
    if let Some(v) = scalar(value) {
        if !prefix.is_empty() {
            out.insert_if_missing(prefix.to_string(), v);
        }
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if skip_payers && is_payer_container(key) {
                    continue;
                }
                flatten_into(out, &join_key(prefix, key), child, skip_payers);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(out, &format!("{prefix}[{i}]"), child, skip_payers);
            }
        }
        _ => {}
    }
}

/// Root normalized entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
    pub patient_id: String,
    pub demographics: Attributes,
    /// Discovery order; not authoritative for rank.
    pub payers: Vec<Payer>,
}

/// Split one input document into patient records.
///
/// Accepts a top-level array, an object with a `patients` array, or a single patient.
pub fn split_batch(document: Value) -> Vec<Value> {
    match document {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("patients") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("patients".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        other => vec![other],
    }
}

/// Parse one raw patient record into the internal patient/payer graph.
pub fn normalize(
    raw: &Value,
    index: usize,
    classifier: Option<&dyn Classifier>,
) -> Result<Patient, MalformedRecordError> {
    let malformed = |reason: &str| MalformedRecordError {
        index,
        reason: reason.to_string(),
    };
    let Value::Object(root) = raw else {
        return Err(malformed("record is not a JSON object"));
    };

    let patient_id = find_patient_id(root).ok_or_else(|| malformed("missing patient_id"))?;

    let mut demographics = Attributes::default();
    flatten_into(&mut demographics, "", raw, true);
    for key in NESTED_DEMOGRAPHIC_KEYS {
        if let Some(nested @ Value::Object(_)) = root.get(*key) {
            flatten_into(&mut demographics, "", nested, true);
        }
    }

    let mut found = Vec::new();
    collect_payers(raw, &mut found);
    let payers = found
        .into_iter()
        .enumerate()
        .map(|(i, (value, key))| normalize_payer(value, key.as_deref(), i, classifier))
        .collect::<Vec<_>>();

    tracing::debug!(
        patient_id = %patient_id,
        payers = payers.len(),
        attributes = demographics.len(),
        "Normalized patient record"
    );

    Ok(Patient {
        patient_id,
        demographics,
        payers,
    })
}

fn find_patient_id(root: &Map<String, Value>) -> Option<String> {
    let nested = NESTED_DEMOGRAPHIC_KEYS
        .iter()
        .filter_map(|k| root.get(*k).and_then(Value::as_object));
    std::iter::once(root)
        .chain(nested)
        .flat_map(|obj| PATIENT_ID_KEYS.iter().filter_map(move |k| obj.get(*k)))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn looks_like_payer(map: &Map<String, Value>) -> bool {
    PAYER_MARKER_KEYS.iter().any(|k| map.contains_key(*k))
}

/// Walk the record and collect payer objects with their container key, if keyed.
fn collect_payers<'a>(value: &'a Value, out: &mut Vec<(&'a Value, Option<String>)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if is_payer_container(key) {
                    extract_container(child, out);
                } else {
                    collect_payers(child, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_payers(item, out)),
        _ => {}
    }
}

fn extract_container<'a>(value: &'a Value, out: &mut Vec<(&'a Value, Option<String>)>) {
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(map) if looks_like_payer(map) || !contains_container(map) => {
                        out.push((item, None));
                    }
                    Value::Object(_) => collect_payers(item, out),
                    _ => {}
                }
            }
        }
        Value::Object(map) if looks_like_payer(map) => out.push((value, None)),
        Value::Object(map) if contains_container(map) => collect_payers(value, out),
        Value::Object(map) if !map.is_empty() && map.values().all(Value::is_object) => {
            for (key, child) in map {
                out.push((child, Some(key.clone())));
            }
        }
        Value::Object(map) if !map.is_empty() => out.push((value, None)),
        _ => {}
    }
}

fn contains_container(map: &Map<String, Value>) -> bool {
    map.keys().any(|k| is_payer_container(k))
}

fn normalize_payer(
    value: &Value,
    container_key: Option<&str>,
    source_index: usize,
    classifier: Option<&dyn Classifier>,
) -> Payer {
    let attributes = Attributes::from_json(value);
    let owned = |keys: &[&str]| attributes.first_present(keys).map(str::to_string);

    let key_rank = container_key.and_then(parse_ordinal);
    let priority_hint = attributes
        .first_present(PRIORITY_KEYS)
        .and_then(parse_ordinal)
        .or(key_rank);

    let coverage_text = owned(COVERAGE_TYPE_KEYS).or_else(|| match (container_key, key_rank) {
        (Some(key), None) => Some(key.to_string()),
        _ => None,
    });
    let coverage_type = coverage_text
        .as_deref()
        .map(|text| classify_coverage(text, owned(PLAN_NAME_KEYS).as_deref(), classifier))
        .unwrap_or(CoverageType::Other);

    Payer {
        payer_id: owned(PAYER_ID_KEYS),
        plan_name: owned(PLAN_NAME_KEYS),
        policy_number: owned(POLICY_NUMBER_KEYS),
        effective_dates: EffectiveDates {
            start: attributes.first_present(START_DATE_KEYS).and_then(|d| parse_date(d, None)),
            end: attributes.first_present(END_DATE_KEYS).and_then(|d| parse_date(d, None)),
        },
        coverage_type,
        coverage_text,
        priority_hint,
        rank: None,
        attributes,
        source_index,
    }
}

/// Keyword rules first; the classifier only sees text the rules cannot place.
fn classify_coverage(text: &str, plan_name: Option<&str>, classifier: Option<&dyn Classifier>) -> CoverageType {
    if let Some(coverage) = CoverageType::from_keywords(text) {
        return coverage;
    }
    let Some(classifier) = classifier else {
        return CoverageType::Other;
    };
    let mut context = ClassifierContext::new();
    context.insert("coverage_type".to_string(), text.to_string());
    if let Some(plan) = plan_name {
        context.insert("plan_name".to_string(), plan.to_string());
    }
    match classifier.classify(&context) {
        Ok(Some(answer)) => CoverageType::from_keywords(&answer).unwrap_or(CoverageType::Other),
        Ok(None) => CoverageType::Other,
        Err(e) => {
            tracing::warn!(error = %e, "Coverage classification failed, using 'other'");
            CoverageType::Other
        }
    }
}

/// Mock patient record for testing
#[cfg(test)]
pub fn mock_patient_json() -> Value {
    serde_json::json!({
        "patientId": "P001",
        "coverageId": "ROOT-COV",
        "dob": "03/04/1990",
        "gender": "F",
        "middleName": null,
        "nickname": "",
        "address": { "city": "Springfield", "state": "IL" },
        "payers": [
            {
                "payerRank": null,
                "payPlanType": "Commercial PPO",
                "accountNumber": "ACC-200",
                "issuer": {
                    "issuerName": "Blue Shield",
                    "group": 4411,
                    "planEffectiveDate": "2020-01-01"
                },
                "insuredParty": { "firstName": "Jane", "lastName": "Doe" }
            },
            {
                "payPlanType": "Medicare Part B",
                "accountNumber": "1EG4-TE5-MK72",
                "coverageId": "MCR-1",
                "issuer": { "issuerName": "Medicare", "planEffectiveDate": "2021-05-01" }
            }
        ]
    })
}
