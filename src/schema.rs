use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;
use crate::transform::{Transform, TransformParseError};

/// Default-value cell that makes an absent field a hard error.
pub const REQUIRED_SENTINEL: &str = "!required";

/// Rank slots emitted by `wide` when no count is given.
pub const DEFAULT_WIDE_SLOTS: usize = 3;

/// What to emit when a field's source is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    /// Leave the cell empty.
    Blank,
    Literal(String),
    /// Fail the patient (or the row, under the tall policy).
    Required,
}

impl DefaultValue {
    fn parse(cell: &str) -> Self {
        if cell.is_empty() {
            DefaultValue::Blank
        } else if cell.eq_ignore_ascii_case(REQUIRED_SENTINEL) {
            DefaultValue::Required
        } else {
            DefaultValue::Literal(cell.to_string())
        }
    }
}

/// Normalized payer attributes addressable with `@name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedAttr {
    Rank,
    RankLabel,
    CoverageType,
    PayerId,
    PlanName,
    PolicyNumber,
    EffectiveStart,
    EffectiveEnd,
}

impl DerivedAttr {
    fn parse(name: &str) -> Option<Self> {
        let attr = match name {
            "rank" => DerivedAttr::Rank,
            "rank_label" => DerivedAttr::RankLabel,
            "coverage_type" => DerivedAttr::CoverageType,
            "payer_id" => DerivedAttr::PayerId,
            "plan_name" => DerivedAttr::PlanName,
            "policy_number" => DerivedAttr::PolicyNumber,
            "effective_start" => DerivedAttr::EffectiveStart,
            "effective_end" => DerivedAttr::EffectiveEnd,
            _ => return None,
        };
        Some(attr)
    }
}

/// One locator inside a source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRef {
    /// Key in the row's own scope: the payer for payer-scoped fields, otherwise the patient.
    Own(String),
    /// `patient:key`, always resolved against demographics.
    Patient(String),
    /// `@attr`, a normalized payer attribute.
    Derived(DerivedAttr),
}

/// A `+`-separated part of a source path; its `|`-separated alternatives are
/// tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePart {
    pub text: String,
    pub alternatives: Vec<PathRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourcePath {
    pub raw: String,
    pub parts: Vec<SourcePart>,
}

impl SourcePath {
    fn parse(raw: &str, payer_scope: bool) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(SourcePath::default());
        }
        let mut parts = Vec::new();
        for text in raw.split('+').map(str::trim) {
            if text.is_empty() {
                return Err("empty '+' part".to_string());
            }
            let mut alternatives = Vec::new();
            for alt in text.split('|').map(str::trim) {
                alternatives.push(parse_path_ref(alt, payer_scope)?);
            }
            parts.push(SourcePart {
                text: text.to_string(),
                alternatives,
            });
        }
        Ok(SourcePath {
            raw: raw.to_string(),
            parts,
        })
    }
}

fn parse_path_ref(alt: &str, payer_scope: bool) -> Result<PathRef, String> {
    if alt.is_empty() {
        return Err("empty '|' alternative".to_string());
    }
    if let Some(name) = alt.strip_prefix('@') {
        if !payer_scope {
            return Err(format!("'@{name}' needs payer_scope"));
        }
        return DerivedAttr::parse(name)
            .map(PathRef::Derived)
            .ok_or_else(|| format!("unknown payer attribute '@{name}'"));
    }
    if let Some(key) = alt.strip_prefix("patient:") {
        let key = key.trim();
        if key.is_empty() {
            return Err("'patient:' needs a key".to_string());
        }
        return Ok(PathRef::Patient(key.to_string()));
    }
    Ok(PathRef::Own(alt.to_string()))
}

/// One row of the mapping definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub output_column: String,
    pub source_path: SourcePath,
    pub transform: Transform,
    pub default_value: DefaultValue,
    pub payer_scope: bool,
}

/// How payer-scoped fields turn into rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPolicy {
    /// One row per (patient, payer rank).
    Tall,
    /// One row per patient, payer fields repeated per rank slot.
    Wide { slots: usize },
}

impl Default for RowPolicy {
    fn default() -> Self {
        RowPolicy::Wide {
            slots: DEFAULT_WIDE_SLOTS,
        }
    }
}

impl FromStr for RowPolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidPolicy {
            value: s.to_string(),
        };
        let value = s.trim().to_ascii_lowercase();
        match value.split_once(':') {
            None if value == "tall" => Ok(RowPolicy::Tall),
            None if value == "wide" => Ok(RowPolicy::default()),
            Some(("wide", slots)) => match slots.trim().parse::<usize>() {
                Ok(slots) if slots > 0 => Ok(RowPolicy::Wide { slots }),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for RowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowPolicy::Tall => write!(f, "tall"),
            RowPolicy::Wide { slots } => write!(f, "wide:{slots}"),
        }
    }
}

/// Column name for a payer-scoped field under the wide policy.
pub fn wide_column(output_column: &str, slot: usize) -> String {
    format!("{output_column}_rank{slot}")
}

/// Ordered CSV header, after any wide expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pub columns: Vec<String>,
}

impl ColumnLayout {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A loaded, validated schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub fields: Vec<SchemaField>,
    pub policy: RowPolicy,
    layout: ColumnLayout,
}

impl Schema {
    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }
}

/// Column positions of the recognized schema headers.
#[derive(Debug, Default)]
struct HeaderIndex {
    output_column: Option<usize>,
    source_path: Option<usize>,
    transform: Option<usize>,
    transform_arg: Option<usize>,
    default_value: Option<usize>,
    payer_scope: Option<usize>,
    row_policy: Option<usize>,
}

impl HeaderIndex {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, SchemaError> {
        let mut index = HeaderIndex::default();
        for (i, header) in headers.iter().enumerate() {
            let slot = match normalize_header(header).as_str() {
                "output_column" | "schema_field" | "column" | "field" => &mut index.output_column,
                "source_path" | "source" | "json_path" | "path" => &mut index.source_path,
                "transform" => &mut index.transform,
                "transform_arg" | "argument" | "arg" | "format" => &mut index.transform_arg,
                "default_value" | "default" => &mut index.default_value,
                "payer_scope" | "payer_scoped" | "per_payer" => &mut index.payer_scope,
                "row_policy" | "policy" => &mut index.row_policy,
                _ => continue,
            };
            slot.get_or_insert(i);
        }
        if index.output_column.is_none() {
            return Err(SchemaError::MissingColumn {
                column: "output_column",
            });
        }
        if index.source_path.is_none() {
            return Err(SchemaError::MissingColumn {
                column: "source_path",
            });
        }
        Ok(index)
    }
}

fn normalize_header(header: &str) -> String {
    header
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "false" | "no" | "n" | "0" => Some(false),
        "true" | "yes" | "y" | "1" | "x" => Some(true),
        _ => None,
    }
}

/// Parse a schema table into an ordered field catalog.
///
/// `fallback_policy` applies when no row declares a `row_policy`.
pub fn load(source: &str, fallback_policy: RowPolicy) -> Result<Schema, SchemaError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(source.as_bytes());
    let index = HeaderIndex::from_headers(reader.headers()?)?;

    let mut fields: Vec<(usize, SchemaField)> = Vec::new();
    let mut declared_policy: Option<(String, RowPolicy)> = None;

    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let row = i + 2;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i)).map(str::trim).unwrap_or("");

        let output_column = cell(index.output_column);
        if output_column.is_empty() {
            return Err(SchemaError::EmptyOutputColumn { row });
        }

        let scope_text = cell(index.payer_scope);
        let payer_scope = parse_flag(scope_text).ok_or_else(|| SchemaError::InvalidFlag {
            column: output_column.to_string(),
            value: scope_text.to_string(),
        })?;

        // Separators may be whitespace, so the argument is not trimmed here.
        let arg = index
            .transform_arg
            .and_then(|i| record.get(i))
            .unwrap_or("");
        let transform_text = cell(index.transform);
        let transform = Transform::parse(transform_text, arg).map_err(|e| match e {
            TransformParseError::Unknown => SchemaError::UnknownTransform {
                column: output_column.to_string(),
                transform: transform_text.to_string(),
            },
            TransformParseError::InvalidArg(reason) => SchemaError::InvalidTransformArg {
                column: output_column.to_string(),
                reason,
            },
        })?;

        let path_text = cell(index.source_path);
        let source_path =
            SourcePath::parse(path_text, payer_scope).map_err(|reason| SchemaError::InvalidSourcePath {
                column: output_column.to_string(),
                path: path_text.to_string(),
                reason,
            })?;
        validate_field_shape(output_column, &source_path, &transform, payer_scope)?;

        let policy_text = cell(index.row_policy);
        if !policy_text.is_empty() {
            let policy: RowPolicy = policy_text.parse()?;
            match &declared_policy {
                Some((first, existing)) if *existing != policy => {
                    return Err(SchemaError::ConflictingPolicy {
                        first: first.clone(),
                        second: policy_text.to_string(),
                    });
                }
                Some(_) => {}
                None => declared_policy = Some((policy_text.to_string(), policy)),
            }
        }

        fields.push((
            row,
            SchemaField {
                output_column: output_column.to_string(),
                source_path,
                transform,
                default_value: DefaultValue::parse(cell(index.default_value)),
                payer_scope,
            },
        ));
    }

    if fields.is_empty() {
        return Err(SchemaError::Empty);
    }

    let policy = declared_policy.map_or(fallback_policy, |(_, policy)| policy);
    let layout = build_layout(&fields, policy)?;
    tracing::debug!(fields = fields.len(), columns = layout.len(), %policy, "Loaded schema");

    Ok(Schema {
        fields: fields.into_iter().map(|(_, field)| field).collect(),
        policy,
        layout,
    })
}

fn validate_field_shape(
    column: &str,
    path: &SourcePath,
    transform: &Transform,
    payer_scope: bool,
) -> Result<(), SchemaError> {
    let invalid_arg = |reason: &str| SchemaError::InvalidTransformArg {
        column: column.to_string(),
        reason: reason.to_string(),
    };
    if path.parts.len() > 1 && !transform.takes_many_parts() {
        return Err(SchemaError::InvalidSourcePath {
            column: column.to_string(),
            path: path.raw.clone(),
            reason: "only concat and classify accept '+' parts".to_string(),
        });
    }
    match transform {
        Transform::Concat { .. } if path.parts.len() < 2 => {
            Err(invalid_arg("concat needs at least two source parts"))
        }
        Transform::WhenPlanType { .. } if !payer_scope => {
            Err(invalid_arg("when_plan_type applies to payer-scoped fields"))
        }
        _ => Ok(()),
    }
}

fn build_layout(fields: &[(usize, SchemaField)], policy: RowPolicy) -> Result<ColumnLayout, SchemaError> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for (row, field) in fields {
        let expanded: Vec<String> = match policy {
            RowPolicy::Wide { slots } if field.payer_scope => {
                (1..=slots).map(|slot| wide_column(&field.output_column, slot)).collect()
            }
            _ => vec![field.output_column.clone()],
        };
        for column in expanded {
            if !seen.insert(column.clone()) {
                return Err(SchemaError::DuplicateOutputColumn { column, row: *row });
            }
            columns.push(column);
        }
    }
    Ok(ColumnLayout { columns })
}

/// Mock schema for testing
#[cfg(test)]
pub fn mock_schema(policy: RowPolicy) -> Schema {
    let source = "\
output_column,source_path,transform,transform_arg,default_value,payer_scope
patient_id,patient_id|patientId,,,,no
dob,dob,date,MM/DD/YYYY,,no
gender,gender,lookup,M=Male;F=Female,Unknown,no
plan_name,@plan_name,,,,yes
rank,@rank_label,,,,yes
";
    match load(source, policy) {
        Ok(schema) => schema,
        Err(e) => panic!("mock schema should load: {e}"),
    }
}
