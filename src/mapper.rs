use std::collections::BTreeMap;

use crate::classifier::{Classifier, ClassifierContext};
use crate::error::MappingError;
use crate::patient::{FieldValue, Patient};
use crate::payer::{Payer, rank_label};
use crate::schema::{DefaultValue, DerivedAttr, PathRef, RowPolicy, Schema, SchemaField, SourcePart, wide_column};
use crate::transform::{DEFAULT_DATE_FORMAT, Transform, lookup_code, reformat_date};

/// One emitted CSV record. Written once by the mapper, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub patient_id: String,
    /// Payer rank of the row under the tall policy.
    pub rank: Option<u32>,
    pub fields: BTreeMap<String, String>,
}

/// A tall-policy row that failed on its own payer's fields.
#[derive(Debug, Clone)]
pub struct RowError {
    pub rank: u32,
    pub error: MappingError,
}

/// Everything the mapper produced for one patient.
#[derive(Debug, Clone)]
pub struct MappedPatient {
    pub patient_id: String,
    pub rows: Vec<OutputRow>,
    pub row_errors: Vec<RowError>,
}

/// Where a field is being resolved: always a patient, plus the row's payer for
/// payer-scoped fields.
#[derive(Clone, Copy)]
struct Scope<'p> {
    patient: &'p Patient,
    payer: Option<&'p Payer>,
}

/// Resolves schema fields against a normalized patient and its ranked payers.
pub struct Mapper<'a> {
    schema: &'a Schema,
    classifier: Option<&'a dyn Classifier>,
}

impl<'a> Mapper<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Option<&'a dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Map one patient to output rows under the schema's row policy.
    ///
    /// `ranked` must be in rank order, as returned by [`crate::payer::rank`].
    pub fn map(&self, patient: &Patient, ranked: &[Payer]) -> Result<MappedPatient, MappingError> {
        let mut mapped = MappedPatient {
            patient_id: patient.patient_id.clone(),
            rows: Vec::new(),
            row_errors: Vec::new(),
        };
        let patient_scope = Scope { patient, payer: None };

        match self.schema.policy {
            RowPolicy::Wide { slots } => {
                let mut fields = BTreeMap::new();
                for field in &self.schema.fields {
                    if !field.payer_scope {
                        fields.insert(field.output_column.clone(), self.resolve(field, patient_scope)?);
                        continue;
                    }
                    for slot in 1..=slots {
                        let value = match ranked.get(slot - 1) {
                            Some(payer) => self.resolve(field, Scope {
                                patient,
                                payer: Some(payer),
                            })?,
                            None => empty_slot_value(&field.default_value),
                        };
                        fields.insert(wide_column(&field.output_column, slot), value);
                    }
                }
                mapped.rows.push(OutputRow {
                    patient_id: patient.patient_id.clone(),
                    rank: None,
                    fields,
                });
            }
            RowPolicy::Tall => {
                let mut shared = BTreeMap::new();
                for field in self.schema.fields.iter().filter(|f| !f.payer_scope) {
                    shared.insert(field.output_column.clone(), self.resolve(field, patient_scope)?);
                }
                for (i, payer) in ranked.iter().enumerate() {
                    let rank = payer.rank.unwrap_or(i as u32 + 1);
                    match self.payer_fields(patient, payer) {
                        Ok(payer_fields) => {
                            let mut fields = shared.clone();
                            fields.extend(payer_fields);
                            mapped.rows.push(OutputRow {
                                patient_id: patient.patient_id.clone(),
                                rank: Some(rank),
                                fields,
                            });
                        }
                        Err(error) => mapped.row_errors.push(RowError { rank, error }),
                    }
                }
            }
        }
        Ok(mapped)
    }

    fn payer_fields(&self, patient: &Patient, payer: &Payer) -> Result<Vec<(String, String)>, MappingError> {
        let scope = Scope {
            patient,
            payer: Some(payer),
        };
        self.schema
            .fields
            .iter()
            .filter(|f| f.payer_scope)
            .map(|f| Ok((f.output_column.clone(), self.resolve(f, scope)?)))
            .collect()
    }

    /// Resolve, transform, then apply the default for one field.
    fn resolve(&self, field: &SchemaField, scope: Scope<'_>) -> Result<String, MappingError> {
        let patient_id = &scope.patient.patient_id;
        let parts: Vec<FieldValue> = field.source_path.parts.iter().map(|p| resolve_part(p, scope)).collect();
        let first = parts.first().cloned().unwrap_or(FieldValue::Absent);

        let value = match &field.transform {
            Transform::Identity => first,
            Transform::DateReformat { from, to } => match first {
                FieldValue::Present(raw) if !raw.trim().is_empty() => {
                    match reformat_date(&raw, from.as_deref(), to) {
                        Some(date) => FieldValue::Present(date),
                        None => {
                            return Err(MappingError::InvalidDate {
                                field: field.output_column.clone(),
                                patient_id: patient_id.clone(),
                                value: raw,
                            });
                        }
                    }
                }
                other => other,
            },
            Transform::Lookup(table) => match first {
                FieldValue::Present(code) if !code.is_empty() => match lookup_code(table, &code) {
                    Some(display) => FieldValue::Present(display.to_string()),
                    None => match &field.default_value {
                        DefaultValue::Literal(fallback) => FieldValue::Present(fallback.clone()),
                        _ => {
                            return Err(MappingError::UnknownCode {
                                field: field.output_column.clone(),
                                patient_id: patient_id.clone(),
                                code,
                            });
                        }
                    },
                },
                other => other,
            },
            Transform::Concat { separator } => {
                if parts.iter().any(FieldValue::is_present) {
                    let joined = parts
                        .iter()
                        .filter_map(FieldValue::as_str)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(separator);
                    FieldValue::Present(joined)
                } else {
                    FieldValue::Absent
                }
            }
            Transform::Classify => self.classify(field, &parts),
            Transform::WhenPlanType { needle } => {
                let matches = scope
                    .payer
                    .and_then(|p| p.coverage_text.as_deref())
                    .is_some_and(|text| text.to_lowercase().contains(needle.as_str()));
                if matches { first } else { FieldValue::Absent }
            }
        };

        match value {
            FieldValue::Present(s) => Ok(s),
            FieldValue::Absent => match &field.default_value {
                DefaultValue::Blank => Ok(String::new()),
                DefaultValue::Literal(s) => Ok(s.clone()),
                DefaultValue::Required => Err(MappingError::MissingField {
                    field: field.output_column.clone(),
                    patient_id: patient_id.clone(),
                }),
            },
        }
    }

    fn classify(&self, field: &SchemaField, parts: &[FieldValue]) -> FieldValue {
        let context: ClassifierContext = field
            .source_path
            .parts
            .iter()
            .zip(parts)
            .filter_map(|(part, value)| value.as_str().map(|v| (part.text.clone(), v.to_string())))
            .collect();
        let Some(classifier) = self.classifier else {
            return FieldValue::Absent;
        };
        if context.is_empty() {
            return FieldValue::Absent;
        }
        match classifier.classify(&context) {
            Ok(Some(answer)) => FieldValue::Present(answer),
            Ok(None) => FieldValue::Absent,
            Err(e) => {
                tracing::warn!(column = %field.output_column, error = %e, "Classifier gave no answer, using default");
                FieldValue::Absent
            }
        }
    }
}

/// A wide slot past the last payer. A required default cannot be honored
/// without a payer, so the slot stays blank.
fn empty_slot_value(default: &DefaultValue) -> String {
    match default {
        DefaultValue::Literal(s) => s.clone(),
        DefaultValue::Blank | DefaultValue::Required => String::new(),
    }
}

fn resolve_part(part: &SourcePart, scope: Scope<'_>) -> FieldValue {
    part.alternatives
        .iter()
        .map(|alt| resolve_ref(alt, scope))
        .find(FieldValue::is_present)
        .unwrap_or(FieldValue::Absent)
}

fn resolve_ref(path: &PathRef, scope: Scope<'_>) -> FieldValue {
    match path {
        PathRef::Own(key) => match scope.payer {
            Some(payer) => payer.attributes.get(key).clone(),
            None => scope.patient.demographics.get(key).clone(),
        },
        PathRef::Patient(key) => scope.patient.demographics.get(key).clone(),
        PathRef::Derived(attr) => scope.payer.map_or(FieldValue::Absent, |p| derived(p, *attr)),
    }
}

fn derived(payer: &Payer, attr: DerivedAttr) -> FieldValue {
    let value = match attr {
        DerivedAttr::Rank => payer.rank.map(|r| r.to_string()),
        DerivedAttr::RankLabel => payer.rank.map(rank_label),
        DerivedAttr::CoverageType => Some(payer.coverage_type.to_string()),
        DerivedAttr::PayerId => payer.payer_id.clone(),
        DerivedAttr::PlanName => payer.plan_name.clone(),
        DerivedAttr::PolicyNumber => payer.policy_number.clone(),
        DerivedAttr::EffectiveStart => payer
            .effective_dates
            .start
            .map(|d| d.format(DEFAULT_DATE_FORMAT).to_string()),
        DerivedAttr::EffectiveEnd => payer
            .effective_dates
            .end
            .map(|d| d.format(DEFAULT_DATE_FORMAT).to_string()),
    };
    value.map_or(FieldValue::Absent, FieldValue::Present)
}
