use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

use crate::error::RankingError;
use crate::patient::Attributes;

/// Coverage category, in coordination-of-benefits precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoverageType {
    Government,
    Group,
    Individual,
    Other,
}

const GOVERNMENT_KEYWORDS: &[&str] = &["medicare", "medicaid", "tricare", "champva", "government", "veteran"];
const GROUP_KEYWORDS: &[&str] = &["group", "employer", "commercial", "managed", "hmo", "ppo", "epo"];
const INDIVIDUAL_KEYWORDS: &[&str] = &["individual", "self", "private", "marketplace", "exchange"];

impl CoverageType {
    /// Classify free text by keyword, `None` when nothing matches.
    pub fn from_keywords(text: &str) -> Option<Self> {
        let text = text.to_lowercase();
        let hit = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));
        if hit(GOVERNMENT_KEYWORDS) {
            Some(CoverageType::Government)
        } else if hit(GROUP_KEYWORDS) {
            Some(CoverageType::Group)
        } else if hit(INDIVIDUAL_KEYWORDS) {
            Some(CoverageType::Individual)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageType::Government => "government",
            CoverageType::Group => "group",
            CoverageType::Individual => "individual",
            CoverageType::Other => "other",
        }
    }
}

impl fmt::Display for CoverageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveDates {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// One insurance coverage record attached to a patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payer {
    pub payer_id: Option<String>,
    pub plan_name: Option<String>,
    pub policy_number: Option<String>,
    pub effective_dates: EffectiveDates,
    pub coverage_type: CoverageType,
    /// Raw plan/coverage type text as found in the source.
    pub coverage_text: Option<String>,
    pub priority_hint: Option<u32>,
    /// Set by [`rank`]; 1 is Primary.
    pub rank: Option<u32>,
    /// Flattened source object.
    pub attributes: Attributes,
    /// Discovery order within the patient record.
    pub source_index: usize,
}

/// Parse `1`, `"2"`, `primary`, `Secondary`, ...
pub fn parse_ordinal(text: &str) -> Option<u32> {
    let text = text.trim().to_lowercase();
    if let Ok(n) = text.parse::<u32>() {
        return (n > 0).then_some(n);
    }
    match text.as_str() {
        "primary" | "first" => Some(1),
        "secondary" | "second" => Some(2),
        "tertiary" | "third" => Some(3),
        "quaternary" | "fourth" => Some(4),
        _ => None,
    }
}

/// Claim-form label for a rank.
pub fn rank_label(rank: u32) -> String {
    match rank {
        1 => "Primary".to_string(),
        2 => "Secondary".to_string(),
        3 => "Tertiary".to_string(),
        4 => "Quaternary".to_string(),
        n => format!("Rank {n}"),
    }
}

fn precedence(a: &Payer, b: &Payer) -> Ordering {
    // Hinted payers first, ascending by hint.
    let by_hint = match (a.priority_hint, b.priority_hint) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    // Undated coverage sorts after dated coverage.
    let by_start = match (a.effective_dates.start, b.effective_dates.start) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_hint
        .then(a.coverage_type.cmp(&b.coverage_type))
        .then(by_start)
        .then(a.source_index.cmp(&b.source_index))
}

/// Order a patient's payers and assign contiguous ranks starting at 1.
///
/// Identical payers are kept and ordered by input position.
pub fn rank(patient_id: &str, payers: &[Payer]) -> Result<Vec<Payer>, RankingError> {
    if payers.is_empty() {
        return Err(RankingError {
            patient_id: patient_id.to_string(),
        });
    }
    let mut ranked = payers.to_vec();
    ranked.sort_by(precedence);
    for (i, payer) in ranked.iter_mut().enumerate() {
        payer.rank = Some(i as u32 + 1);
    }
    tracing::debug!(patient_id, payers = ranked.len(), "Ranked payers");
    Ok(ranked)
}

/// Mock payer for testing
#[cfg(test)]
pub fn mock_payer(source_index: usize, coverage_type: CoverageType) -> Payer {
    Payer {
        payer_id: Some(format!("payer{source_index}")),
        plan_name: Some(format!("Plan {source_index}")),
        policy_number: Some(format!("POL{source_index}")),
        effective_dates: EffectiveDates::default(),
        coverage_type,
        coverage_text: Some(coverage_type.to_string()),
        priority_hint: None,
        rank: None,
        attributes: Attributes::default(),
        source_index,
    }
}
