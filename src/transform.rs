use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Target format for the `date` transform when the schema names none.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Source formats tried, in order, when a date has no declared format.
const FALLBACK_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y/%m/%d", "%Y%m%d"];

const FALLBACK_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// How a resolved source value becomes an output cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// Reparse a date and print it in `to`. `from` of `None` tries the common formats.
    DateReformat { from: Option<String>, to: String },
    /// Code to display-value substitution.
    Lookup(BTreeMap<String, String>),
    /// Join every present, non-empty part.
    Concat { separator: String },
    /// Delegate the decision to the configured classifier.
    Classify,
    /// Keep the value only when the payer's plan type text contains `needle`.
    WhenPlanType { needle: String },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransformParseError {
    Unknown,
    InvalidArg(String),
}

impl Transform {
    /// Parse a transform kind and its argument as written in the schema table.
    pub(crate) fn parse(kind: &str, arg: &str) -> Result<Self, TransformParseError> {
        let kind = kind.trim().to_ascii_lowercase();
        match kind.as_str() {
            "" | "identity" | "copy" => Ok(Transform::Identity),
            "date" | "date_reformat" => parse_date_arg(arg.trim()),
            "lookup" | "code_lookup" => parse_lookup_table(arg).map(Transform::Lookup),
            "concat" | "concatenate" => Ok(Transform::Concat {
                separator: if arg.is_empty() { " ".to_string() } else { arg.to_string() },
            }),
            "classify" => Ok(Transform::Classify),
            "when_plan_type" => {
                let needle = arg.trim().to_lowercase();
                if needle.is_empty() {
                    return Err(TransformParseError::InvalidArg(
                        "when_plan_type needs a plan type to match".to_string(),
                    ));
                }
                Ok(Transform::WhenPlanType { needle })
            }
            _ => Err(TransformParseError::Unknown),
        }
    }

    /// Whether the transform consumes several source parts.
    pub fn takes_many_parts(&self) -> bool {
        matches!(self, Transform::Concat { .. } | Transform::Classify)
    }
}

fn parse_date_arg(arg: &str) -> Result<Transform, TransformParseError> {
    let (from, to) = match arg.split_once("->") {
        Some((from, to)) => (from.trim(), to.trim()),
        None => (arg, ""),
    };
    let from = if from.is_empty() {
        None
    } else {
        Some(to_chrono_format(from)?)
    };
    let to = if to.is_empty() {
        DEFAULT_DATE_FORMAT.to_string()
    } else {
        to_chrono_format(to)?
    };
    // A date carries no time or zone, so those specifiers fail when printed.
    let sample = NaiveDate::from_ymd_opt(2000, 1, 31).unwrap_or_default();
    if format_date(sample, &to).is_none() {
        return Err(TransformParseError::InvalidArg(format!(
            "'{to}' cannot print a plain date"
        )));
    }
    Ok(Transform::DateReformat { from, to })
}

/// Accept either a chrono format string or the `YYYY`/`MM`/`DD` spelling.
fn to_chrono_format(pattern: &str) -> Result<String, TransformParseError> {
    let format = if pattern.contains('%') {
        pattern.to_string()
    } else {
        pattern
            .replace("YYYY", "%Y")
            .replace("YY", "%y")
            .replace("MM", "%m")
            .replace("DD", "%d")
    };
    if !format.contains('%') || StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
        return Err(TransformParseError::InvalidArg(format!(
            "'{pattern}' is not a date format"
        )));
    }
    Ok(format)
}

fn parse_lookup_table(arg: &str) -> Result<BTreeMap<String, String>, TransformParseError> {
    let mut table = BTreeMap::new();
    for entry in arg.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((code, display)) = entry.split_once('=') else {
            return Err(TransformParseError::InvalidArg(format!(
                "lookup entry '{entry}' is not code=value"
            )));
        };
        table.insert(code.trim().to_string(), display.trim().to_string());
    }
    if table.is_empty() {
        return Err(TransformParseError::InvalidArg(
            "lookup table is empty".to_string(),
        ));
    }
    Ok(table)
}

/// Parse a date with the explicit format, or with the fallback formats when none is given.
pub fn parse_date(value: &str, format: Option<&str>) -> Option<NaiveDate> {
    let value = value.trim();
    if let Some(format) = format {
        return NaiveDate::parse_from_str(value, format).ok();
    }
    FALLBACK_DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
        .or_else(|| {
            FALLBACK_DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
}

/// Reformat a date string, or `None` when it does not parse.
pub fn reformat_date(value: &str, from: Option<&str>, to: &str) -> Option<String> {
    parse_date(value, from).and_then(|date| format_date(date, to))
}

/// Print a date, or `None` when the format needs fields a date does not have.
fn format_date(date: NaiveDate, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format)).ok()?;
    Some(out)
}

/// Exact match first, then a case-insensitive one.
pub fn lookup_code<'a>(table: &'a BTreeMap<String, String>, code: &str) -> Option<&'a str> {
    let code = code.trim();
    table.get(code).map(String::as_str).or_else(|| {
        table
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(code))
            .map(|(_, v)| v.as_str())
    })
}
