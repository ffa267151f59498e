//! Pure normalization helpers: domain, ZIP, timestamps, numbers and the row content hash.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use relml_core::Domain;
use relml_storage::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZipOutcome {
    Blank,
    Valid(String),
    /// Normalizes to `00000`.
    Invalid,
}

/// Keep digits only, take the first five, left-pad with zeros.
pub fn normalize_zip(raw: &str) -> ZipOutcome {
    if raw.trim().is_empty() {
        return ZipOutcome::Blank;
    }
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).take(5).collect();
    let padded = format!("{digits:0>5}");
    if padded == "00000" {
        ZipOutcome::Invalid
    } else {
        ZipOutcome::Valid(padded)
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// RFC 3339 with `Z` or an offset; naive values are taken as UTC. Precision stops at
/// microseconds, the resolution the database stores.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_exact(raw).map(|at| at.trunc_subsecs(6))
}

fn parse_timestamp_exact(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let iso = match trimmed.as_bytes().get(10) {
        Some(b' ') if trimmed.as_bytes().get(4) == Some(&b'-') => {
            format!("{}T{}", &trimmed[..10], &trimmed[11..])
        }
        _ => trimmed.to_string(),
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&iso) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&iso, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Currency symbols and thousands separators are dropped.
pub fn parse_decimal(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then(|| value.to_string())
}

pub fn parse_integer(raw: &str) -> Option<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if let Ok(value) = cleaned.parse::<i64>() {
        return Some(value);
    }
    let value: f64 = cleaned.parse().ok()?;
    (value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64)
        .then_some(value as i64)
}

pub fn domain_from_property_type(raw: &str) -> Option<Domain> {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if lowered.contains("rent") || lowered.contains("lease") {
        Some(Domain::Rental)
    } else {
        Some(Domain::Sale)
    }
}

/// First path component naming a rental/lease or sale data set wins.
pub fn domain_from_path(path: &Path) -> Option<Domain> {
    path.components().find_map(|component| {
        let part = component.as_os_str().to_string_lossy().to_ascii_lowercase();
        if part.contains("rental") || part.contains("lease") {
            Some(Domain::Rental)
        } else if part.contains("sale") {
            Some(Domain::Sale)
        } else {
            None
        }
    })
}

/// SHA-256 over the sorted `(column, value)` pairs, so input column order does not matter.
pub fn normalized_row_hash(values: &BTreeMap<String, String>) -> String {
    let mut canonical = String::new();
    for (column, value) in values {
        canonical.push_str(column);
        canonical.push('\u{1f}');
        canonical.push_str(value);
        canonical.push('\u{1e}');
    }
    sha256_hex(canonical.as_bytes())
}
