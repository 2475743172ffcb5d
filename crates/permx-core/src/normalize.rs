//! Provider date and identifier normalization.
//!
//! Every function here is total: malformed input yields `None`, `0` or an
//! empty collection, never a panic.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::Value as JsonValue;

/// 1900-01-01T00:00:00.000Z
pub const MIN_SANE_MS: i64 = -2_208_988_800_000;
/// 2100-12-31T23:59:59.999Z
pub const MAX_SANE_MS: i64 = 4_133_980_799_999;

/// Marker appended to values cut down to fit a spreadsheet cell.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

const US_TIME_FORMATS: [&str; 4] = ["%I:%M %p", "%I:%M:%S %p", "%H:%M", "%H:%M:%S"];
const ISO_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

fn within_sane_range(ms: i64) -> Option<i64> {
    (MIN_SANE_MS..=MAX_SANE_MS).contains(&ms).then_some(ms)
}

/// Converts a provider date (epoch ms number, `MM/DD/YYYY`, or ISO-8601) to
/// epoch milliseconds. Zone-less dates are taken as UTC.
pub fn parse_provider_date(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(within_sane_range),
        JsonValue::String(s) => parse_date_str(s),
        _ => None,
    }
}

pub fn parse_date_str(input: &str) -> Option<i64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(within_sane_range);
    }
    if s.contains('/') {
        return parse_us_date(s);
    }
    parse_iso_date(s)
}

fn parse_us_date(s: &str) -> Option<i64> {
    let date_part = s.split_whitespace().next()?;
    let date = NaiveDate::parse_from_str(date_part, "%m/%d/%Y").ok()?;
    let rest = s[date_part.len()..].trim();
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)?;
    let time = if rest.is_empty() {
        midnight
    } else {
        US_TIME_FORMATS
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(rest, f).ok())
            .unwrap_or(midnight)
    };
    within_sane_range(date.and_time(time).and_utc().timestamp_millis())
}

fn parse_iso_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return within_sane_range(dt.timestamp_millis());
    }
    if let Some(dt) = ISO_DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
    {
        return within_sane_range(dt.and_utc().timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    within_sane_range(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

/// `0` stands for "unknown" in canonical records.
pub fn to_canonical_ms(value: &JsonValue) -> i64 {
    parse_provider_date(value).unwrap_or(0)
}

/// Expands a caller-supplied day to the first or last millisecond of that UTC day.
pub fn parse_window_bound(input: &str, bound: Bound) -> Option<i64> {
    let s = input.trim();
    let date = match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        Ok(date) => date,
        Err(_) => DateTime::from_timestamp_millis(parse_date_str(s)?)?.date_naive(),
    };
    let time = match bound {
        Bound::Start => NaiveTime::from_hms_milli_opt(0, 0, 0, 0)?,
        Bound::End => NaiveTime::from_hms_milli_opt(23, 59, 59, 999)?,
    };
    within_sane_range(date.and_time(time).and_utc().timestamp_millis())
}

/// Renders canonical epoch ms as `YYYY-MM-DD`, or empty for unknown.
pub fn format_canonical_date(ms: i64) -> String {
    if ms == 0 {
        return String::new();
    }
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn case_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]{2,}\d{4}-\d+$").expect("valid case number pattern"))
}

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid markup pattern"))
}

pub fn is_case_number(candidate: &str) -> bool {
    case_number_pattern().is_match(candidate)
}

/// Splits a multi-valued case-number field on `,` `;` `(` `)` and keeps the
/// fragments that look like case numbers, in order, without duplicates.
pub fn extract_case_numbers(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for fragment in raw.split([',', ';', '(', ')']) {
        let fragment = fragment.trim();
        if is_case_number(fragment) && !out.iter().any(|seen| seen == fragment) {
            out.push(fragment.to_string());
        }
    }
    out
}

/// Percent-encodes an identifier for use as a URL path segment.
pub fn encode_identifier(id: &str) -> String {
    urlencoding::encode(id.trim()).into_owned()
}

/// Removes HTML tags, decodes the common entities and collapses whitespace.
pub fn strip_markup(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return input.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    let without_tags = markup_pattern().replace_all(input, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cuts `text` to at most `limit` characters, ending with `marker` when cut.
pub fn truncate_chars(text: &str, limit: usize, marker: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(marker.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(marker);
    out
}

/// Coerces an arbitrary JSON value to a cell string. Scalar arrays are joined
/// with `"; "`; objects and nested arrays become compact JSON.
pub fn value_to_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(items) if items.iter().all(|v| !v.is_array() && !v.is_object()) => items
            .iter()
            .map(value_to_cell)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Reads the first present, non-empty attribute among `keys` as a trimmed string.
pub fn attr_str(attrs: &JsonValue, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| attrs.get(*k))
        .map(value_to_cell)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

/// Reads the first parseable date among `keys`, or `0`.
pub fn attr_date(attrs: &JsonValue, keys: &[&str]) -> i64 {
    keys.iter()
        .filter_map(|k| attrs.get(*k))
        .find_map(parse_provider_date)
        .unwrap_or(0)
}
