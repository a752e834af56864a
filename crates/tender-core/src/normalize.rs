//! Field normalization for loosely-typed upstream values.
//!
//! A single upstream field can arrive as a plain scalar, an empty container,
//! a one-element array wrapping the real value, a string that is itself a
//! one-element JSON array literal, or a string with `\/`-escaped slashes.
//! Every shape collapses to one clean string here; nothing in this module
//! fails; malformed input degrades to a best-effort string cast.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y%m%d%H%M%S",
    "%Y%m%d%H%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

/// Collapse one raw field value to a string. `null` is the only input that
/// yields `None`; empty containers yield `Some("")`.
pub fn normalize_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(normalize_str(s)),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => match items.as_slice() {
            [] => Some(String::new()),
            [single] => normalize_value(single).or_else(|| Some(String::new())),
            _ => Some(unescape_slashes(&value.to_string())),
        },
        JsonValue::Object(map) if map.is_empty() => Some(String::new()),
        JsonValue::Object(_) => Some(unescape_slashes(&value.to_string())),
    }
}

/// Trimmed text; blank values become `None`.
pub fn normalize_text(value: &JsonValue) -> Option<String> {
    normalize_value(value).and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Values that cannot collapse to a scalar without loss: multi-element arrays,
/// non-empty objects, and strings holding such a JSON document (the upstream
/// double-encoding case). Returned decoded, never as a string.
pub fn structured_value(value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Array(items) if items.len() > 1 => Some(value.clone()),
        JsonValue::Object(map) if !map.is_empty() => Some(value.clone()),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            let looks_encoded = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                || (trimmed.starts_with('[') && trimmed.ends_with(']'));
            if !looks_encoded {
                return None;
            }
            serde_json::from_str::<JsonValue>(trimmed)
                .ok()
                .and_then(|decoded| structured_value(&decoded))
        }
        _ => None,
    }
}

fn normalize_str(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        match serde_json::from_str::<JsonValue>(trimmed) {
            Ok(JsonValue::Array(items)) => match items.as_slice() {
                [] => return String::new(),
                [single] => return normalize_value(single).unwrap_or_default(),
                _ => {}
            },
            Ok(_) => {}
            Err(_) => {
                if let Some(inner) = trimmed
                    .strip_prefix("[\"")
                    .and_then(|rest| rest.strip_suffix("\"]"))
                {
                    return unescape_slashes(inner);
                }
            }
        }
    }
    unescape_slashes(s)
}

pub fn unescape_slashes(s: &str) -> String {
    s.replace("\\/", "/")
}

/// Whole currency units. Accepts thousands separators and decimal strings.
pub fn parse_money(s: &str) -> Option<i64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '원'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(v) = cleaned.parse::<i64>() {
        return Some(v);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() < i64::MAX as f64)
        .map(|v| v.round() as i64)
}

/// Upstream wall-clock timestamp. Date-only values land on midnight.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// `Y`/`N` style flags.
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_uppercase().as_str() {
        "Y" | "YES" | "TRUE" | "1" => Some(true),
        "N" | "NO" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}
