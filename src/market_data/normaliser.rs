// Convert wire values (strings or JSON numbers) into f64 prices/sizes and unix-ms timestamps.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    UnixMillis,
    UnixSeconds,
    Rfc3339,
    /// Numbers below 1e11 are seconds, above are milliseconds; strings try
    /// numeric first, then RFC 3339.
    #[default]
    Auto,
}

/// Parses a decimal string. Rejects NaN/inf and anything with trailing junk.
pub fn parse_decimal(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let v: f64 = s.parse().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

pub fn value_as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "maker" | "snapshot" => Some(true),
            "false" | "no" | "n" | "0" | "taker" | "update" | "delta" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn parse_timestamp(v: &Value, format: TimestampFormat) -> Option<u64> {
    match v {
        Value::Number(n) => {
            let raw = n.as_f64()?;
            numeric_timestamp(raw, format)
        }
        Value::String(s) => parse_timestamp_str(s, format),
        _ => None,
    }
}

pub fn parse_timestamp_str(s: &str, format: TimestampFormat) -> Option<u64> {
    let s = s.trim();
    match format {
        TimestampFormat::Rfc3339 => parse_rfc3339(s),
        TimestampFormat::UnixMillis | TimestampFormat::UnixSeconds => numeric_timestamp(parse_decimal(s)?, format),
        TimestampFormat::Auto => match parse_decimal(s) {
            Some(raw) => numeric_timestamp(raw, format),
            None => parse_rfc3339(s),
        },
    }
}

fn numeric_timestamp(raw: f64, format: TimestampFormat) -> Option<u64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = match format {
        TimestampFormat::UnixMillis => raw,
        TimestampFormat::UnixSeconds => raw * 1000.0,
        TimestampFormat::Auto if raw < 1e11 => raw * 1000.0,
        TimestampFormat::Auto => raw,
        TimestampFormat::Rfc3339 => return None,
    };
    Some(millis.round() as u64)
}

fn parse_rfc3339(s: &str) -> Option<u64> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    u64::try_from(dt.timestamp_millis()).ok()
}

/// FIX UTCTimestamp: `YYYYMMDD-HH:MM:SS` with optional fractional seconds.
pub fn parse_fix_timestamp(s: &str) -> Option<u64> {
    let s = s.trim();
    let parsed = NaiveDateTime::parse_from_str(s, "%Y%m%d-%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y%m%d-%H:%M:%S"))
        .ok()?;
    u64::try_from(parsed.and_utc().timestamp_millis()).ok()
}
