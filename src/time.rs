//! j2ksec Time Helpers
//!
//! Timestamps on the wire and in column 0 are seconds since
//! 2000-01-01T12:00:00Z. All helpers here are free functions without shared
//! state, so they are safe to call from any handler.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Unix time of the j2ksec epoch.
pub const J2K_EPOCH_UNIX: i64 = 946_728_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("unrecognized time '{0}'")]
    Unrecognized(String),

    #[error("time out of range: {0}")]
    OutOfRange(String),
}

pub fn j2k_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(J2K_EPOCH_UNIX, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn to_j2k(time: DateTime<Utc>) -> f64 {
    let since = time - j2k_epoch();
    since.num_milliseconds() as f64 / 1000.0
}

pub fn from_j2k(j2ksec: f64) -> Result<DateTime<Utc>, TimeError> {
    let millis = (j2ksec * 1000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return Err(TimeError::OutOfRange(j2ksec.to_string()));
    }
    Duration::try_milliseconds(millis as i64)
        .and_then(|d| j2k_epoch().checked_add_signed(d))
        .ok_or_else(|| TimeError::OutOfRange(j2ksec.to_string()))
}

pub fn now_j2k() -> f64 {
    to_j2k(Utc::now())
}

/// `yyyy-MM-dd HH:mm:ss.SSS` in UTC.
pub fn format_j2k(j2ksec: f64) -> String {
    match from_j2k(j2ksec) {
        Ok(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        Err(_) => j2ksec.to_string(),
    }
}

fn parse_relative(raw: &str) -> Option<f64> {
    let body = raw.strip_prefix('-')?;
    let unit = body.chars().last()?;
    let amount: f64 = body[..body.len() - unit.len_utf8()].parse().ok()?;
    let scale = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3_600.0,
        'd' => 86_400.0,
        'w' => 604_800.0,
        _ => return None,
    };
    Some(amount * scale)
}

fn parse_compact(raw: &str) -> Option<f64> {
    let (format, text) = match raw.len() {
        14 => ("%Y%m%d%H%M%S", raw.to_string()),
        17 => ("%Y%m%d%H%M%S%.3f", format!("{}.{}", &raw[..14], &raw[14..])),
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(&text, format).ok()?;
    Some(to_j2k(naive.and_utc()))
}

/// Parse a request time.
///
/// Accepts `now`, relative offsets such as `-2h` (counted back from
/// `reference`), `yyyyMMddHHmmss[SSS]`, or raw j2ksec.
pub fn parse_time(raw: &str, reference: f64) -> Result<f64, TimeError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("now") {
        return Ok(now_j2k());
    }
    if let Some(offset) = parse_relative(raw) {
        let t = reference - offset;
        return if t.is_finite() {
            Ok(t)
        } else {
            Err(TimeError::OutOfRange(raw.to_string()))
        };
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Some(t) = parse_compact(raw) {
            return Ok(t);
        }
    }
    raw.parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| TimeError::Unrecognized(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_is_zero() {
        assert_eq!(to_j2k(j2k_epoch()), 0.0);
        assert_eq!(format_j2k(0.0), "2000-01-01 12:00:00.000");
    }

    #[test]
    fn test_round_trip() {
        let t = from_j2k(86_400.5).unwrap();
        assert_eq!(to_j2k(t), 86_400.5);
        assert_eq!(format_j2k(86_400.5), "2000-01-02 12:00:00.500");
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_time("3600", 0.0).unwrap(), 3600.0);
        assert_eq!(parse_time("-1.5", 0.0).unwrap(), -1.5);
        assert_eq!(parse_time("-2h", 10_000.0).unwrap(), 10_000.0 - 7_200.0);
        assert_eq!(parse_time("-1d", 0.0).unwrap(), -86_400.0);
        assert_eq!(parse_time("20000101120000", 0.0).unwrap(), 0.0);
        assert_eq!(parse_time("20000101120001250", 0.0).unwrap(), 1.25);
        assert!(parse_time("now", 0.0).unwrap() > 0.0);
        assert!(parse_time("yesterday", 0.0).is_err());
        assert!(parse_time("NaN", 0.0).is_err());
        assert!(matches!(parse_time("-1e308w", 0.0), Err(TimeError::OutOfRange(_))));
    }
}
