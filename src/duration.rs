use std::fmt::Write;
use std::time::Duration;

use thiserror::Error;

/// Unit suffix to nanoseconds multiplier
const UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("µs", 1_000.0),
    ("us", 1_000.0),
    ("ms", 1_000_000.0),
    ("s", 1_000_000_000.0),
    ("m", 60_000_000_000.0),
    ("h", 3_600_000_000_000.0),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },

    #[error("invalid number in duration {0:?}")]
    InvalidNumber(String),
}

/// Parse duration strings like "1s", "500ms", "1m30s", "1.5h", "16.958µs".
///
/// A bare `"0"` is accepted; every other value needs a unit on each component.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let input = s.trim();
    if input.is_empty() {
        return Err(DurationError::Empty);
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let is_numeric = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = input;
    let mut nanos = 0.0_f64;

    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_numeric(c)).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if tail.is_empty() {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| DurationError::InvalidNumber(input.to_string()))?;

        let unit_len = tail.find(is_numeric).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let multiplier = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, multiplier)| *multiplier)
            .ok_or_else(|| DurationError::UnknownUnit {
                unit: unit.to_string(),
                input: input.to_string(),
            })?;

        nanos += value * multiplier;
        rest = next;
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Format a duration for display ("500ms", "1.5s", "1m30s")
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{}µs", trim_fraction(nanos as f64 / 1_000.0))
    } else if nanos < 1_000_000_000 {
        format!("{}ms", trim_fraction(nanos as f64 / 1_000_000.0))
    } else {
        let total = d.as_secs();
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1_000_000_000.0;

        let mut out = String::new();
        if hours > 0 {
            let _ = write!(out, "{}h", hours);
        }
        if hours > 0 || minutes > 0 {
            let _ = write!(out, "{}m", minutes);
        }
        let _ = write!(out, "{}s", trim_fraction(seconds));
        out
    }
}

fn trim_fraction(value: f64) -> String {
    let s = format!("{:.3}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_milliseconds() {
        let d = parse_duration("988.82775ms").unwrap();
        assert!((d.as_secs_f64() - 0.98882775).abs() < 0.0001);
    }

    #[test]
    fn test_parse_microseconds() {
        assert_eq!(parse_duration("16.958µs").unwrap().as_nanos(), 16958);
        assert_eq!(parse_duration("250us").unwrap().as_nanos(), 250_000);
    }

    #[test]
    fn test_parse_nanoseconds() {
        assert_eq!(parse_duration("0ns").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("10ns").unwrap().as_nanos(), 10);
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1h2m3s4ms").unwrap(),
            Duration::from_millis(3_723_004)
        );
    }

    #[test]
    fn test_parse_bare_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration(" 5s ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(
            parse_duration("10"),
            Err(DurationError::MissingUnit("10".into()))
        );
        assert!(matches!(
            parse_duration("3 days"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_duration("ms"),
            Err(DurationError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_duration("1.2.3s"),
            Err(DurationError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_duration("-1s"),
            Err(DurationError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_nanos(10)), "10ns");
        assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h0m0s");
    }
}
