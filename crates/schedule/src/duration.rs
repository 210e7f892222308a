//! Human duration codec for run, setup and interstitial lengths.
//!
//! Text form is `[[H:]M:]S[.fff]`; the integer form is milliseconds.
use serde::{de, Deserializer, Serializer};
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Durations are carried as signed milliseconds so that solved setup times
/// can be reported even when they come out negative.
pub type Millis = i64;

pub const MS_PER_SECOND: Millis = 1_000;
pub const MS_PER_MINUTE: Millis = 60 * MS_PER_SECOND;
pub const MS_PER_HOUR: Millis = 60 * MS_PER_MINUTE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("invalid duration {0:?}: expected [[H:]M:]S[.fff]")]
    Malformed(String),
    #[error("invalid duration {0:?}: minutes must be below 60 when hours are given")]
    MinutesOutOfRange(String),
    #[error("invalid duration {0:?}: seconds must be below 60 when minutes are given")]
    SecondsOutOfRange(String),
    #[error("invalid duration {0:?}: value too large")]
    Overflow(String),
}

/// Which units are always rendered, even when zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationFormat {
    pub always_show_hours: bool,
    pub always_show_minutes: bool,
    pub always_show_millis: bool,
}

impl DurationFormat {
    pub const COMPACT: Self = Self {
        always_show_hours: false,
        always_show_minutes: false,
        always_show_millis: false,
    };

    /// `H:MM:SS`, used for run and setup times.
    pub const HOURS: Self = Self {
        always_show_hours: true,
        always_show_minutes: false,
        always_show_millis: false,
    };

    /// `M:SS`, used for interstitial lengths.
    pub const MINUTES: Self = Self {
        always_show_hours: false,
        always_show_minutes: true,
        always_show_millis: false,
    };

    pub fn with_millis(mut self) -> Self {
        self.always_show_millis = true;
        self
    }
}

/// Parse `[[H:]M:]S[.fff]` into milliseconds.
///
/// A bare integer is whole seconds and may exceed 59; the same goes for
/// minutes when no hour part is present.
pub fn parse(text: &str) -> Result<Millis, DurationError> {
    let input = text.trim();
    let malformed = || DurationError::Malformed(text.to_string());

    let (main, fraction) = match input.split_once('.') {
        Some((main, fraction)) => (main, Some(fraction)),
        None => (input, None),
    };

    let parts: Vec<&str> = main.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| !is_digits(p)) {
        return Err(malformed());
    }

    let number = |part: &str| -> Result<Millis, DurationError> {
        part.parse::<Millis>()
            .map_err(|_| DurationError::Overflow(text.to_string()))
    };

    let (hours, minutes, seconds) = match parts.as_slice() {
        [s] => (None, None, number(s)?),
        [m, s] => (None, Some(number(m)?), number(s)?),
        [h, m, s] => (Some(number(h)?), Some(number(m)?), number(s)?),
        _ => return Err(malformed()),
    };

    if hours.is_some() && minutes.unwrap_or(0) >= 60 {
        return Err(DurationError::MinutesOutOfRange(text.to_string()));
    }
    if minutes.is_some() && seconds >= 60 {
        return Err(DurationError::SecondsOutOfRange(text.to_string()));
    }

    let millis = match fraction {
        None => 0,
        Some(f) if (1..=3).contains(&f.len()) && is_digits(f) => {
            // ".5" is half a second, not five milliseconds
            let padded = format!("{f:0<3}");
            number(&padded)?
        }
        Some(_) => return Err(malformed()),
    };

    let overflow = || DurationError::Overflow(text.to_string());
    hours
        .unwrap_or(0)
        .checked_mul(MS_PER_HOUR)
        .and_then(|acc| acc.checked_add(minutes.unwrap_or(0).checked_mul(MS_PER_MINUTE)?))
        .and_then(|acc| acc.checked_add(seconds.checked_mul(MS_PER_SECOND)?))
        .and_then(|acc| acc.checked_add(millis))
        .ok_or_else(overflow)
}

fn is_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// Render milliseconds in canonical form.
pub fn format(millis: Millis, format: DurationFormat) -> String {
    let sign = if millis < 0 { "-" } else { "" };
    let value = millis.unsigned_abs();

    let hours = value / MS_PER_HOUR as u64;
    let minutes = (value / MS_PER_MINUTE as u64) % 60;
    let seconds = (value / MS_PER_SECOND as u64) % 60;
    let fraction = value % MS_PER_SECOND as u64;

    let mut out = if hours > 0 || format.always_show_hours {
        format!("{sign}{hours}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 || format.always_show_minutes {
        format!("{sign}{minutes}:{seconds:02}")
    } else {
        format!("{sign}{seconds}")
    };

    if fraction > 0 || format.always_show_millis {
        let _ = write!(out, ".{fraction:03}");
    }
    out
}

/// Display adapter, handy in log lines and error messages.
#[derive(Debug, Clone, Copy)]
pub struct Hms(pub Millis);

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(self.0, DurationFormat::HOURS))
    }
}

struct MillisVisitor;

impl<'de> de::Visitor<'de> for MillisVisitor {
    type Value = Millis;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration string like 1:30:00 or an integer number of milliseconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Millis, E> {
        parse(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Millis, E> {
        if v < 0 {
            return Err(E::custom("duration must not be negative"));
        }
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Millis, E> {
        Millis::try_from(v).map_err(|_| E::custom("duration too large"))
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
    deserializer.deserialize_any(MillisVisitor)
}

/// `#[serde(with = "duration::hours")]`
pub mod hours {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Millis, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value, DurationFormat::HOURS))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
        deserialize_millis(deserializer)
    }
}

/// `#[serde(with = "duration::minutes")]`
pub mod minutes {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Millis, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value, DurationFormat::MINUTES))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
        deserialize_millis(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(parse("45").unwrap(), 45 * MS_PER_SECOND);
        assert_eq!(parse("45:00").unwrap(), 45 * MS_PER_MINUTE);
        assert_eq!(parse("1:05:30").unwrap(), MS_PER_HOUR + 5 * MS_PER_MINUTE + 30_000);
        assert_eq!(parse("0:00:01.5").unwrap(), 1_500);
        assert_eq!(parse("2.025").unwrap(), 2_025);
        assert_eq!(parse(" 5:00 ").unwrap(), 5 * MS_PER_MINUTE);
    }

    #[test]
    fn test_bare_units_may_overflow_their_range() {
        assert_eq!(parse("90").unwrap(), 90 * MS_PER_SECOND);
        assert_eq!(parse("90:00").unwrap(), 90 * MS_PER_MINUTE);
    }

    #[test]
    fn test_parse_rejects_out_of_range_subunits() {
        assert!(matches!(
            parse("1:60:00"),
            Err(DurationError::MinutesOutOfRange(_))
        ));
        assert!(matches!(parse("1:75"), Err(DurationError::SecondsOutOfRange(_))));
        assert!(matches!(
            parse("0:00:60"),
            Err(DurationError::SecondsOutOfRange(_))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "abc", "1:2:3:4", "1::2", "1.", ".5", "1.2345", "-5", "1:-2", "1h"] {
            assert!(
                matches!(parse(bad), Err(DurationError::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
        assert!(matches!(
            parse("99999999999999999999"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_format_flags() {
        let ms = 45 * MS_PER_MINUTE;
        assert_eq!(format(ms, DurationFormat::COMPACT), "45:00");
        assert_eq!(format(ms, DurationFormat::HOURS), "0:45:00");
        assert_eq!(format(5_000, DurationFormat::MINUTES), "0:05");
        assert_eq!(format(5_000, DurationFormat::COMPACT), "5");
        assert_eq!(format(5_000, DurationFormat::COMPACT.with_millis()), "5.000");
        assert_eq!(format(3_723_004, DurationFormat::COMPACT), "1:02:03.004");
        assert_eq!(format(-90_000, DurationFormat::COMPACT), "-1:30");
    }

    #[test]
    fn test_round_trip_is_lossless_and_stable() {
        for ms in [0, 1, 999, 1_000, 59_999, 60_000, 3_599_999, 3_600_000, 86_400_123] {
            for fmt in [
                DurationFormat::COMPACT,
                DurationFormat::HOURS,
                DurationFormat::MINUTES,
                DurationFormat::COMPACT.with_millis(),
            ] {
                assert_eq!(parse(&format(ms, fmt)).unwrap(), ms, "{ms} via {fmt:?}");
            }
        }

        for text in ["90", "0:90", "1:5:7", "00:00:01.1", "7:00"] {
            let once = format(parse(text).unwrap(), DurationFormat::COMPACT);
            let twice = format(parse(&once).unwrap(), DurationFormat::COMPACT);
            assert_eq!(once, twice);
        }
        assert_eq!(format(parse("90").unwrap(), DurationFormat::COMPACT), "1:30");
    }

    #[test]
    fn test_serde_helpers() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Durations {
            #[serde(with = "hours")]
            run_time: Millis,
            #[serde(with = "minutes")]
            length: Millis,
        }

        let durations: Durations = serde_json::from_str(r#"{"run_time":"45:00","length":90000}"#).unwrap();
        assert_eq!(durations.run_time, 45 * MS_PER_MINUTE);
        assert_eq!(durations.length, 90_000);

        let json = serde_json::to_value(&durations).unwrap();
        assert_eq!(json["run_time"], "0:45:00");
        assert_eq!(json["length"], "1:30");

        assert!(serde_json::from_str::<Durations>(r#"{"run_time":"1:75","length":0}"#).is_err());
        assert!(serde_json::from_str::<Durations>(r#"{"run_time":-1,"length":0}"#).is_err());
    }
}
