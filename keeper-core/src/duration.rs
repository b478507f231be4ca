//! Human-writable durations for configuration files.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time};

/// A non-negative interval written in Go `time.ParseDuration` syntax.
///
/// This is the format Kubernetes uses for `metav1.Duration` fields, e.g. `30s`, `5m`
/// or `1h30m`. It is serialized back as a string so configuration files round-trip.
///
/// ```
/// use keeper_core::duration::Duration;
/// let d: Duration = "1m30s".parse().unwrap();
/// assert_eq!(std::time::Duration::from(d), std::time::Duration::from_secs(90));
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(time::Duration);

/// Errors returned by the [`FromStr`] implementation for [`Duration`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    /// An invalid unit was provided. Units must be one of 'ns', 'us', 'μs',
    /// 's', 'ms', 's', 'm', or 'h'.
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    /// No unit was provided.
    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    /// The number associated with a given unit was invalid.
    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),

    /// Intervals cannot be negative.
    #[error("negative durations are not allowed")]
    Negative,

    /// The value does not fit in a duration.
    #[error("duration out of range")]
    OutOfRange,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl From<time::Duration> for Duration {
    fn from(duration: time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(duration): Duration) -> Self {
        duration
    }
}

impl Duration {
    /// Construct from whole seconds
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(time::Duration::from_secs(secs))
    }

    /// The wrapped [`std::time::Duration`]
    #[must_use]
    pub const fn as_std(&self) -> time::Duration {
        self.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for Duration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        const MINUTE: time::Duration = time::Duration::from_secs(60);

        s = s.trim();
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        let mut total = time::Duration::from_secs(0);
        while !s.is_empty() && s != "0" {
            let unit_start = s.find(|c: char| c.is_alphabetic()).ok_or(ParseError::NoUnit)?;

            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit = if let Some(next_numeric_start) = rest.find(|c: char| !c.is_alphabetic()) {
                let (unit, rest) = rest.split_at(next_numeric_start);
                s = rest;
                unit
            } else {
                s = "";
                rest
            };

            let base = match unit {
                "ns" => time::Duration::from_nanos(1),
                // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
                "us" | "\u{00b5}s" | "\u{03bc}s" => time::Duration::from_micros(1),
                "ms" => time::Duration::from_millis(1),
                "s" => time::Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };

            let part = time::Duration::try_from_secs_f64(base.as_secs_f64() * val)
                .map_err(|_| ParseError::OutOfRange)?;
            total = total.checked_add(part).ok_or(ParseError::OutOfRange)?;
        }

        Ok(Duration(total))
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<Duration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::{Duration, ParseError};
    use std::time;

    #[test]
    fn parses_go_style_durations() {
        let cases = [
            ("30s", time::Duration::from_secs(30)),
            ("5m", time::Duration::from_secs(300)),
            ("1h30m", time::Duration::from_secs(5400)),
            ("1.5s", time::Duration::from_millis(1500)),
            ("250ms", time::Duration::from_millis(250)),
            ("0", time::Duration::ZERO),
            ("+10s", time::Duration::from_secs(10)),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<Duration>().unwrap().as_std(), expected, "{input}");
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("-5s".parse::<Duration>(), Err(ParseError::Negative));
        assert_eq!("5".parse::<Duration>(), Err(ParseError::NoUnit));
        assert_eq!("5d".parse::<Duration>(), Err(ParseError::InvalidUnit));
        assert!(matches!("s".parse::<Duration>(), Err(ParseError::NotANumber(_))));
    }

    #[test]
    fn serde_round_trip_through_yaml() {
        let d: Duration = serde_yaml::from_str("\"2m\"").unwrap();
        assert_eq!(d, Duration::from_secs(120));
        let back = serde_yaml::to_string(&d).unwrap();
        assert_eq!(back.trim(), "120s");
    }
}
