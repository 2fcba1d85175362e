//! Compact duration notation (`300ms`, `90s`, `1h30m`).
//!
//! Used for every duration in the configuration and for rendering the
//! unreported threshold inside the `reason` label, where `2h` prints as
//! `2h0m0s`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("negative duration {0:?} is not allowed")]
    Negative(String),
    #[error("duration {0:?} is out of range")]
    Overflow(String),
}

/// A non-negative duration that parses from and prints as `1h2m3.5s`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(Duration);

impl HumanDuration {
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn as_std(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for HumanDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<HumanDuration> for Duration {
    fn from(duration: HumanDuration) -> Self {
        duration.0
    }
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3600 * NANOS_PER_SEC),
        _ => None,
    }
}

impl FromStr for HumanDuration {
    type Err = DurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut rest = input.trim();
        if let Some(stripped) = rest.strip_prefix('+') {
            rest = stripped;
        } else if rest.starts_with('-') {
            return Err(DurationError::Negative(input.to_string()));
        }

        if rest == "0" {
            return Ok(Self::default());
        }
        if rest.is_empty() {
            return Err(DurationError::Invalid(input.to_string()));
        }

        let overflow = || DurationError::Overflow(input.to_string());
        let mut total: u128 = 0;

        while !rest.is_empty() {
            let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            let (int_digits, after_int) = rest.split_at(int_len);

            let (frac_digits, after_number) = match after_int.strip_prefix('.') {
                Some(after_dot) => {
                    let frac_len = after_dot
                        .find(|c: char| !c.is_ascii_digit())
                        .unwrap_or(after_dot.len());
                    after_dot.split_at(frac_len)
                }
                None => ("", after_int),
            };

            if int_digits.is_empty() && frac_digits.is_empty() {
                return Err(DurationError::Invalid(input.to_string()));
            }

            let unit_len = after_number
                .find(|c: char| c == '.' || c.is_ascii_digit())
                .unwrap_or(after_number.len());
            let (unit, remainder) = after_number.split_at(unit_len);
            if unit.is_empty() {
                return Err(DurationError::MissingUnit(input.to_string()));
            }
            let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
                unit: unit.to_string(),
                input: input.to_string(),
            })?;

            let whole: u128 = if int_digits.is_empty() {
                0
            } else {
                int_digits.parse().map_err(|_| overflow())?
            };
            let mut nanos = whole.checked_mul(scale).ok_or_else(overflow)?;

            // Digits beyond nanosecond precision cannot change the result.
            let frac_digits = &frac_digits[..frac_digits.len().min(18)];
            if !frac_digits.is_empty() {
                let frac: u128 = frac_digits.parse().map_err(|_| overflow())?;
                let divisor = 10u128.pow(frac_digits.len() as u32);
                nanos = nanos
                    .checked_add(frac * scale / divisor)
                    .ok_or_else(overflow)?;
            }

            total = total.checked_add(nanos).ok_or_else(overflow)?;
            if total > i64::MAX as u128 {
                return Err(overflow());
            }
            rest = remainder;
        }

        Ok(Self(Duration::from_nanos(total as u64)))
    }
}

/// `whole.frac` with trailing zeros of the fraction trimmed.
fn write_fraction(
    f: &mut fmt::Formatter<'_>,
    whole: u128,
    frac: u128,
    digits: usize,
) -> fmt::Result {
    if frac == 0 {
        return write!(f, "{whole}");
    }
    let padded = format!("{frac:0digits$}");
    write!(f, "{whole}.{}", padded.trim_end_matches('0'))
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }

        if nanos < NANOS_PER_MICRO {
            return write!(f, "{nanos}ns");
        }
        if nanos < NANOS_PER_MILLI {
            write_fraction(f, nanos / NANOS_PER_MICRO, nanos % NANOS_PER_MICRO, 3)?;
            return f.write_str("µs");
        }
        if nanos < NANOS_PER_SEC {
            write_fraction(f, nanos / NANOS_PER_MILLI, nanos % NANOS_PER_MILLI, 6)?;
            return f.write_str("ms");
        }

        let secs = nanos / NANOS_PER_SEC;
        let hours = secs / 3600;
        let minutes = (secs / 60) % 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        write_fraction(f, secs % 60, nanos % NANOS_PER_SEC, 9)?;
        f.write_str("s")
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Environment providers hand bare numbers over as integers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Raw::Seconds(secs) => Ok(Self::from_secs(secs)),
        }
    }
}
