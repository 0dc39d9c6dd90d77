//! A [`Duration`] type able to parse the human-readable formats users put into
//! the `interval` field of an AutoScaler, like `15s`, `1m` or `1h30m`.
//!
//! It implements [`Deref`] to [`std::time::Duration`], so all associated
//! functions of the standard type are available without re-implementing them.

use std::{cmp::Ordering, fmt::Display, num::ParseIntError, ops::Deref, str::FromStr};

use snafu::{OptionExt, ResultExt, Snafu};
use strum::IntoEnumIterator;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(module)]
pub enum DurationParseError {
    #[snafu(display("invalid input, either empty or contains non-ascii characters"))]
    InvalidInput,

    #[snafu(display("unexpected character {chr:?}"))]
    UnexpectedCharacter { chr: char },

    #[snafu(display("fragment with value {value:?} has no unit"))]
    NoUnit { value: u64 },

    #[snafu(display("invalid fragment order, {current} must be before {previous}"))]
    InvalidUnitOrdering {
        previous: DurationUnit,
        current: DurationUnit,
    },

    #[snafu(display("fragment unit {unit} was specified multiple times"))]
    DuplicateUnit { unit: DurationUnit },

    #[snafu(display("failed to parse fragment unit {unit:?}"))]
    ParseUnitError { unit: String },

    #[snafu(display("failed to parse fragment value as integer"))]
    ParseIntError { source: ParseIntError },

    #[snafu(display("duration does not fit into 64 bits of milliseconds"))]
    Overflow,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl FromStr for Duration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use duration_parse_error::*;
        let input = s.trim();

        if input.is_empty() || !input.is_ascii() {
            return Err(DurationParseError::InvalidInput);
        }

        let mut chars = input.char_indices().peekable();
        let mut millis: u64 = 0;
        let mut last_unit = None;

        let mut take_group = |f: fn(char) -> bool| {
            let &(from, _) = chars.peek()?;
            let mut to = None;

            while let Some((i, _)) = chars.next_if(|(_, c)| f(*c)) {
                to = Some(i);
            }

            to.map(|to| &input[from..=to])
        };

        while let Some(value) = take_group(|c| c.is_ascii_digit()) {
            let value = value.parse::<u64>().context(ParseIntSnafu)?;

            let Some(unit) = take_group(|c| c.is_ascii_alphabetic()) else {
                if let Some(&(_, chr)) = chars.peek() {
                    return UnexpectedCharacterSnafu { chr }.fail();
                }
                return NoUnitSnafu { value }.fail();
            };

            let unit = unit.parse::<DurationUnit>().ok().context(ParseUnitSnafu {
                unit: unit.to_string(),
            })?;

            // Units must be given from largest to smallest, each at most once
            if let Some(last_unit) = last_unit {
                match unit.cmp(&last_unit) {
                    Ordering::Less => {
                        return InvalidUnitOrderingSnafu {
                            previous: last_unit,
                            current: unit,
                        }
                        .fail();
                    }
                    Ordering::Equal => return DuplicateUnitSnafu { unit }.fail(),
                    Ordering::Greater => (),
                }
            }

            millis = value
                .checked_mul(unit.millis())
                .and_then(|fragment| millis.checked_add(fragment))
                .context(OverflowSnafu)?;
            last_unit = Some(unit);
        }

        // Anything left over (a sign, a decimal point, ...) is not part of the format
        if let Some(&(_, chr)) = chars.peek() {
            return UnexpectedCharacterSnafu { chr }.fail();
        }

        Ok(Self(std::time::Duration::from_millis(millis)))
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_zero() {
            return write!(f, "0{}", DurationUnit::Seconds);
        }

        let mut millis = self.0.as_millis();

        for unit in DurationUnit::iter() {
            let unit_millis = u128::from(unit.millis());
            let whole = millis / unit_millis;

            if whole > 0 {
                write!(f, "{whole}{unit}")?;
            }

            millis %= unit_millis;
        }

        Ok(())
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl Duration {
    /// Creates a new [`Duration`] from the specified number of whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }
}

/// Supported units. The order of variants **MATTERS**: it defines the allowed
/// fragment order while parsing and the output order of [`Display`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
pub enum DurationUnit {
    #[strum(serialize = "d")]
    Days,

    #[strum(serialize = "h")]
    Hours,

    #[strum(serialize = "m")]
    Minutes,

    #[strum(serialize = "s")]
    Seconds,

    #[strum(serialize = "ms")]
    Milliseconds,
}

impl DurationUnit {
    /// Returns the number of whole milliseconds in each unit.
    fn millis(self) -> u64 {
        match self {
            Self::Days => 24 * Self::Hours.millis(),
            Self::Hours => 60 * Self::Minutes.millis(),
            Self::Minutes => 60 * Self::Seconds.millis(),
            Self::Seconds => 1000,
            Self::Milliseconds => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("15s", 15)]
    #[case("30s", 30)]
    #[case("1m", 60)]
    #[case("1m30s", 90)]
    #[case("70m", 4200)]
    #[case("1h", 3600)]
    #[case("2d2m2s", 172_922)]
    fn parse_as_secs(#[case] input: &str, #[case] output: u64) {
        let dur: Duration = input.parse().unwrap();
        assert_eq!(dur.as_secs(), output);
    }

    #[rstest]
    #[case("1D", DurationParseError::ParseUnitError { unit: "D".into() })]
    #[case("2m2", DurationParseError::NoUnit { value: 2 })]
    #[case("-1m", DurationParseError::UnexpectedCharacter { chr: '-' })]
    #[case("1.5s", DurationParseError::UnexpectedCharacter { chr: '.' })]
    #[case("1ä", DurationParseError::InvalidInput)]
    #[case(" ", DurationParseError::InvalidInput)]
    #[case("", DurationParseError::InvalidInput)]
    fn parse_invalid(#[case] input: &str, #[case] expected_err: DurationParseError) {
        let err = Duration::from_str(input).unwrap_err();
        assert_eq!(err, expected_err);
    }

    #[rstest]
    #[case("15s2h", DurationParseError::InvalidUnitOrdering { previous: DurationUnit::Seconds, current: DurationUnit::Hours })]
    #[case("1m2m", DurationParseError::DuplicateUnit { unit: DurationUnit::Minutes })]
    fn invalid_order_or_duplicate_unit(
        #[case] input: &str,
        #[case] expected_err: DurationParseError,
    ) {
        let err = Duration::from_str(input).unwrap_err();
        assert_eq!(err, expected_err);
    }

    #[test]
    fn overflowing_input_is_rejected() {
        let err = Duration::from_str("99999999999999999d").unwrap_err();
        assert_eq!(err, DurationParseError::Overflow);
    }

    #[rstest]
    #[case("70m", "1h10m")]
    #[case("90s", "1m30s")]
    #[case("1m", "1m")]
    #[case("0s", "0s")]
    fn to_string(#[case] input: &str, #[case] expected: &str) {
        let dur: Duration = input.parse().unwrap();
        assert_eq!(dur.to_string(), expected);
    }
}
