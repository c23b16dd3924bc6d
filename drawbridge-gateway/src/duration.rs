//! Human-readable access durations ("2h30m", "1.5d", "permanent") expressed
//! in minutes.

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DurationParseError {
    #[error("unknown duration unit: {0:?}")]
    UnknownUnit(String),
    #[error("invalid number in duration: {0:?}")]
    InvalidNumber(String),
    #[error("no duration components in {0:?}")]
    NoComponents(String),
}

const MINUTES_PER_YEAR: f64 = 525_600.0; // 365 days
const MINUTES_PER_MONTH: f64 = 43_200.0; // 30 days
const MINUTES_PER_WEEK: f64 = 10_080.0;
const MINUTES_PER_DAY: f64 = 1_440.0;
const MINUTES_PER_HOUR: f64 = 60.0;

/// Parses a duration like `30m`, `2.5h`, `1h30m`, `1y6M` into minutes.
///
/// `0`, `permanent`, `never`, `infinity` and the empty string all mean
/// "no end" and return 0. The sum of components is truncated toward zero.
///
/// A bare `M` unit means months; every other unit is case-insensitive, so
/// minutes are spelled `m`, `min`, `minute(s)`.
pub fn parse_duration(input: &str) -> Result<u64, DurationParseError> {
    let trimmed = input.trim();

    if trimmed.is_empty() || trimmed == "0" {
        return Ok(0);
    }
    if ["permanent", "never", "infinity"].contains(&trimmed.to_ascii_lowercase().as_str()) {
        return Ok(0);
    }

    let mut chars = trimmed.char_indices().peekable();
    let mut total_minutes = 0.0_f64;
    let mut components = 0_u32;

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if !c.is_ascii_digit() {
            return Err(DurationParseError::InvalidNumber(trimmed[start..].to_owned()));
        }

        // number: digits with an optional fractional part
        let mut end = start;
        let mut seen_dot = false;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() || (c == '.' && !seen_dot) {
                seen_dot |= c == '.';
                end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let number: f64 = trimmed[start..end]
            .parse()
            .map_err(|_| DurationParseError::InvalidNumber(trimmed[start..end].to_owned()))?;

        while matches!(chars.peek(), Some(&(_, c)) if c.is_whitespace()) {
            chars.next();
        }

        // unit: a run of letters
        let unit_start = match chars.peek() {
            Some(&(idx, c)) if c.is_alphabetic() => idx,
            _ => return Err(DurationParseError::UnknownUnit(String::new())),
        };
        let mut unit_end = unit_start;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_alphabetic() {
                unit_end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let unit = &trimmed[unit_start..unit_end];

        total_minutes += number * unit_minutes(unit)?;
        components += 1;
    }

    if components == 0 {
        return Err(DurationParseError::NoComponents(trimmed.to_owned()));
    }

    // Truncation toward zero matches integer minutes semantics.
    Ok(total_minutes as u64)
}

fn unit_minutes(unit: &str) -> Result<f64, DurationParseError> {
    // A bare capital M is months; everything else folds to lowercase, so it
    // cannot be confused with `m` for minutes.
    if unit == "M" {
        return Ok(MINUTES_PER_MONTH);
    }

    match unit.to_ascii_lowercase().as_str() {
        "y" | "year" | "years" => Ok(MINUTES_PER_YEAR),
        "mo" | "mon" | "month" | "months" => Ok(MINUTES_PER_MONTH),
        "w" | "week" | "weeks" => Ok(MINUTES_PER_WEEK),
        "d" | "day" | "days" => Ok(MINUTES_PER_DAY),
        "h" | "hr" | "hrs" | "hour" | "hours" => Ok(MINUTES_PER_HOUR),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(1.0),
        other => Err(DurationParseError::UnknownUnit(other.to_owned())),
    }
}

/// Formats minutes back into the short unit notation; 0 is "Permanent".
pub fn format_duration(minutes: u64) -> String {
    if minutes == 0 {
        return "Permanent".to_owned();
    }

    const UNITS: &[(u64, &str)] = &[
        (525_600, "y"),
        (43_200, "mo"),
        (10_080, "w"),
        (1_440, "d"),
        (60, "h"),
        (1, "m"),
    ];

    let mut remaining = minutes;
    let mut parts = Vec::new();

    for &(size, suffix) in UNITS {
        if remaining >= size {
            parts.push(format!("{}{suffix}", remaining / size));
            remaining %= size;
        }
    }

    parts.join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("30m", 30)]
    #[case("2h", 120)]
    #[case("1.5h", 90)]
    #[case("1h30m", 90)]
    #[case("90m", 90)]
    #[case("1d", 1440)]
    #[case("1w", 10_080)]
    #[case("2d12h30m", 3630)]
    #[case("1y", 525_600)]
    #[case("1M", 43_200)]
    #[case("1mo", 43_200)]
    #[case("1y6M", 525_600 + 6 * 43_200)]
    #[case("2.5d", 3600)]
    #[case("0.5w", 5040)]
    #[case("2 h 30 m", 150)]
    #[case("3 hours", 180)]
    #[case("10 MINUTES", 10)]
    fn parses_components(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("0")]
    #[case("permanent")]
    #[case("PERMANENT")]
    #[case("never")]
    #[case("infinity")]
    #[case("")]
    #[case("   ")]
    fn no_end_inputs_are_zero(#[case] input: &str) {
        assert_eq!(parse_duration(input).unwrap(), 0);
    }

    #[rstest]
    #[case("abc")]
    #[case("12")]
    #[case("3x")]
    #[case("h30")]
    #[case("1..5h")]
    fn malformed_inputs_fail(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn equivalent_spellings_agree() {
        assert_eq!(parse_duration("1h30m").unwrap(), parse_duration("90m").unwrap());
        assert_eq!(parse_duration("1h30m").unwrap(), parse_duration("1.5h").unwrap());
    }

    #[rstest]
    #[case(0, "Permanent")]
    #[case(30, "30m")]
    #[case(90, "1h 30m")]
    #[case(1440, "1d")]
    #[case(3630, "2d 12h 30m")]
    #[case(525_600 + 43_200, "1y 1mo")]
    fn formats_minutes(#[case] minutes: u64, #[case] expected: &str) {
        assert_eq!(format_duration(minutes), expected);
    }

    #[test]
    fn format_parse_round_trip_is_idempotent() {
        for input in ["30m", "1h30m", "2d12h30m", "1y6M", "permanent", "0.5w"] {
            let once = format_duration(parse_duration(input).unwrap());
            let twice = format_duration(parse_duration(&once).unwrap());
            assert_eq!(once, twice, "round-trip diverged for {input:?}");
        }
    }
}
