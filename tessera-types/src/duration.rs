use regex::Regex;
use thiserror::Error;

lazy_static::lazy_static! {
    static ref DURATION_REGEX: Regex = Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$"
    )
    .expect("a valid regex");

    static ref WEEK_REGEX: Regex = Regex::new(r"^P(\d+)W$").expect("a valid regex");
}

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_MONTH: i64 = 30 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: i64 = 365 * MILLIS_PER_DAY;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{value}` is not a valid ISO-8601 duration")]
pub struct DurationError {
    pub value: String,
}

impl DurationError {
    fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }
}

/// Parse an ISO-8601 duration into milliseconds.
///
/// Supports the `P[nY][nM][nD][T[nH][nM][nS]]` and `PnW` forms with
/// integer designators. Years count as 365 days and months as 30 days.
///
/// # Errors
///
/// Returns [`DurationError`] when the string is not a recognized duration,
/// has no designators, or does not fit in an `i64` of milliseconds.
pub fn parse(value: &str) -> Result<i64, DurationError> {
    if let Some(captures) = WEEK_REGEX.captures(value) {
        let weeks = parse_component(&captures, 1, value)?;
        return weeks
            .checked_mul(MILLIS_PER_WEEK)
            .ok_or_else(|| DurationError::new(value));
    }

    let captures = DURATION_REGEX
        .captures(value)
        .ok_or_else(|| DurationError::new(value))?;

    // "P" and "P1DT" both match the regex with no designators behind them.
    if captures.iter().skip(1).all(|group| group.is_none()) {
        return Err(DurationError::new(value));
    }
    if value.contains('T') && captures.iter().skip(4).all(|group| group.is_none()) {
        return Err(DurationError::new(value));
    }

    let scales = [
        MILLIS_PER_YEAR,
        MILLIS_PER_MONTH,
        MILLIS_PER_DAY,
        MILLIS_PER_HOUR,
        MILLIS_PER_MINUTE,
        MILLIS_PER_SECOND,
    ];
    let mut total: i64 = 0;
    for (index, scale) in scales.iter().enumerate() {
        let component = parse_component(&captures, index + 1, value)?;
        let component = component
            .checked_mul(*scale)
            .ok_or_else(|| DurationError::new(value))?;
        total = total
            .checked_add(component)
            .ok_or_else(|| DurationError::new(value))?;
    }
    Ok(total)
}

fn parse_component(
    captures: &regex::Captures<'_>,
    index: usize,
    value: &str,
) -> Result<i64, DurationError> {
    captures.get(index).map_or(Ok(0), |group| {
        group
            .as_str()
            .parse::<i64>()
            .map_err(|_| DurationError::new(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_designators() {
        assert_eq!(parse("P30D"), Ok(30 * MILLIS_PER_DAY));
        assert_eq!(parse("P1Y"), Ok(MILLIS_PER_YEAR));
        assert_eq!(parse("P2M"), Ok(2 * MILLIS_PER_MONTH));
        assert_eq!(
            parse("P1Y2M3D"),
            Ok(MILLIS_PER_YEAR + 2 * MILLIS_PER_MONTH + 3 * MILLIS_PER_DAY)
        );
    }

    #[test]
    fn parses_time_designators() {
        assert_eq!(parse("PT1H30M"), Ok(MILLIS_PER_HOUR + 30 * MILLIS_PER_MINUTE));
        assert_eq!(parse("PT15S"), Ok(15 * MILLIS_PER_SECOND));
        assert_eq!(
            parse("P1DT2H3M4S"),
            Ok(MILLIS_PER_DAY
                + 2 * MILLIS_PER_HOUR
                + 3 * MILLIS_PER_MINUTE
                + 4 * MILLIS_PER_SECOND)
        );
    }

    #[test]
    fn parses_weeks() {
        assert_eq!(parse("P2W"), Ok(2 * MILLIS_PER_WEEK));
    }

    #[test]
    fn rejects_malformed_values() {
        for value in ["", "P", "PT", "P1DT", "30D", "P30d", "P1.5D", "PT1H2H", "P1W2D", "P-1D"] {
            assert!(parse(value).is_err(), "`{value}` should be rejected");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse("P9999999999999999Y").is_err());
    }
}
