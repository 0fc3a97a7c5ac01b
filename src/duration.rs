use crate::error::HarnessError;

/// A non-negative, nonzero count of nanoseconds.
///
/// Construction always goes through [`Duration::from_nanos`] or
/// [`parse_duration`]; both reject zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct Duration(u64);

impl Duration {
    pub fn from_nanos(ns: u64) -> Result<Self, HarnessError> {
        if ns == 0 {
            return Err(HarnessError::user_input("duration must be positive"));
        }
        Ok(Duration(ns))
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }
}

/// Suffix table, checked longest-match-first courtesy of the sort below.
/// `("", 1)` means "no suffix": the whole string is a bare nanosecond count.
const UNITS: &[(&str, u64)] = &[
    ("", 1),
    ("ns", 1),
    ("us", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
];

/// Parse a duration literal (`500`, `10ms`, `2s`, `1m`, ...) into nanoseconds.
///
/// Tries each unit suffix in sorted order (so `"ms"` is tried before `"s"`)
/// and accepts the first one whose numeric prefix parses as a strictly
/// positive decimal integer.
pub fn parse_duration(s: &str) -> Result<Duration, HarnessError> {
    let mut units: Vec<&(&str, u64)> = UNITS.iter().collect();
    units.sort_by_key(|(unit, _)| *unit);

    for (unit, mul) in units {
        if let Some(prefix) = s.strip_suffix(unit) {
            // The empty suffix matches everything; treat it as "whole string is the number".
            let numeric = if unit.is_empty() { s } else { prefix };
            match numeric.parse::<i64>() {
                Ok(n) if n > 0 => return Duration::from_nanos(n as u64 * mul),
                Ok(_) => {
                    return Err(HarnessError::user_input(format!(
                        "expected positive number of {} in {:?}",
                        unit, s
                    )))
                }
                Err(_) => continue,
            }
        }
    }

    Err(HarnessError::user_input(format!(
        "could not parse units in {:?}",
        s
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_nanoseconds() {
        assert_eq!(parse_duration("7").unwrap().as_nanos(), 7);
        assert_eq!(parse_duration("500").unwrap().as_nanos(), 500);
    }

    #[test]
    fn unit_suffixes() {
        assert_eq!(parse_duration("100ns").unwrap().as_nanos(), 100);
        assert_eq!(parse_duration("50us").unwrap().as_nanos(), 50_000);
        assert_eq!(parse_duration("10ms").unwrap().as_nanos(), 10_000_000);
        assert_eq!(parse_duration("2s").unwrap().as_nanos(), 2_000_000_000);
        assert_eq!(parse_duration("1m").unwrap().as_nanos(), 60_000_000_000);
    }

    #[test]
    fn ms_is_not_mistaken_for_s() {
        assert_eq!(
            parse_duration("5ms").unwrap(),
            parse_duration("5000us").unwrap()
        );
        assert_eq!(
            parse_duration("5ms").unwrap(),
            parse_duration("5000000ns").unwrap()
        );
    }

    #[test]
    fn zero_or_negative_fails() {
        assert!(parse_duration("0ms").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("0").is_err());
    }

    #[test]
    fn garbage_fails() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10xs").is_err());
    }
}
