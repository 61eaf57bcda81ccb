//! Parsing of human-readable rate limits from the configuration file.

use thiserror::Error;

/// Error returned when a rate-limit string cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("invalid rate limit `{input}`")]
pub struct RateParseError {
    input: String,
}

impl RateParseError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_owned(),
        }
    }

    /// The rejected input string.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// Parses a rate limit like `"512K"`, `"2M"` or `"300000"` into bytes per
/// second. `"0"` and `"off"` (case-insensitive) mean unlimited and map to
/// `None`.
///
/// Recognised suffixes are `K`/`k` (KiB), `M`/`m` (MiB) and `G`/`g` (GiB);
/// a trailing `B`/`b` after the suffix is tolerated (`"512KB"`).
pub fn parse_rate(input: &str) -> Result<Option<u64>, RateParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RateParseError::new(input));
    }
    if trimmed.eq_ignore_ascii_case("off") || trimmed == "0" {
        return Ok(None);
    }

    let mut digits_end = 0;
    for (i, c) in trimmed.char_indices() {
        if c.is_ascii_digit() {
            digits_end = i + 1;
        } else {
            break;
        }
    }
    if digits_end == 0 {
        return Err(RateParseError::new(input));
    }
    let value: u64 = trimmed[..digits_end]
        .parse()
        .map_err(|_| RateParseError::new(input))?;

    let suffix = trimmed[digits_end..].trim();
    let multiplier = match suffix {
        "" => 1,
        "K" | "k" | "KB" | "kb" | "kB" | "Kb" => 1 << 10,
        "M" | "m" | "MB" | "mb" | "mB" | "Mb" => 1 << 20,
        "G" | "g" | "GB" | "gb" | "gB" | "Gb" => 1 << 30,
        _ => return Err(RateParseError::new(input)),
    };

    value
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| RateParseError::new(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_number_is_bytes_per_second() {
        assert_eq!(parse_rate("300000"), Ok(Some(300_000)));
    }

    #[test]
    fn suffixes_scale_binary() {
        assert_eq!(parse_rate("512K"), Ok(Some(512 * 1024)));
        assert_eq!(parse_rate("2M"), Ok(Some(2 * 1024 * 1024)));
        assert_eq!(parse_rate("1G"), Ok(Some(1 << 30)));
        assert_eq!(parse_rate("512KB"), Ok(Some(512 * 1024)));
    }

    #[test]
    fn zero_and_off_mean_unlimited() {
        assert_eq!(parse_rate("0"), Ok(None));
        assert_eq!(parse_rate("off"), Ok(None));
        assert_eq!(parse_rate("OFF"), Ok(None));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_rate("").is_err());
        assert!(parse_rate("fast").is_err());
        assert!(parse_rate("12X").is_err());
        assert!(parse_rate("K12").is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        let err = parse_rate("999999999999999999999G").unwrap_err();
        assert_eq!(err.input(), "999999999999999999999G");
    }
}
