//! Human time expressions ("30m", "1h", "3600") to seconds.

use std::sync::OnceLock;

use regex::Regex;

/// Default operator install/uninstall timeout.
pub const OPERATOR_TIMEOUT: &str = "60m";
/// Default addon install/uninstall timeout.
pub const ADDON_TIMEOUT: &str = "30m";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("invalid duration: {0:?} (expect <digits>[s|m|h] or plain seconds)")]
    Invalid(String),
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?P<time>\d+)(?P<unit>[A-Za-z0-9_])").expect("static regex"))
}

/// Convert a time expression into seconds.
///
/// `<digits><unit>` with unit `s`, `m` or `h` (any case) is scaled; anything
/// else falls back to parsing the whole value as an integer.
pub fn parse_duration(value: &str) -> Result<u64, DurationError> {
    let whole = || value.trim().parse::<u64>().map_err(|_| DurationError::Invalid(value.to_string()));
    let Some(caps) = pattern().captures(value) else { return whole() };
    let Ok(time) = caps["time"].parse::<u64>() else { return whole() };
    let scale = match caps["unit"].to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return whole(),
    };
    time.checked_mul(scale).ok_or_else(|| DurationError::Invalid(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_scale_to_seconds() {
        assert_eq!(parse_duration("30m"), Ok(1800));
        assert_eq!(parse_duration("2h"), Ok(7200));
        assert_eq!(parse_duration("45s"), Ok(45));
        assert_eq!(parse_duration("1H"), Ok(3600));
    }

    #[test]
    fn plain_integers_pass_through() {
        assert_eq!(parse_duration("3600"), Ok(3600));
        assert_eq!(parse_duration("7"), Ok(7));
        assert_eq!(parse_duration(" 60 "), Ok(60));
    }

    #[test]
    fn defaults_match_kind_constants() {
        assert_eq!(parse_duration(OPERATOR_TIMEOUT), Ok(3600));
        assert_eq!(parse_duration(ADDON_TIMEOUT), Ok(1800));
    }

    #[test]
    fn malformed_values_surface_original_input() {
        let err = parse_duration("bogus").unwrap_err();
        assert_eq!(err, DurationError::Invalid("bogus".into()));
        assert!(err.to_string().contains("bogus"));
        // unknown unit falls back to integer parsing of the whole string
        assert!(matches!(parse_duration("10d"), Err(DurationError::Invalid(v)) if v == "10d"));
        assert!(parse_duration("").is_err());
    }
}
