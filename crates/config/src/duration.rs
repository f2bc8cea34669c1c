//! Go-style duration strings: `90s`, `10m`, `1h30m`, `1.5h`, `250ms`.
//! A bare integer is taken as seconds.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError(String);

impl fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DurationParseError {}

pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError("empty duration".into()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_len == 0 {
            return Err(DurationParseError(format!("expected number in {:?}", input)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| DurationParseError(format!("bad number {:?} in {:?}", &rest[..num_len], input)))?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let scale = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(DurationParseError(format!("missing unit in {:?}", input))),
            other => return Err(DurationParseError(format!("unknown unit {:?} in {:?}", other, input))),
        };
        total += value * scale;
    }
    Duration::try_from_secs_f64(total).map_err(|_| DurationParseError(format!("{:?} is out of range", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "abc", "10x", "m5", "5 m"] {
            assert!(parse_duration(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn rejects_out_of_range() {
        let err = parse_duration("99999999999999999999h").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
        assert!(parse_duration(&format!("{}s", "9".repeat(400))).is_err());
    }
}
