use anyhow::{Context, Result, bail};
use chrono::TimeDelta;

/// Parses a GTFS `HH:MM[:SS]` clock value into a duration since the start of
/// the service day. Hours may exceed 23 for trips running past midnight and a
/// missing seconds field counts as zero.
pub fn parse_duration(value: &str) -> Result<TimeDelta> {
    let mut parts = value.trim().split(':');
    let hours = next_component(&mut parts, value, "hours")?;
    let minutes = next_component(&mut parts, value, "minutes")?;
    let seconds = match parts.next() {
        Some(s) => s
            .parse::<i64>()
            .with_context(|| format!("invalid seconds in time '{value}'"))?,
        None => 0,
    };
    if parts.next().is_some() {
        bail!("too many components in time '{value}'");
    }
    if minutes >= 60 || seconds >= 60 {
        bail!("minutes and seconds must be below 60 in time '{value}'");
    }

    TimeDelta::try_hours(hours)
        .zip(TimeDelta::try_minutes(minutes))
        .zip(TimeDelta::try_seconds(seconds))
        .and_then(|((h, m), s)| h.checked_add(&m)?.checked_add(&s))
        .with_context(|| format!("time '{value}' out of range"))
}

/// Same as [`parse_duration`], in whole seconds.
pub fn parse_seconds(value: &str) -> Result<u32> {
    let seconds = parse_duration(value)?.num_seconds();
    u32::try_from(seconds).with_context(|| format!("time '{value}' out of range"))
}

fn next_component<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    value: &str,
    name: &str,
) -> Result<i64> {
    let raw = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("missing {name} in time '{value}'"))?;
    let parsed: i64 = raw
        .parse()
        .with_context(|| format!("invalid {name} in time '{value}'"))?;
    if parsed < 0 {
        bail!("negative {name} in time '{value}'");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_field_is_optional() {
        assert_eq!(parse_duration("12:00").unwrap(), TimeDelta::hours(12));
        assert_eq!(parse_duration("12:00:00").unwrap(), TimeDelta::hours(12));
    }

    #[test]
    fn test_out_of_range_hours_is_an_error() {
        assert!(parse_duration("999999999999999:00:00").is_err());
        assert!(parse_seconds("2000000:00:00").is_err());
    }

    #[test]
    fn test_parse_full_clock_value() {
        assert_eq!(
            parse_duration("08:05:30").unwrap(),
            TimeDelta::hours(8) + TimeDelta::minutes(5) + TimeDelta::seconds(30)
        );
        assert_eq!(parse_seconds(" 8:05:30").unwrap(), 8 * 3600 + 5 * 60 + 30);
    }

    #[test]
    fn test_past_midnight() {
        assert_eq!(parse_seconds("25:10:00").unwrap(), 25 * 3600 + 600);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("8").is_err());
        assert!(parse_duration("08:61:00").is_err());
        assert!(parse_duration("aa:bb:cc").is_err());
        assert!(parse_duration("1:2:3:4").is_err());
    }
}
