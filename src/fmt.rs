//! Renders and parses the durations used throughout the cache.
//!
//! Config files specify idle times and shrinker intervals as strings like "30 s" or "2 h",
//! while statistics and log messages report measured times back in a compact form. Both
//! directions live here.
use std::time::Duration;

/// Writes a measured time in microseconds into the given target using a readable unit.
///
/// The unit (us, ms or s) is chosen so that at most three digits appear before the
/// decimal point, with the precision reduced as the value grows.
///
/// # Examples
///
/// ```
/// let mut target = String::new();
/// strata::fmt::format_micros(100, &mut target).unwrap();
/// assert_eq!(target, "100 us");
///
/// let mut target = String::new();
/// strata::fmt::format_micros(8_192, &mut target).unwrap();
/// assert_eq!(target, "8.19 ms");
///
/// let mut target = String::new();
/// strata::fmt::format_micros(128_123, &mut target).unwrap();
/// assert_eq!(target, "128 ms");
///
/// let mut target = String::new();
/// strata::fmt::format_micros(10_128_123, &mut target).unwrap();
/// assert_eq!(target, "10.1 s");
/// ```
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        return write!(f, "{} us", micros);
    }

    let (value, unit) = if micros < 1_000_000 {
        (micros as f32 / 1_000., "ms")
    } else {
        (micros as f32 / 1_000_000., "s")
    };

    if value < 10. {
        write!(f, "{:.2} {}", value, unit)
    } else if value < 100. {
        write!(f, "{:.1} {}", value, unit)
    } else {
        write!(f, "{} {}", value as i32, unit)
    }
}

/// Parses a duration string as found in the cache config.
///
/// Accepts a non-negative integer followed by an optional unit suffix: **ms** for
/// milliseconds, **s** for seconds, **m** for minutes, **h** for hours or **d** for days.
/// Suffixes are case insensitive and a missing suffix means milliseconds. Anything
/// else (decimals, negative numbers, unknown suffixes) yields an **Err**.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(strata::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(strata::fmt::parse_duration("12 s").unwrap(), Duration::from_secs(12));
/// assert_eq!(strata::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(strata::fmt::parse_duration("2 h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(strata::fmt::parse_duration("5 d").unwrap(), Duration::from_secs(5 * 24 * 60 * 60));
/// assert!(strata::fmt::parse_duration("3 y").is_err());
/// assert!(strata::fmt::parse_duration("1.2s").is_err());
/// assert!(strata::fmt::parse_duration("-1m").is_err());
/// ```
pub fn parse_duration(value: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION_EXPRESSION: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*([a-zA-Z]*)\s*$").unwrap();
    }

    let captures = DURATION_EXPRESSION
        .captures(value.as_ref())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Cannot parse '{}' as a duration. Expected a positive number, \
                 optionally followed by 'ms', 's', 'm', 'h' or 'd'.",
                value.as_ref()
            )
        })?;

    let amount = captures[1].parse::<u64>()?;
    match captures[2].to_lowercase().as_str() {
        "" | "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 60 * 60)),
        "d" => Ok(Duration::from_secs(amount * 60 * 60 * 24)),
        other => Err(anyhow::anyhow!(
            "Unknown duration suffix '{}' in '{}'.",
            other,
            value.as_ref()
        )),
    }
}

/// Renders a duration as a space separated list of units, e.g. "1h 12m 9s".
///
/// Units which do not contribute are skipped entirely, therefore an exact number
/// of hours renders as just "4h". Used by the shrinker to report its settings
/// when it starts up.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(strata::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(strata::fmt::format_duration(Duration::from_secs(60 * 32 + 13)), "32m 13s");
/// assert_eq!(strata::fmt::format_duration(Duration::from_secs(4 * 60 * 60)), "4h");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 4] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
    ];

    let mut remainder = duration.as_millis();
    let mut parts = Vec::new();
    for (millis_per_unit, unit) in UNITS {
        let amount = remainder / millis_per_unit;
        if amount > 0 {
            parts.push(format!("{}{}", amount, unit));
            remainder %= millis_per_unit;
        }
    }
    if remainder > 0 {
        parts.push(format!("{}ms", remainder));
    }

    parts.join(" ")
}
