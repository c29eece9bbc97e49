//! Collection of utility functions.

pub use self::counter::*;
pub use self::group_by::*;

use crate::prelude::*;

mod counter;
mod group_by;

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 =  4.2` thus
/// `div_ceil(21,5) == 5`.
pub fn div_ceil(x: u64, y: u64) -> u64 {
    (x / y) + (if x % y == 0 { 0 } else { 1 })
}

/// Parse a human-readable byte size such as `100`, `2KB`, `1.5GB` or `512MiB`. Decimal
/// suffixes are powers of 1000, binary suffixes (`KiB`, `MiB`, ...) are powers of 1024.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let text = input.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or_else(|| text.len());
    let (number, unit) = text.split_at(split);

    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid byte size {:?}", input))?;

    let factor: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "tb" | "t" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => bail!("unknown byte unit {:?} in {:?}", other, input),
    };

    if number < 0.0 || !number.is_finite() {
        bail!("invalid byte size {:?}", input);
    }

    Ok((number * factor as f64).round() as u64)
}

/// Format a byte count for log messages, e.g. `1.50 GB`.
pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;

    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0, 5), 0);
        assert_eq!(div_ceil(1, 5), 1);
        assert_eq!(div_ceil(9, 5), 2);
        assert_eq!(div_ceil(10, 5), 2);
        assert_eq!(div_ceil(11, 5), 3);
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("100").unwrap(), 100);
        assert_eq!(parse_bytes("2KB").unwrap(), 2_000);
        assert_eq!(parse_bytes(" 1.5GB ").unwrap(), 1_500_000_000);
        assert_eq!(parse_bytes("512MiB").unwrap(), 512 << 20);
        assert!(parse_bytes("ten bytes").is_err());
        assert!(parse_bytes("10 parsecs").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(192), "192 B");
        assert_eq!(format_bytes(1_500_000_000), "1.50 GB");
    }
}
