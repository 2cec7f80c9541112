//! Byte-size parsing and formatting.
//!
//! Accepts suffixed human sizes (`500M`, `1.5GiB`, `2TB`) on the command line
//! and in config files; formats byte counts with binary units for display.

use crate::error::{CoreError, Result};
use humansize::{format_size, BINARY};

const KB: u64 = 1000;
const KIB: u64 = 1024;

/// Parse a human-readable size string into bytes.
///
/// Decimal (`KB`, `MB`, ...) and binary (`KiB`, `MiB`, ...) suffixes are
/// accepted case-insensitively, with or without the trailing `B`. A bare
/// number is taken as bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidSize(s.to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (num_part, unit_part) = trimmed.split_at(split);

    let value: f64 = num_part
        .parse()
        .map_err(|_| CoreError::InvalidSize(s.to_string()))?;
    if value < 0.0 || !value.is_finite() {
        return Err(CoreError::InvalidSize(s.to_string()));
    }

    let multiplier = match unit_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => KB,
        "m" | "mb" => KB.pow(2),
        "g" | "gb" => KB.pow(3),
        "t" | "tb" => KB.pow(4),
        "ki" | "kib" => KIB,
        "mi" | "mib" => KIB.pow(2),
        "gi" | "gib" => KIB.pow(3),
        "ti" | "tib" => KIB.pow(4),
        _ => return Err(CoreError::UnknownSizeUnit(s.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Format a byte count with binary units (`1.50 GiB`).
pub fn format_bytes(n: u64) -> String {
    format_size(n, BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1234").unwrap(), 1234);
        assert_eq!(parse_size("  42  ").unwrap(), 42);
    }

    #[test]
    fn test_parse_binary_units() {
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("5GiB").unwrap(), 5 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5GiB").unwrap(), 1024u64.pow(3) * 3 / 2);
    }

    #[test]
    fn test_parse_decimal_units() {
        assert_eq!(parse_size("1KB").unwrap(), 1000);
        assert_eq!(parse_size("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("1TB").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(parse_size("1gib").unwrap(), 1024u64.pow(3));
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("-5GiB").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1024), "1 KiB");
        assert!(format_bytes(5 * 1024 * 1024 * 1024).contains("GiB"));
    }
}
