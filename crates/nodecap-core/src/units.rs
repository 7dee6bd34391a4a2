//! Human-readable byte sizes.

use crate::error::{CoreError, CoreResult};

pub const KIB: i64 = 1024;
pub const MIB: i64 = 1024 * KIB;
pub const GIB: i64 = 1024 * MIB;
pub const TIB: i64 = 1024 * GIB;
pub const PIB: i64 = 1024 * TIB;

/// Parse a size string like "100", "512M", "2GB", "1.5GiB" into bytes.
///
/// Every unit is binary (`1K == 1024`). An empty string is zero and a
/// leading `-` yields a negative size, which capacity deltas rely on.
pub fn parse_bytes(s: &str) -> CoreResult<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    if let Some(rest) = s.strip_prefix('-') {
        return parse_bytes(rest).map(|v| -v);
    }

    let invalid = || CoreError::InvalidSize(s.to_string());

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let unit = unit.trim_start().to_ascii_lowercase();
    let unit = unit.strip_suffix('b').unwrap_or(&unit);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let multiplier = match unit {
        "" => 1,
        "k" => KIB,
        "m" => MIB,
        "g" => GIB,
        "t" => TIB,
        "p" => PIB,
        _ => return Err(invalid()),
    };

    Ok((value * multiplier as f64) as i64)
}
