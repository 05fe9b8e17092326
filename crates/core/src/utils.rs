//! Small helpers shared across the workspace: size expressions, human-readable
//! sizes, and artifact ref name sanitization.

use crate::error::LoadError;

/// A user-configured size: either an absolute byte count or a percentage of
/// the cache volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeExpression {
    Bytes(u64),
    Percent(u8),
}

impl SizeExpression {
    /// Resolve against the total size of the target volume.
    pub fn resolve(self, volume_size: u64) -> u64 {
        match self {
            Self::Bytes(n) => n,
            Self::Percent(p) => volume_size / 100 * u64::from(p),
        }
    }
}

/// Parse a size expression: a positive integer with an optional `K`, `M`, `G`
/// or `T` suffix (powers of 1024), or a percentage `0`-`100` ending in `%`.
pub fn parse_size(text: &str) -> Result<SizeExpression, LoadError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(LoadError::invalid_data("Empty size expression"));
    }

    if let Some(percent) = text.strip_suffix('%') {
        let value: u8 = percent.trim().parse().map_err(|_| {
            LoadError::invalid_data(format!("Invalid percentage: '{text}'"))
        })?;
        if value > 100 {
            return Err(LoadError::invalid_data(format!(
                "Percentage out of range: '{text}'"
            )));
        }
        return Ok(SizeExpression::Percent(value));
    }

    let (number, multiplier) = match text.chars().last() {
        Some('K') => (&text[..text.len() - 1], 1u64 << 10),
        Some('M') => (&text[..text.len() - 1], 1u64 << 20),
        Some('G') => (&text[..text.len() - 1], 1u64 << 30),
        Some('T') => (&text[..text.len() - 1], 1u64 << 40),
        _ => (text, 1u64),
    };

    let value: u64 = number.trim().parse().map_err(|_| {
        LoadError::invalid_data(format!("Invalid size expression: '{text}'"))
    })?;

    value
        .checked_mul(multiplier)
        .map(SizeExpression::Bytes)
        .ok_or_else(|| LoadError::invalid_data(format!("Size expression overflows: '{text}'")))
}

/// Render a byte count for user messages, e.g. `12.50 MB`.
pub fn pretty_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Sanitize an element name for use as a ref path component.
///
/// Any character outside `[A-Za-z0-9._-]` becomes `_`, which keeps ref names
/// portable across filesystems while staying recognisable.
pub fn sanitize_element_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute_sizes() {
        assert_eq!(parse_size("800M").unwrap(), SizeExpression::Bytes(800 << 20));
        assert_eq!(parse_size("10G").unwrap(), SizeExpression::Bytes(10 << 30));
        assert_eq!(parse_size("1T").unwrap(), SizeExpression::Bytes(1 << 40));
        assert_eq!(parse_size("4096").unwrap(), SizeExpression::Bytes(4096));
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_size("50%").unwrap(), SizeExpression::Percent(50));
        assert_eq!(
            SizeExpression::Percent(50).resolve(1 << 40),
            (1u64 << 40) / 2
        );
        assert!(parse_size("150%").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("ten megabytes").is_err());
        assert!(parse_size("-5G").is_err());
    }

    #[test]
    fn test_pretty_size() {
        assert_eq!(pretty_size(512), "512 B");
        assert_eq!(pretty_size(5 << 20), "5.00 MB");
    }

    #[test]
    fn test_sanitize_element_name() {
        assert_eq!(sanitize_element_name("base/alpine.bst"), "base_alpine.bst");
        assert_eq!(sanitize_element_name("app-1.2_x"), "app-1.2_x");
    }
}
