//! Utility functions for needlefs

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Ensure a URL has a scheme for outbound requests
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Free-space floor for a storage directory.
///
/// A bare number is a percentage of the filesystem; a number with a byte
/// unit suffix is an absolute floor. Both may be set; either one tripping
/// marks the disk low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MinFreeSpace {
    pub percent: f32,
    pub bytes: u64,
}

impl MinFreeSpace {
    pub fn parse(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        if let Ok(percent) = s.parse::<f32>() {
            if !(0.0..=100.0).contains(&percent) {
                return Err(crate::Error::InvalidConfig(format!(
                    "min free space percentage out of range: {}",
                    s
                )));
            }
            return Ok(Self {
                percent,
                bytes: 0,
            });
        }
        let bytes = parse_byte_size(s)?;
        Ok(Self { percent: 0.0, bytes })
    }

    /// Evaluate the policy against a free-space sample.
    pub fn is_low(&self, free_bytes: u64, percent_free: f32) -> (bool, String) {
        if self.bytes > 0 && free_bytes < self.bytes {
            return (
                true,
                format!(
                    "free space {} is below {}",
                    format_bytes(free_bytes),
                    format_bytes(self.bytes)
                ),
            );
        }
        if self.percent > 0.0 && percent_free < self.percent {
            return (
                true,
                format!(
                    "free space {:.1}% is below {:.1}%",
                    percent_free, self.percent
                ),
            );
        }
        (
            false,
            format!("free space {} ({:.1}%)", format_bytes(free_bytes), percent_free),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.percent > 0.0 || self.bytes > 0
    }
}

/// Parse a byte size like "10GiB", "500MB", or "1024"
pub fn parse_byte_size(s: &str) -> crate::Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.');
    let (num_str, unit) = match split {
        Some(idx) => (&s[..idx], s[idx..].trim()),
        None => (s, ""),
    };
    let num: f64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid byte size: {}", s)))?;
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024u64.pow(4),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown byte size unit: {}",
                unit
            )))
        }
    };
    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(normalize_url("http://a:1"), "http://a:1");
        assert_eq!(normalize_url("https://a:1"), "https://a:1");
    }

    #[test]
    fn test_min_free_space_percent() {
        let m = MinFreeSpace::parse("7").unwrap();
        assert_eq!(m.percent, 7.0);
        assert_eq!(m.bytes, 0);

        let (low, _) = m.is_low(1 << 30, 3.0);
        assert!(low);
        let (low, _) = m.is_low(1 << 30, 20.0);
        assert!(!low);
    }

    #[test]
    fn test_min_free_space_bytes() {
        let m = MinFreeSpace::parse("10GiB").unwrap();
        assert_eq!(m.bytes, 10 * 1024 * 1024 * 1024);

        let (low, desc) = m.is_low(1024 * 1024, 50.0);
        assert!(low);
        assert!(desc.contains("below"));
    }

    #[test]
    fn test_min_free_space_empty() {
        let m = MinFreeSpace::parse("").unwrap();
        assert!(!m.is_configured());
        let (low, _) = m.is_low(0, 0.0);
        assert!(!low);
    }

    #[test]
    fn test_parse_byte_size_invalid() {
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("10XB").is_err());
        assert!(MinFreeSpace::parse("150").is_err());
    }
}
