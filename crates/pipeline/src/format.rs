//! Human-readable formatting helpers for sizes and durations.

use std::time::Duration;

/// Formats a byte count with binary units (B, KB, MB, GB, TB, PB).
pub fn human_size(size_bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    const FACTOR: f64 = 1024.0;

    if size_bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = size_bytes as f64;
    for unit in UNITS {
        if size < FACTOR {
            if *unit == "B" {
                return format!("{} {}", size_bytes, unit);
            }
            return format!("{:.2} {}", size, unit).replace(".00 ", " ");
        }
        size /= FACTOR;
    }
    format!("{:.2} {}", size, UNITS[UNITS.len() - 1])
}

/// Formats a duration as `HH:MM:SS`.
pub fn format_hms(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size_units() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(2 * 1024 * 1024), "2 MB");
        assert_eq!(human_size(22_548_578_304), "21 GB");
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_hms(Duration::from_secs(7261)), "02:01:01");
        assert_eq!(format_hms(Duration::from_secs(86400)), "24:00:00");
    }
}
