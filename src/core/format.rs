const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Index into `B, KB, MB, GB, TB` that `format_size` picks for `bytes`.
pub fn unit_index(bytes: u64) -> usize {
    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < UNITS.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    idx
}

/// Human-scaled size, e.g. `1536` -> `"1.5 KB"`.
///
/// The value is divided by 1024 until it drops below 1024 (capped at TB) and
/// rounded to two decimals. Whole numbers keep one decimal (`"40.0 MB"`).
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let idx = unit_index(bytes);
    let scaled = bytes as f64 / 1024f64.powi(idx as i32);
    let rounded = (scaled * 100.0).round() / 100.0;

    if rounded.fract() == 0.0 {
        format!("{:.1} {}", rounded, UNITS[idx])
    } else {
        format!("{} {}", rounded, UNITS[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bytes() {
        assert_eq!(format_size(0), "0 B");
    }

    #[test]
    fn test_exact_and_fractional_units() {
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(40 * 1024 * 1024), "40.0 MB");
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1_288_490_189), "1.2 GB");
    }

    #[test]
    fn test_rounds_to_two_decimals() {
        // 1234567 / 1024^2 = 1.1773...
        assert_eq!(format_size(1_234_567), "1.18 MB");
    }

    #[test]
    fn test_caps_at_terabytes() {
        let pb = 1024u64.pow(5);
        assert_eq!(format_size(pb), "1024.0 TB");
    }

    #[test]
    fn test_unit_index_is_monotonic() {
        let samples = [
            0u64,
            1,
            1023,
            1024,
            1025,
            1024 * 1024 - 1,
            1024 * 1024,
            5 * 1024 * 1024 * 1024,
            u64::MAX,
        ];
        for pair in samples.windows(2) {
            assert!(unit_index(pair[0]) <= unit_index(pair[1]));
        }
    }
}
