//! Shared helpers for collectors: "unknown" defaulting for absent columns,
//! the numeric encodings of categorical segment states, and skew rollups.

/// Substitute for absent categorical values. Part of the external metric
/// contract: absent `application_name`, database names etc. surface as the
/// literal label value `unknown`.
pub const UNKNOWN: &str = "unknown";

/// Returns the value, or `"unknown"` when the column was NULL.
pub fn or_unknown(value: Option<String>) -> String {
    value.unwrap_or_else(|| UNKNOWN.to_string())
}

/// Segment status: `u` (up) maps to 1.0, anything else (including absent)
/// to 0.0.
pub fn segment_status_value(status: Option<&str>) -> f64 {
    match status {
        Some(s) if s.eq_ignore_ascii_case("u") => 1.0,
        _ => 0.0,
    }
}

/// Segment role: `p` (primary) maps to 1.0, anything else to 2.0 (mirror).
pub fn segment_role_value(role: Option<&str>) -> f64 {
    match role {
        Some(r) if r.eq_ignore_ascii_case("p") => 1.0,
        _ => 2.0,
    }
}

/// Segment mode: 1.0 synchronized, 2.0 resyncing, 3.0 change tracking,
/// 4.0 not syncing (also the default for absent), 0.0 unrecognized.
pub fn segment_mode_value(mode: Option<&str>) -> f64 {
    let Some(mode) = mode else {
        return 4.0;
    };
    match mode.to_ascii_lowercase().as_str() {
        "s" => 1.0,
        "r" => 2.0,
        "c" => 3.0,
        "n" => 4.0,
        _ => 0.0,
    }
}

/// Max/avg rollup over per-host samples. The skew ratio `max / avg` reads
/// 1.0 for a balanced cluster and grows with imbalance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SkewStats {
    pub max: f64,
    pub avg: f64,
}

impl SkewStats {
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut max = 0.0f64;
        let mut sum = 0.0f64;
        let mut count = 0u32;
        for value in values {
            max = max.max(value);
            sum += value;
            count += 1;
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            max,
            avg: sum / f64::from(count),
        }
    }

    pub fn skew_ratio(&self) -> f64 {
        if self.avg > 0.0 { self.max / self.avg } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_unknown() {
        assert_eq!(or_unknown(None), "unknown");
        assert_eq!(or_unknown(Some("mydb".into())), "mydb");
        // empty strings pass through untouched
        assert_eq!(or_unknown(Some(String::new())), "");
    }

    #[test]
    fn test_status_values() {
        assert_eq!(segment_status_value(Some("u")), 1.0);
        assert_eq!(segment_status_value(Some("U")), 1.0);
        assert_eq!(segment_status_value(Some("d")), 0.0);
        assert_eq!(segment_status_value(Some("x")), 0.0);
        assert_eq!(segment_status_value(None), 0.0);
    }

    #[test]
    fn test_role_values() {
        assert_eq!(segment_role_value(Some("p")), 1.0);
        assert_eq!(segment_role_value(Some("P")), 1.0);
        assert_eq!(segment_role_value(Some("m")), 2.0);
        assert_eq!(segment_role_value(Some("anything")), 2.0);
        assert_eq!(segment_role_value(None), 2.0);
    }

    #[test]
    fn test_mode_values() {
        assert_eq!(segment_mode_value(Some("s")), 1.0);
        assert_eq!(segment_mode_value(Some("r")), 2.0);
        assert_eq!(segment_mode_value(Some("c")), 3.0);
        assert_eq!(segment_mode_value(Some("n")), 4.0);
        assert_eq!(segment_mode_value(Some("S")), 1.0);
        assert_eq!(segment_mode_value(None), 4.0);
        assert_eq!(segment_mode_value(Some("z")), 0.0);
    }

    #[test]
    fn test_skew_stats_balanced() {
        let stats = SkewStats::of([10.0, 10.0, 10.0]);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.avg, 10.0);
        assert_eq!(stats.skew_ratio(), 1.0);
    }

    #[test]
    fn test_skew_stats_imbalanced() {
        let stats = SkewStats::of([30.0, 10.0, 20.0]);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.avg, 20.0);
        assert_eq!(stats.skew_ratio(), 1.5);
    }

    #[test]
    fn test_skew_stats_empty() {
        let stats = SkewStats::of([]);
        assert_eq!(stats.max, 0.0);
        assert_eq!(stats.avg, 0.0);
        assert_eq!(stats.skew_ratio(), 0.0);
    }
}
