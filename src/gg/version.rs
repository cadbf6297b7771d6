use once_cell::sync::Lazy;
use regex::Regex;

const MINIMUM_SUPPORTED_MAJOR: u32 = 6;

/// Version pattern inside `SELECT version()` output, e.g.
/// `... (Greengage Database 6.26.35_arenadata53 build 2625.gitac00af7.el7) ...`
static VERSION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\([^)]*?\b((\d+)\.(\d+)\.(\d+)(?:[_\-|+][A-Za-z0-9.]+)?)\b\s+build\b")
        .expect("valid greengage version regex")
});

/// A parsed Greengage server version.
///
/// Drives SQL dialect selection: v7 clusters renamed the WAL location
/// functions, dropped `pg_stat_activity.waiting`, and renamed the resource
/// group columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GreengageVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub raw: String,
}

impl GreengageVersion {
    pub fn new(major: u32, minor: u32, patch: u32, raw: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            patch,
            raw: raw.into(),
        }
    }

    /// Parse the output of `SELECT version()`. Returns `None` when the
    /// string does not carry a Greengage/Greenplum version marker.
    pub fn parse(version_string: &str) -> Option<Self> {
        let input = version_string.trim();
        if input.is_empty() {
            return None;
        }
        let captures = VERSION_REGEX.captures(input)?;
        let major = captures.get(2)?.as_str().parse().ok()?;
        let minor = captures.get(3)?.as_str().parse().ok()?;
        let patch = captures.get(4)?.as_str().parse().ok()?;
        Some(Self::new(major, minor, patch, input))
    }

    pub fn is_at_least_v7(&self) -> bool {
        self.major >= 7
    }

    pub fn is_supported(&self) -> bool {
        self.major >= MINIMUM_SUPPORTED_MAJOR
    }

    /// `major.minor.patch` without any build suffix.
    pub fn full_version(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    pub fn minimum_supported() -> u32 {
        MINIMUM_SUPPORTED_MAJOR
    }
}
