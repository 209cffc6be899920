//! Version-based feature gating.
//!
//! Version strings coming from custom resources are user input. An invalid or
//! missing version never fails a build: it is treated as unknown, which is
//! incompatible with every gate, and the affected features fall back to their
//! disabled path.

use std::{cmp::Ordering, fmt::Display};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `v2.45.0`, `2.45.0`, `2.45` and ignores pre-release and build
    /// metadata (`2.45.0-rc.1+abc` is `2.45.0`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        let core = raw.split(['-', '+']).next()?;

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(patch) => patch.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(Self::new(major, minor, patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A non-fatal notice that a requested feature was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub feature: String,
    pub current_version: String,
    pub minimum_version: Version,
}

impl Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ignoring '{}' not supported by Prometheus version {} (minimum required: {})",
            self.feature, self.current_version, self.minimum_version
        )
    }
}

/// Answers whether the Prometheus version being deployed supports a feature.
#[derive(Debug, Clone)]
pub struct VersionGate {
    raw: String,
    current: Option<Version>,
    minimum: Option<Version>,
}

impl VersionGate {
    pub fn new(current: &str) -> Self {
        Self {
            raw: current.to_string(),
            current: Version::parse(current),
            minimum: None,
        }
    }

    pub fn with_minimum_version(&self, minimum: Version) -> Self {
        Self {
            minimum: Some(minimum),
            ..self.clone()
        }
    }

    pub fn current(&self) -> Option<Version> {
        self.current
    }

    /// `true` when no minimum is set, otherwise `current >= minimum`. An
    /// unknown current version is never compatible with a minimum.
    pub fn is_compatible(&self) -> bool {
        match (self.current, self.minimum) {
            (_, None) => true,
            (Some(current), Some(minimum)) => current >= minimum,
            (None, Some(_)) => false,
        }
    }

    /// Logs and returns an advisory for a feature the gate rejected.
    pub fn warn(&self, feature: &str) -> Advisory {
        let advisory = Advisory {
            feature: feature.to_string(),
            current_version: self.raw.clone(),
            minimum_version: self.minimum.unwrap_or(Version::new(0, 0, 0)),
        };
        warn!(
            feature,
            version = %self.raw,
            minimum = %advisory.minimum_version,
            "feature not supported by this Prometheus version"
        );
        advisory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(Version::parse("v2.45.0"), Some(Version::new(2, 45, 0)));
        assert_eq!(Version::parse("2.45.1"), Some(Version::new(2, 45, 1)));
        assert_eq!(Version::parse("v2.45"), Some(Version::new(2, 45, 0)));
        assert_eq!(
            Version::parse("v3.0.0-rc.1+build.7"),
            Some(Version::new(3, 0, 0))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Version::parse(""), None);
        assert_eq!(Version::parse("latest"), None);
        assert_eq!(Version::parse("v2"), None);
        assert_eq!(Version::parse("1.2.3.4"), None);
        assert_eq!(Version::parse("v2.x.0"), None);
    }

    #[test]
    fn gate_is_inclusive_at_the_boundary() {
        let min = Version::new(2, 24, 0);
        assert!(VersionGate::new("v2.24.0").with_minimum_version(min).is_compatible());
        assert!(!VersionGate::new("v2.23.0").with_minimum_version(min).is_compatible());
        assert!(!VersionGate::new("v2.23.9").with_minimum_version(min).is_compatible());
        assert!(VersionGate::new("v3.0.0").with_minimum_version(min).is_compatible());
    }

    #[test]
    fn prerelease_compares_as_release() {
        let gate = VersionGate::new("v2.24.0-rc.0").with_minimum_version(Version::new(2, 24, 0));
        assert!(gate.is_compatible());
    }

    #[test]
    fn unknown_version_is_incompatible_but_not_fatal() {
        let gate = VersionGate::new("main").with_minimum_version(Version::new(2, 0, 0));
        assert!(!gate.is_compatible());

        let advisory = gate.warn("web.config.file");
        assert_eq!(advisory.feature, "web.config.file");
        assert_eq!(advisory.current_version, "main");
        assert_eq!(advisory.minimum_version, Version::new(2, 0, 0));
    }

    #[test]
    fn gate_without_minimum_is_compatible() {
        assert!(VersionGate::new("garbage").is_compatible());
    }
}
