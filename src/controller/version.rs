//! Astarte version parsing and constraint evaluation.
//!
//! Astarte versions are semantic versions, with a few accepted shorthands:
//! - `1.0` is read as `1.0.0`
//! - `snapshot` and `<major>.<minor>-snapshot` denote development builds
//!
//! Range checks always run against the version with prerelease and build
//! metadata stripped (`0.11.0-rc.1` is checked as `0.11.0`), while the
//! original string is kept for persistence into status.

use std::fmt;
use std::str::FromStr;

use semver::{BuildMetadata, Prerelease, Version, VersionReq};
use thiserror::Error;

/// Range of Astarte versions this operator can manage.
pub const SUPPORTED_VERSION_RANGE: &str = ">= 0.10.0, < 1.1.0";

/// Marker for development builds of Astarte.
pub const SNAPSHOT_SENTINEL: &str = "snapshot";

/// Errors raised while parsing versions or constraints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("invalid version constraint '{constraint}': {reason}")]
    InvalidConstraint { constraint: String, reason: String },
}

/// A parsed Astarte version that remembers the string it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstarteVersion {
    original: String,
    /// Semantic version; `None` only for the bare `snapshot` sentinel.
    base: Option<Version>,
    snapshot: bool,
}

impl AstarteVersion {
    /// Parse a version string.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid(input, "empty version string"));
        }

        if trimmed.eq_ignore_ascii_case(SNAPSHOT_SENTINEL) {
            return Ok(Self {
                original: trimmed.to_string(),
                base: None,
                snapshot: true,
            });
        }

        let unprefixed = trimmed.strip_prefix('v').unwrap_or(trimmed);

        if let Some(core) = unprefixed.strip_suffix("-snapshot") {
            let base = parse_semver(&expand_short(core))
                .map_err(|reason| invalid(input, &reason))?;
            return Ok(Self {
                original: trimmed.to_string(),
                base: Some(base),
                snapshot: true,
            });
        }

        let base =
            parse_semver(&expand_short(unprefixed)).map_err(|reason| invalid(input, &reason))?;

        Ok(Self {
            original: trimmed.to_string(),
            base: Some(base),
            snapshot: false,
        })
    }

    /// The string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Whether this is a development (snapshot) build.
    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// Full semantic version, including prerelease tags.
    pub fn semver(&self) -> Option<&Version> {
        self.base.as_ref()
    }

    /// Version used for range checks: prerelease and build metadata stripped.
    pub fn comparable(&self) -> Option<Version> {
        self.base.as_ref().map(strip_prerelease)
    }

    /// Check the version against a constraint. The bare snapshot sentinel
    /// satisfies no constraint.
    pub fn satisfies(&self, constraint: &VersionReq) -> bool {
        self.comparable().is_some_and(|v| constraint.matches(&v))
    }
}

impl FromStr for AstarteVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AstarteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

fn invalid(version: &str, reason: &str) -> VersionError {
    VersionError::InvalidVersion {
        version: version.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_semver(s: &str) -> Result<Version, String> {
    Version::parse(s).map_err(|e| e.to_string())
}

/// Expand `1` / `1.0` (optionally followed by `-pre` or `+build`) to a full
/// `major.minor.patch` core.
fn expand_short(s: &str) -> String {
    let split_at = s.find(['-', '+']).unwrap_or(s.len());
    let (core, rest) = s.split_at(split_at);
    match core.matches('.').count() {
        0 => format!("{}.0.0{}", core, rest),
        1 => format!("{}.0{}", core, rest),
        _ => s.to_string(),
    }
}

/// Drop prerelease and build metadata from a version.
pub fn strip_prerelease(version: &Version) -> Version {
    let mut stripped = version.clone();
    stripped.pre = Prerelease::EMPTY;
    stripped.build = BuildMetadata::EMPTY;
    stripped
}

/// Parse a constraint expression such as `>= 0.10.0, < 0.11.0`.
pub fn parse_constraint(constraint: &str) -> Result<VersionReq, VersionError> {
    VersionReq::parse(constraint).map_err(|e| VersionError::InvalidConstraint {
        constraint: constraint.to_string(),
        reason: e.to_string(),
    })
}

/// Check a version string against a constraint string.
pub fn satisfies(version: &str, constraint: &str) -> Result<bool, VersionError> {
    let version = AstarteVersion::parse(version)?;
    let constraint = parse_constraint(constraint)?;
    Ok(version.satisfies(&constraint))
}

/// Version of this operator build.
pub fn operator_version() -> Version {
    Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0))
}

/// Whether this operator build can manage the given Astarte version.
pub fn is_manageable(version: &AstarteVersion) -> bool {
    is_manageable_with(version, &operator_version())
}

/// Whether an operator of version `operator` can manage `version`.
///
/// Snapshot installations are manageable only by prerelease operator builds;
/// stable operator builds refuse them.
pub fn is_manageable_with(version: &AstarteVersion, operator: &Version) -> bool {
    if version.is_snapshot() {
        return !operator.pre.is_empty();
    }

    match parse_constraint(SUPPORTED_VERSION_RANGE) {
        Ok(supported) => version.satisfies(&supported),
        Err(e) => {
            tracing::error!(error = %e, "Supported version range does not parse");
            false
        }
    }
}

/// Whether moving from `old` to `new` goes backwards.
///
/// Snapshot builds have no ordering with respect to releases and are never
/// considered downgrades.
pub fn is_downgrade(old: &AstarteVersion, new: &AstarteVersion) -> bool {
    if old.is_snapshot() || new.is_snapshot() {
        return false;
    }
    match (old.comparable(), new.comparable()) {
        (Some(old), Some(new)) => new < old,
        _ => false,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    fn v(s: &str) -> AstarteVersion {
        AstarteVersion::parse(s).unwrap()
    }

    fn req(s: &str) -> VersionReq {
        parse_constraint(s).unwrap()
    }

    #[test]
    fn test_parse_full_version() {
        let version = v("0.11.0-rc.1");
        assert_eq!(version.as_str(), "0.11.0-rc.1");
        assert_eq!(version.semver().unwrap().pre.as_str(), "rc.1");
        assert_eq!(version.comparable().unwrap(), Version::new(0, 11, 0));
        assert!(!version.is_snapshot());
    }

    #[test]
    fn test_parse_short_versions() {
        assert_eq!(v("1.0").comparable().unwrap(), Version::new(1, 0, 0));
        assert_eq!(v("1").comparable().unwrap(), Version::new(1, 0, 0));
        assert_eq!(v("v0.10.2").comparable().unwrap(), Version::new(0, 10, 2));
        assert_eq!(
            v("1.0-rc.0").semver().unwrap(),
            &Version::parse("1.0.0-rc.0").unwrap()
        );
    }

    #[test]
    fn test_parse_snapshot() {
        let bare = v("snapshot");
        assert!(bare.is_snapshot());
        assert!(bare.semver().is_none());

        let based = v("1.1-snapshot");
        assert!(based.is_snapshot());
        assert_eq!(based.comparable().unwrap(), Version::new(1, 1, 0));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            AstarteVersion::parse(""),
            Err(VersionError::InvalidVersion { .. })
        ));
        assert!(AstarteVersion::parse("latest").is_err());
        assert!(AstarteVersion::parse("1.x.0").is_err());
        assert!(AstarteVersion::parse("-snapshot").is_err());
    }

    #[test]
    fn test_prerelease_stripped_for_range_checks() {
        let version = v("0.11.0-rc.1");
        assert!(!version.satisfies(&req("< 0.11.0")));
        assert!(version.satisfies(&req(">= 0.11.0")));
    }

    #[test]
    fn test_satisfies_strings() {
        assert!(satisfies("0.10.5", ">= 0.10.0, < 0.11.0").unwrap());
        assert!(!satisfies("0.11.0", ">= 0.10.0, < 0.11.0").unwrap());
        assert!(satisfies("not-a-version", ">= 0.10.0").is_err());
        assert!(matches!(
            satisfies("0.10.0", "between 1 and 2"),
            Err(VersionError::InvalidConstraint { .. })
        ));
    }

    #[test]
    fn test_bare_snapshot_satisfies_nothing() {
        assert!(!v("snapshot").satisfies(&req(">= 0.0.0")));
    }

    #[test]
    fn test_manageable_range() {
        let stable = Version::new(1, 0, 0);
        assert!(is_manageable_with(&v("0.10.0"), &stable));
        assert!(is_manageable_with(&v("0.11.4"), &stable));
        assert!(is_manageable_with(&v("1.0.3"), &stable));
        assert!(is_manageable_with(&v("1.0.0-rc.1"), &stable));
        assert!(!is_manageable_with(&v("0.9.9"), &stable));
        assert!(!is_manageable_with(&v("1.1.0"), &stable));
    }

    #[test]
    fn test_snapshot_requires_prerelease_operator() {
        let stable = Version::new(1, 0, 0);
        let dev = Version::parse("1.1.0-dev").unwrap();

        assert!(!is_manageable_with(&v("snapshot"), &stable));
        assert!(!is_manageable_with(&v("1.1-snapshot"), &stable));
        assert!(is_manageable_with(&v("snapshot"), &dev));
        assert!(is_manageable_with(&v("1.1-snapshot"), &dev));
    }

    #[test]
    fn test_is_downgrade() {
        assert!(is_downgrade(&v("1.0.0"), &v("0.11.4")));
        assert!(!is_downgrade(&v("0.11.4"), &v("1.0.0")));
        assert!(!is_downgrade(&v("0.11.0"), &v("0.11.0-rc.1")));
        assert!(!is_downgrade(&v("1.0.0"), &v("snapshot")));
    }
}
