//! Semantic versions of the managed package.
//!
//! Versions are accepted with or without a leading `v` and always stored
//! in normalized form (`1.2.0`). Tags on the source host are derived by
//! prepending the configured tag prefix.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid semantic version '{input}': {reason}")]
    Invalid { input: String, reason: String },
}

/// A parsed semantic version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion(semver::Version);

impl PackageVersion {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let bare = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        semver::Version::parse(bare)
            .map(Self)
            .map_err(|e| VersionError::Invalid {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Source-host tag for this version.
    pub fn tag(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// Strictly newer than `current`, ignoring build metadata.
    pub fn is_upgrade_from(&self, current: &PackageVersion) -> bool {
        self.0.cmp_precedence(&current.0) == Ordering::Greater
    }

    pub fn inner(&self) -> &semver::Version {
        &self.0
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageVersion> for String {
    fn from(v: PackageVersion) -> Self {
        v.to_string()
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_prefix() {
        assert_eq!(PackageVersion::parse("v1.2.0").unwrap().to_string(), "1.2.0");
        assert_eq!(PackageVersion::parse("1.2.0").unwrap().to_string(), "1.2.0");
        assert_eq!(
            PackageVersion::parse(" 2.0.0-rc.1 ").unwrap().to_string(),
            "2.0.0-rc.1"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "1.2", "v1", "1.2.x", "latest", "1.2.0/../../etc"] {
            assert!(PackageVersion::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_upgrade_comparison() {
        let v110 = PackageVersion::parse("1.1.0").unwrap();
        let v120 = PackageVersion::parse("1.2.0").unwrap();
        let rc = PackageVersion::parse("1.2.0-rc.1").unwrap();
        assert!(v120.is_upgrade_from(&v110));
        assert!(!v110.is_upgrade_from(&v120));
        assert!(!v120.is_upgrade_from(&v120));
        assert!(rc.is_upgrade_from(&v110));
        assert!(v120.is_upgrade_from(&rc));
        assert!(rc.is_prerelease());
    }

    #[test]
    fn test_tag() {
        let v = PackageVersion::parse("1.2.0").unwrap();
        assert_eq!(v.tag("v"), "v1.2.0");
        assert_eq!(v.tag(""), "1.2.0");
    }

    #[test]
    fn test_serde_as_string() {
        let v = PackageVersion::parse("v3.4.5").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"3.4.5\"");
        let back: PackageVersion = serde_json::from_str("\"3.4.5\"").unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_str::<PackageVersion>("\"nope\"").is_err());
    }
}
