//! Type information for registered kinds.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse group version: {0}")]
/// Failed to parse group version.
pub struct ParseGroupVersionError(pub String);

/// Core information about a kind of resource.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionKind {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Construct from explicit group, version, and kind
    pub fn gvk(group_: &str, version_: &str, kind_: &str) -> Self {
        let version = version_.to_string();
        let group = group_.to_string();
        let kind = kind_.to_string();

        Self { group, version, kind }
    }

    /// Construct from an `apiVersion` string and a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, ParseGroupVersionError> {
        let GroupVersion { group, version } = api_version.parse()?;
        Ok(Self {
            group,
            version,
            kind: kind.to_string(),
        })
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        GroupVersion::gv(&self.group, &self.version).api_version()
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Core information about a family of kinds
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
}

impl GroupVersion {
    /// Construct from explicit group and version
    pub fn gv(group_: &str, version_: &str) -> Self {
        let version = version_.to_string();
        let group = group_.to_string();
        Self { group, version }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    fn from_str(gv: &str) -> Result<Self, Self::Err> {
        let gvsplit = gv.splitn(2, '/').collect::<Vec<_>>();
        let (group, version) = match *gvsplit.as_slice() {
            [g, v] if !g.is_empty() && !v.is_empty() => (g.to_string(), v.to_string()),
            [v] if !v.is_empty() => (String::new(), v.to_string()), // core group
            _ => return Err(ParseGroupVersionError(gv.into())),
        };
        Ok(Self { group, version })
    }
}

#[cfg(test)]
mod tests {
    use super::{GroupVersion, GroupVersionKind, ParseGroupVersionError};

    #[test]
    fn parses_grouped_and_core_versions() {
        let gv: GroupVersion = "webapp.example.com/v1".parse().unwrap();
        assert_eq!(gv, GroupVersion::gv("webapp.example.com", "v1"));
        let core: GroupVersion = "v1".parse().unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
    }

    #[test]
    fn rejects_empty_segments() {
        assert_eq!(
            "/v1".parse::<GroupVersion>(),
            Err(ParseGroupVersionError("/v1".into()))
        );
        assert!("".parse::<GroupVersion>().is_err());
    }

    #[test]
    fn gvk_round_trips_through_api_version() {
        let gvk = GroupVersionKind::from_api_version("apps.example.com/v1alpha1", "MyResource").unwrap();
        assert_eq!(gvk.api_version(), "apps.example.com/v1alpha1");
        assert_eq!(gvk.to_string(), "apps.example.com/v1alpha1/MyResource");
    }
}
