// Copyright 2025 JiangLong.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Package lookup and update resolution

pub mod executor;
pub mod service;
pub mod update;

pub use self::executor::{PackageLabelExecutor, EXECUTOR_PACKAGES};
pub use self::service::{CatalogPackageService, MemoryPackageService, PackageService};
pub use self::update::{
    apply_package_update, find_package_update, revert_package_update, BuildMetadataComparator, ConfigUpdateRequest, PackageUpdate,
    PackageUpdateRequest, SemverComparator, VersionComparator,
};

use crate::shared::error::{OpsError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// `repository/name:version`, e.g. `gravitational.io/planet:7.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: semver::Version,
}

impl Locator {
    pub fn new(repository: impl Into<String>, name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version,
        }
    }

    /// Whether `other` is the same package, ignoring the version.
    pub fn same_package(&self, other: &Locator) -> bool {
        self.repository == other.repository && self.name == other.name
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl FromStr for Locator {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        let (path, version) = s
            .rsplit_once(':')
            .ok_or_else(|| OpsError::bad_parameter(format!("invalid package locator '{}': missing version", s)))?;
        let (repository, name) = path
            .rsplit_once('/')
            .ok_or_else(|| OpsError::bad_parameter(format!("invalid package locator '{}': missing repository", s)))?;
        if repository.is_empty() || name.is_empty() {
            return Err(OpsError::bad_parameter(format!("invalid package locator '{}'", s)));
        }
        Ok(Self::new(repository, name, semver::Version::parse(version)?))
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Package {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// Selects packages by repository, name and labels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageFilter {
    pub repository: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PackageFilter {
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn for_locator(locator: &Locator) -> Self {
        Self::new(&locator.repository, &locator.name)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, package: &Package) -> bool {
        package.locator.repository == self.repository
            && package.locator.name == self.name
            && package.has_labels(&self.labels)
    }
}

impl fmt::Display for PackageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.name)?;
        if !self.labels.is_empty() {
            let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, " [{}]", labels.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locator() {
        let loc: Locator = "gravitational.io/planet:7.0.1-build.2".parse().unwrap();
        assert_eq!(loc.repository, "gravitational.io");
        assert_eq!(loc.name, "planet");
        assert_eq!(loc.version, semver::Version::parse("7.0.1-build.2").unwrap());
        assert_eq!(loc.to_string(), "gravitational.io/planet:7.0.1-build.2");

        assert!("planet:1.0.0".parse::<Locator>().is_err());
        assert!("repo/planet".parse::<Locator>().is_err());
        assert!(matches!("repo/planet:x".parse::<Locator>(), Err(OpsError::Version(_))));
    }

    #[test]
    fn test_filter_matches_labels() {
        let pkg = Package::new("repo/app:1.0.0".parse().unwrap()).with_label("purpose", "runtime");
        assert!(PackageFilter::new("repo", "app").matches(&pkg));
        assert!(PackageFilter::new("repo", "app").with_label("purpose", "runtime").matches(&pkg));
        assert!(!PackageFilter::new("repo", "app").with_label("purpose", "config").matches(&pkg));
        assert!(!PackageFilter::new("repo", "other").matches(&pkg));
    }
}
