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

use super::update::VersionComparator;
use super::{Locator, Package, PackageFilter};
use crate::infrastructure::constants::LABEL_INSTALLED;
use crate::shared::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait PackageService: Send + Sync {
    async fn list_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>>;

    async fn read_package(&self, locator: &Locator) -> Result<Package>;

    /// Adds `add` and drops `remove` from the package labels.
    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: &BTreeMap<String, String>,
        remove: &[String],
    ) -> Result<()>;

    /// The package of `repository/name` labelled as installed.
    async fn find_installed_package(&self, repository: &str, name: &str) -> Result<Package> {
        let filter = PackageFilter::new(repository, name).with_label(LABEL_INSTALLED, "true");
        let mut packages = self.list_packages(&filter).await?;
        match packages.len() {
            0 => Err(OpsError::not_found("installed package", format!("{}/{}", repository, name))),
            1 => Ok(packages.remove(0)),
            _ => Err(OpsError::precondition(format!(
                "more than one version of {}/{} is labelled installed",
                repository, name
            ))),
        }
    }

    /// Highest version matching `filter` under `comparator`.
    async fn find_latest_package(&self, filter: &PackageFilter, comparator: &dyn VersionComparator) -> Result<Package> {
        self.list_packages(filter)
            .await?
            .into_iter()
            .max_by(|a, b| comparator.compare(&a.locator.version, &b.locator.version))
            .ok_or_else(|| OpsError::not_found("package", filter.to_string()))
    }
}

/// Packages held in memory.
#[derive(Default)]
pub struct MemoryPackageService {
    packages: RwLock<BTreeMap<Locator, Package>>,
}

impl MemoryPackageService {
    pub fn new(packages: impl IntoIterator<Item = Package>) -> Self {
        Self {
            packages: RwLock::new(packages.into_iter().map(|p| (p.locator.clone(), p)).collect()),
        }
    }

    pub async fn snapshot(&self) -> Vec<Package> {
        self.packages.read().await.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl PackageService for MemoryPackageService {
    async fn list_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>> {
        Ok(self
            .packages
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn read_package(&self, locator: &Locator) -> Result<Package> {
        self.packages
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| OpsError::not_found("package", locator.to_string()))
    }

    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: &BTreeMap<String, String>,
        remove: &[String],
    ) -> Result<()> {
        let mut packages = self.packages.write().await;
        let package = packages
            .get_mut(locator)
            .ok_or_else(|| OpsError::not_found("package", locator.to_string()))?;
        for key in remove {
            package.labels.remove(key);
        }
        package.labels.extend(add.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    packages: Vec<Package>,
}

/// Packages listed in a YAML catalog file. Label changes are written back.
pub struct CatalogPackageService {
    path: PathBuf,
    inner: MemoryPackageService,
}

impl CatalogPackageService {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            OpsError::not_found("package catalog", format!("{}: {}", path.display(), e))
        })?;
        let catalog: Catalog = serde_yaml::from_str(&content)?;
        Ok(Self {
            path,
            inner: MemoryPackageService::new(catalog.packages),
        })
    }

    async fn persist(&self) -> Result<()> {
        let catalog = Catalog {
            packages: self.inner.snapshot().await,
        };
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, serde_yaml::to_string(&catalog)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PackageService for CatalogPackageService {
    async fn list_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>> {
        self.inner.list_packages(filter).await
    }

    async fn read_package(&self, locator: &Locator) -> Result<Package> {
        self.inner.read_package(locator).await
    }

    async fn update_package_labels(
        &self,
        locator: &Locator,
        add: &BTreeMap<String, String>,
        remove: &[String],
    ) -> Result<()> {
        self.inner.update_package_labels(locator, add, remove).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::package::SemverComparator;
    use tempfile::TempDir;

    fn pkg(locator: &str) -> Package {
        Package::new(locator.parse().unwrap())
    }

    #[tokio::test]
    async fn test_find_installed_and_latest() {
        let service = MemoryPackageService::new(vec![
            pkg("repo/app:1.1.0"),
            pkg("repo/app:1.2.0").with_label(LABEL_INSTALLED, "true"),
            pkg("repo/app:1.3.0"),
            pkg("repo/other:9.0.0"),
        ]);

        let installed = service.find_installed_package("repo", "app").await.unwrap();
        assert_eq!(installed.locator.to_string(), "repo/app:1.2.0");

        let latest = service
            .find_latest_package(&PackageFilter::new("repo", "app"), &SemverComparator)
            .await
            .unwrap();
        assert_eq!(latest.locator.to_string(), "repo/app:1.3.0");

        assert!(service.find_installed_package("repo", "other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_catalog_persists_labels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            "packages:\n  - locator: repo/app:1.2.0\n    labels:\n      installed: \"true\"\n  - locator: repo/app:1.3.0\n",
        )
        .unwrap();

        let service = CatalogPackageService::open(&path).await.unwrap();
        let target: Locator = "repo/app:1.3.0".parse().unwrap();
        let mut add = BTreeMap::new();
        add.insert(LABEL_INSTALLED.to_string(), "true".to_string());
        service.update_package_labels(&target, &add, &[]).await.unwrap();

        let reopened = CatalogPackageService::open(&path).await.unwrap();
        assert!(reopened.read_package(&target).await.unwrap().labels.contains_key(LABEL_INSTALLED));
    }
}
