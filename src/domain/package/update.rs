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

//! Update candidate selection for an installed package and its paired
//! configuration package
//!
//! The same comparator decides both which candidate is the best and whether
//! it is newer than the installed version, so search and apply can never
//! disagree and bounce between versions.

use super::service::PackageService;
use super::{Locator, PackageFilter};
use crate::infrastructure::constants::LABEL_INSTALLED;
use crate::shared::error::{OpsError, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn, Span};

pub trait VersionComparator: Send + Sync {
    fn compare(&self, a: &Version, b: &Version) -> Ordering;

    fn is_newer(&self, candidate: &Version, installed: &Version) -> bool {
        self.compare(candidate, installed) == Ordering::Greater
    }
}

/// Semantic version precedence. Build metadata is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemverComparator;

impl VersionComparator for SemverComparator {
    fn compare(&self, a: &Version, b: &Version) -> Ordering {
        a.cmp_precedence(b)
    }
}

/// Semantic version precedence, with build metadata breaking ties between
/// otherwise equal versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildMetadataComparator;

impl VersionComparator for BuildMetadataComparator {
    fn compare(&self, a: &Version, b: &Version) -> Ordering {
        a.cmp_precedence(b).then_with(|| a.build.cmp(&b.build))
    }
}

/// Paired configuration package, resolved in lockstep with the runtime one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigUpdateRequest {
    pub installed: Locator,
    pub target: Option<Locator>,
}

#[derive(Clone)]
pub struct PackageUpdateRequest {
    pub installed: Locator,
    /// Search filter. Derived from `installed` when not given.
    pub filter: Option<PackageFilter>,
    /// Explicit update target. Takes precedence over searching.
    pub target: Option<Locator>,
    /// Labels put on the new package once applied.
    pub labels: BTreeMap<String, String>,
    pub config: Option<ConfigUpdateRequest>,
    /// Defaults to [`SemverComparator`].
    pub comparator: Option<Arc<dyn VersionComparator>>,
    /// Accept an explicit target that is not newer than the installed one.
    pub skip_version_check: bool,
}

impl PackageUpdateRequest {
    pub fn new(installed: Locator) -> Self {
        Self {
            installed,
            filter: None,
            target: None,
            labels: BTreeMap::new(),
            config: None,
            comparator: None,
            skip_version_check: false,
        }
    }

    pub fn with_target(mut self, target: Locator) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_config(mut self, config: ConfigUpdateRequest) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A resolved update: `from` is replaced by `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub from: Locator,
    pub to: Locator,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Box<PackageUpdate>>,
}

impl PackageUpdate {
    /// Runtime update first, then the paired config update.
    pub fn steps(&self) -> Vec<&PackageUpdate> {
        let mut steps = vec![self];
        if let Some(config) = &self.config {
            steps.push(config);
        }
        steps
    }
}

async fn resolve_one(
    service: &dyn PackageService,
    installed: &Locator,
    filter: &PackageFilter,
    target: Option<&Locator>,
    comparator: &dyn VersionComparator,
    skip_version_check: bool,
) -> Result<Locator> {
    let candidate = match target {
        Some(target) => {
            if !target.same_package(installed) && filter.name == installed.name {
                return Err(OpsError::bad_parameter(format!(
                    "update target {} is not a version of {}",
                    target, installed
                )));
            }
            service.read_package(target).await?.locator
        }
        None => service.find_latest_package(filter, comparator).await?.locator,
    };

    let explicit = target.is_some() && skip_version_check;
    if !explicit && !comparator.is_newer(&candidate.version, &installed.version) {
        return Err(OpsError::not_found(
            "package update",
            format!("{} is already at {} or newer", installed, candidate.version),
        ));
    }
    Ok(candidate)
}

/// Finds the update for `request.installed`, together with the paired config
/// package update when one is requested and available.
pub async fn find_package_update(service: &dyn PackageService, request: &PackageUpdateRequest) -> Result<PackageUpdate> {
    let comparator: Arc<dyn VersionComparator> = request
        .comparator
        .clone()
        .unwrap_or_else(|| Arc::new(SemverComparator));
    let filter = request
        .filter
        .clone()
        .unwrap_or_else(|| PackageFilter::for_locator(&request.installed));

    let to = resolve_one(
        service,
        &request.installed,
        &filter,
        request.target.as_ref(),
        comparator.as_ref(),
        request.skip_version_check,
    )
    .await?;

    let config = match &request.config {
        None => None,
        Some(config) => {
            let filter = PackageFilter::for_locator(&config.installed);
            match resolve_one(
                service,
                &config.installed,
                &filter,
                config.target.as_ref(),
                comparator.as_ref(),
                request.skip_version_check,
            )
            .await
            {
                Ok(to) => Some(Box::new(PackageUpdate {
                    from: config.installed.clone(),
                    to,
                    labels: request.labels.clone(),
                    config: None,
                })),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            }
        }
    };

    Ok(PackageUpdate {
        from: request.installed.clone(),
        to,
        labels: request.labels.clone(),
        config,
    })
}

async fn relabel(service: &dyn PackageService, from: &Locator, to: &Locator, labels: &BTreeMap<String, String>) -> Result<()> {
    let mut add = labels.clone();
    add.insert(LABEL_INSTALLED.to_string(), "true".to_string());
    service.update_package_labels(to, &add, &[]).await?;

    let mut remove: Vec<String> = labels.keys().cloned().collect();
    remove.push(LABEL_INSTALLED.to_string());
    service.update_package_labels(from, &BTreeMap::new(), &remove).await
}

/// Marks every package of `update` installed in one transaction: if a step
/// fails, the steps already applied are reverted.
pub async fn apply_package_update(service: &dyn PackageService, update: &PackageUpdate, span: &Span) -> Result<()> {
    let steps = update.steps();
    let mut applied: Vec<&PackageUpdate> = Vec::new();

    for step in &steps {
        if let Err(e) = relabel(service, &step.from, &step.to, &step.labels).await {
            warn!(parent: span, error = %e, package = %step.to, "package update failed, reverting");
            for done in applied.iter().rev() {
                if let Err(revert_err) = relabel(service, &done.to, &done.from, &done.labels).await {
                    warn!(parent: span, error = %revert_err, package = %done.from, "failed to revert package update");
                }
            }
            // The failed step may have labelled its target already.
            if let Err(revert_err) = relabel(service, &step.to, &step.from, &step.labels).await {
                warn!(parent: span, error = %revert_err, package = %step.from, "failed to revert package update");
            }
            return Err(e);
        }
        info!(parent: span, from = %step.from, to = %step.to, "package updated");
        applied.push(step);
    }
    Ok(())
}

/// Reverses a previously applied update.
pub async fn revert_package_update(service: &dyn PackageService, update: &PackageUpdate, span: &Span) -> Result<()> {
    let reversed = PackageUpdate {
        from: update.to.clone(),
        to: update.from.clone(),
        labels: update.labels.clone(),
        config: update.config.as_ref().map(|c| {
            Box::new(PackageUpdate {
                from: c.to.clone(),
                to: c.from.clone(),
                labels: c.labels.clone(),
                config: None,
            })
        }),
    };
    apply_package_update(service, &reversed, span).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::package::{MemoryPackageService, Package};

    fn loc(s: &str) -> Locator {
        s.parse().unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_comparators() {
        assert!(SemverComparator.is_newer(&v("1.3.0"), &v("1.2.0")));
        assert!(!SemverComparator.is_newer(&v("1.2.0+b2"), &v("1.2.0+b1")));
        assert!(BuildMetadataComparator.is_newer(&v("1.2.0+b2"), &v("1.2.0+b1")));
        assert!(!BuildMetadataComparator.is_newer(&v("1.2.0+b9"), &v("1.3.0")));
        assert!(!SemverComparator.is_newer(&v("1.3.0-rc.1"), &v("1.3.0")));
    }

    #[tokio::test]
    async fn test_explicit_target_override() {
        let service = MemoryPackageService::new(vec![
            Package::new(loc("repo/app:1.2.0")),
            Package::new(loc("repo/app:1.3.0")),
            Package::new(loc("repo/app:1.4.0")),
        ]);

        let request = PackageUpdateRequest::new(loc("repo/app:1.2.0")).with_target(loc("repo/app:1.3.0"));
        let update = find_package_update(&service, &request).await.unwrap();
        assert_eq!(update.to, loc("repo/app:1.3.0"));

        let downgrade = PackageUpdateRequest::new(loc("repo/app:1.3.0")).with_target(loc("repo/app:1.2.0"));
        assert!(find_package_update(&service, &downgrade).await.unwrap_err().is_not_found());

        let mut forced = downgrade.clone();
        forced.skip_version_check = true;
        assert_eq!(find_package_update(&service, &forced).await.unwrap().to, loc("repo/app:1.2.0"));
    }

    #[tokio::test]
    async fn test_build_metadata_tiebreak() {
        let service = MemoryPackageService::new(vec![
            Package::new(loc("repo/app:1.2.0+b1")),
            Package::new(loc("repo/app:1.2.0+b3")),
        ]);
        let request = PackageUpdateRequest::new(loc("repo/app:1.2.0+b1"));
        assert!(find_package_update(&service, &request).await.unwrap_err().is_not_found());

        let request = request.with_comparator(Arc::new(BuildMetadataComparator));
        let update = find_package_update(&service, &request).await.unwrap();
        assert_eq!(update.to, loc("repo/app:1.2.0+b3"));
    }
}
