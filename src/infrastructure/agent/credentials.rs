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

use crate::infrastructure::constants::AGENT_TOKEN_FILE;
use crate::shared::error::{OpsError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Shared secret presented to node agents.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_path(secrets_dir: &Path) -> PathBuf {
        secrets_dir.join(AGENT_TOKEN_FILE)
    }

    /// Reads the token bootstrapped under `secrets_dir`.
    pub fn load(secrets_dir: &Path) -> Result<Self> {
        let path = Self::token_path(secrets_dir);
        let token = std::fs::read_to_string(&path).map_err(|e| {
            OpsError::AccessDenied(format!(
                "agent credentials not readable at {}: {}. Run 'opsctl agent bootstrap' first",
                path.display(),
                e
            ))
        })?;

        let token = token.trim();
        if token.is_empty() {
            return Err(OpsError::AccessDenied(format!(
                "agent credentials at {} are empty",
                path.display()
            )));
        }
        Ok(Self::new(token))
    }

    /// Writes a fresh token. Fails if one already exists unless `overwrite`.
    pub fn bootstrap(secrets_dir: &Path, overwrite: bool) -> Result<Self> {
        let path = Self::token_path(secrets_dir);
        if path.exists() && !overwrite {
            return Err(OpsError::already_exists("agent token", path.display().to_string()));
        }

        std::fs::create_dir_all(secrets_dir)?;
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        std::fs::write(&path, &token)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self::new(token))
    }

    /// Compares without short-circuiting on the first differing byte.
    pub fn matches(&self, presented: &str) -> bool {
        let a = self.token.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_then_load() {
        let dir = TempDir::new().unwrap();
        let created = Credentials::bootstrap(dir.path(), false).unwrap();
        let loaded = Credentials::load(dir.path()).unwrap();
        assert_eq!(created, loaded);
        assert!(loaded.matches(created.token()));
        assert!(!loaded.matches("wrong"));
        assert!(Credentials::bootstrap(dir.path(), false).is_err());
    }

    #[test]
    fn test_missing_credentials_are_access_denied() {
        let dir = TempDir::new().unwrap();
        let err = Credentials::load(dir.path()).unwrap_err();
        assert!(matches!(err, OpsError::AccessDenied(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::new("super-secret");
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }
}
