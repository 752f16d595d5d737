//! Registration-time filtering by platform and permission.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Macos,
    Linux,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    /// Whether a capability declaring `supported` runs here. An empty set
    /// means every platform.
    pub fn supports(self, supported: &[Platform]) -> bool {
        supported.is_empty() || supported.contains(&self)
    }
}

/// Maps capability categories to named permissions.
///
/// A capability whose category is unmapped (or that has none) always
/// passes; one in a mapped category passes only if its permission is
/// granted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionFilter {
    pub categories: HashMap<String, String>,
    pub granted: HashSet<String>,
}

impl PermissionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, category: &str, permission: &str) -> Self {
        self.categories
            .insert(category.to_string(), permission.to_string());
        self
    }

    pub fn grant(mut self, permission: &str) -> Self {
        self.granted.insert(permission.to_string());
        self
    }

    pub fn allows(&self, category: Option<&str>) -> bool {
        let Some(category) = category else {
            return true;
        };
        match self.categories.get(category) {
            Some(permission) => self.granted.contains(permission),
            None => true,
        }
    }
}
