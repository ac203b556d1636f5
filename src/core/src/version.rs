//! Module version triple and the "at least as new" partial order.

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};

/// Version of a module generation, parsed from an `A.B.C` string.
///
/// `A` is the API version: generations with different API versions are
/// never comparable. `B` (version code) dominates, `C` (patch) breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub api_version: u32,
    pub version_code: u32,
    pub patch_version: u32,
}

impl ModuleVersion {
    pub const fn new(api_version: u32, version_code: u32, patch_version: u32) -> Self {
        Self {
            api_version,
            version_code,
            patch_version,
        }
    }

    /// Returns true when `self` is at least as new as `other`.
    ///
    /// Incomparable API versions yield false in both directions, so
    /// `a.is_at_least(b) == false` does not imply `b.is_at_least(a)`.
    pub fn is_at_least(&self, other: &ModuleVersion) -> bool {
        compare_version(self, other)
    }
}

/// "`a` is at least as new as `b`".
pub fn compare_version(a: &ModuleVersion, b: &ModuleVersion) -> bool {
    if a.api_version != b.api_version {
        return false;
    }
    if a.version_code != b.version_code {
        return a.version_code > b.version_code;
    }
    a.patch_version >= b.patch_version
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.api_version, self.version_code, self.patch_version
        )
    }
}

impl std::str::FromStr for ModuleVersion {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(UpdateError::Format(format!(
                "version '{}' is not of the form A.B.C",
                s
            )));
        }
        let field = |raw: &str| {
            raw.parse::<u32>().map_err(|_| {
                UpdateError::Format(format!(
                    "invalid version component '{}' in '{}'",
                    raw, s
                ))
            })
        };
        Ok(Self {
            api_version: field(parts[0])?,
            version_code: field(parts[1])?,
            patch_version: field(parts[2])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: ModuleVersion = "1.2.0".parse().unwrap();
        assert_eq!(v, ModuleVersion::new(1, 2, 0));
        assert_eq!(v.to_string(), "1.2.0");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("1.2".parse::<ModuleVersion>().is_err());
        assert!("1.2.x".parse::<ModuleVersion>().is_err());
        assert!("1.2.3.4".parse::<ModuleVersion>().is_err());
        assert!("".parse::<ModuleVersion>().is_err());
    }

    #[test]
    fn test_reflexive() {
        let v = ModuleVersion::new(3, 7, 1);
        assert!(compare_version(&v, &v));
    }

    #[test]
    fn test_api_version_mismatch_is_incomparable() {
        let a = ModuleVersion::new(1, 9, 9);
        let b = ModuleVersion::new(2, 0, 0);
        assert!(!compare_version(&a, &b));
        assert!(!compare_version(&b, &a));
    }

    #[test]
    fn test_version_code_dominates_patch() {
        let newer = ModuleVersion::new(1, 3, 0);
        let older = ModuleVersion::new(1, 2, 9);
        assert!(compare_version(&newer, &older));
        assert!(!compare_version(&older, &newer));
    }

    #[test]
    fn test_patch_breaks_ties() {
        let a = ModuleVersion::new(1, 2, 1);
        let b = ModuleVersion::new(1, 2, 0);
        assert!(compare_version(&a, &b));
        assert!(!compare_version(&b, &a));
    }

    #[test]
    fn test_transitive_for_equal_api() {
        let versions = [
            ModuleVersion::new(1, 1, 0),
            ModuleVersion::new(1, 1, 4),
            ModuleVersion::new(1, 2, 0),
            ModuleVersion::new(1, 2, 2),
            ModuleVersion::new(1, 5, 0),
        ];
        for a in &versions {
            for b in &versions {
                for c in &versions {
                    if compare_version(a, b) && compare_version(b, c) {
                        assert!(compare_version(a, c), "{} >= {} >= {}", a, b, c);
                    }
                }
            }
        }
    }
}
