//! `pack.info`: metadata describing one hmp directory.

use crate::PACK_INFO;
use hmp_update_core::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What an hmp bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    /// System abilities only.
    Sa,
    /// Application bundles only.
    App,
    /// Both.
    Mixed,
}

/// Parsed `pack.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmpInfo {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: PackType,
    #[serde(default)]
    pub hot_install: bool,
    #[serde(default)]
    pub bundles: Vec<String>,
}

impl HmpInfo {
    /// Load `pack.info` from an hmp directory.
    pub fn load(hmp_dir: &Path) -> Result<Self> {
        let path = hmp_dir.join(PACK_INFO);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            UpdateError::PathInvalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data)
            .map_err(|e| UpdateError::Format(format!("invalid {}: {}", path.display(), e)))
    }

    pub fn is_pure_sa(&self) -> bool {
        self.kind == PackType::Sa
    }
}

/// Module packages (`*.zip`) directly inside an hmp directory, sorted.
pub fn list_packages(hmp_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut packages = Vec::new();
    for entry in std::fs::read_dir(hmp_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "zip") {
            packages.push(path);
        }
    }
    packages.sort();
    Ok(packages)
}

/// Names of the hmp directories under `root` that carry a `pack.info`, sorted.
pub fn list_hmps(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.path().join(PACK_INFO).is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pack_info(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(PACK_INFO), body).unwrap();
    }

    #[test]
    fn test_load_pack_info() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("demo");
        write_pack_info(
            &dir,
            r#"{"name":"demo","version":"1.0.0","type":"mixed","hotInstall":true,"bundles":["com.demo.app"]}"#,
        );

        let info = HmpInfo::load(&dir).unwrap();
        assert_eq!(info.name, "demo");
        assert_eq!(info.kind, PackType::Mixed);
        assert!(info.hot_install);
        assert_eq!(info.bundles, vec!["com.demo.app".to_string()]);
        assert!(!info.is_pure_sa());
    }

    #[test]
    fn test_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sa");
        write_pack_info(&dir, r#"{"name":"sa","version":"1.0.0","type":"sa"}"#);

        let info = HmpInfo::load(&dir).unwrap();
        assert!(info.is_pure_sa());
        assert!(!info.hot_install);
        assert!(info.bundles.is_empty());
    }

    #[test]
    fn test_missing_and_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            HmpInfo::load(tmp.path()).unwrap_err(),
            UpdateError::PathInvalid(_)
        ));

        write_pack_info(tmp.path(), r#"{"name":"x","type":"bogus"}"#);
        assert!(matches!(
            HmpInfo::load(tmp.path()).unwrap_err(),
            UpdateError::Format(_)
        ));
    }

    #[test]
    fn test_listing() {
        let tmp = tempfile::tempdir().unwrap();
        write_pack_info(&tmp.path().join("b"), "{}");
        write_pack_info(&tmp.path().join("a"), "{}");
        std::fs::create_dir_all(tmp.path().join("no_pack_info")).unwrap();
        assert_eq!(list_hmps(tmp.path()).unwrap(), vec!["a", "b"]);
        assert!(list_hmps(&tmp.path().join("missing")).unwrap().is_empty());

        let hmp = tmp.path().join("a");
        std::fs::write(hmp.join("m2.zip"), b"").unwrap();
        std::fs::write(hmp.join("m1.zip"), b"").unwrap();
        std::fs::write(hmp.join("notes.txt"), b"").unwrap();
        let packages = list_packages(&hmp).unwrap();
        assert_eq!(packages, vec![hmp.join("m1.zip"), hmp.join("m2.zip")]);
    }
}
