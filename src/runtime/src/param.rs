//! Key-value parameter store.
//!
//! Used both as a lightweight event channel (SA status, bundle install
//! results) and as durable small configuration.

use crate::module::HmpInfo;
use hmp_update_core::error::{Result, UpdateError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Producer trigger: some SA changed state.
pub const SA_ABNORMAL_FLAG: &str = "hmp.sa.abnormal";
/// Producer trigger: some bundle failed to install.
pub const BUNDLE_REVERT_FLAG: &str = "hmp.bundle.revert";
/// Forced reboot request.
pub const POWER_CTRL: &str = "sys.powerctrl";
/// Value written to [`POWER_CTRL`] after a crash-triggered revert.
pub const REBOOT_FOR_REVERT: &str = "reboot,hmp_revert";

/// Value of a raised trigger flag.
pub const FLAG_SET: &str = "1";
/// Value of a cleared trigger flag.
pub const FLAG_CLEAR: &str = "0";

/// Per-SA status token parameter.
pub fn sa_status_key(sa_id: i32) -> String {
    format!("hmp.sa.{}.status", sa_id)
}

/// Per-hmp bundle status parameter (`"fail"` when the bundle failed).
pub fn bundle_status_key(hmp: &str) -> String {
    format!("hmp.{}.bundle_status", hmp)
}

/// Per-bundle install result written when its hmp is reverted.
pub fn bundle_install_result_key(bundle: &str) -> String {
    format!("hmp.bundle.{}.install_result", bundle)
}

/// Parameter store.
pub trait ParamStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// In-memory parameter store.
#[derive(Debug, Default)]
pub struct MemoryParamStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryParamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamStore for MemoryParamStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Parameter store persisted as a JSON map.
///
/// Values are cached in memory; every `set` rewrites the file atomically
/// (write to tmp file, then rename).
#[derive(Debug)]
pub struct FileParamStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileParamStore {
    /// Open the store, loading existing values if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|e| {
                UpdateError::Other(format!(
                    "failed to read parameter file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&data).map_err(|e| {
                UpdateError::Format(format!(
                    "failed to parse parameter file {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

impl ParamStore for FileParamStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        let previous = values.insert(name.to_string(), value.to_string());
        if let Err(e) = self.save(&values) {
            // Keep memory consistent with disk.
            match previous {
                Some(previous) => values.insert(name.to_string(), previous),
                None => values.remove(name),
            };
            tracing::warn!(name, value, error = %e, "Failed to persist parameter");
            return Err(UpdateError::ConfigWriteFailed {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

/// Mark every application bundle declared by `info` as install-failed.
///
/// Each write is independent: a failed write is counted and the loop
/// continues. Returns the number of failed writes.
pub fn notify_bundle_revert(params: &dyn ParamStore, info: &HmpInfo) -> usize {
    let mut failures = 0;
    for bundle in &info.bundles {
        if let Err(e) = params.set(&bundle_install_result_key(bundle), "revert") {
            tracing::warn!(hmp = %info.name, bundle = %bundle, error = %e, "Failed to notify bundle revert");
            failures += 1;
        }
    }
    if !info.bundles.is_empty() {
        tracing::info!(
            hmp = %info.name,
            bundles = info.bundles.len(),
            failures,
            "Notified bundle revert"
        );
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::PackType;

    fn hmp_info(bundles: &[&str]) -> HmpInfo {
        HmpInfo {
            name: "demo".to_string(),
            version: "1.0.0".to_string(),
            kind: PackType::Mixed,
            hot_install: false,
            bundles: bundles.iter().map(|b| b.to_string()).collect(),
        }
    }

    /// Rejects writes to one key.
    struct FlakyStore {
        inner: MemoryParamStore,
        reject: String,
    }

    impl ParamStore for FlakyStore {
        fn get(&self, name: &str) -> Option<String> {
            self.inner.get(name)
        }

        fn set(&self, name: &str, value: &str) -> Result<()> {
            if name == self.reject {
                return Err(UpdateError::ConfigWriteFailed {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            self.inner.set(name, value)
        }
    }

    #[test]
    fn test_keys() {
        assert_eq!(sa_status_key(42), "hmp.sa.42.status");
        assert_eq!(bundle_status_key("demo"), "hmp.demo.bundle_status");
        assert_eq!(
            bundle_install_result_key("com.demo"),
            "hmp.bundle.com.demo.install_result"
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryParamStore::new();
        assert!(store.get("a").is_none());
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params/params.json");

        let store = FileParamStore::open(&path).unwrap();
        store.set(SA_ABNORMAL_FLAG, FLAG_SET).unwrap();
        store.set(&sa_status_key(42), "crash").unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileParamStore::open(&path).unwrap();
        assert_eq!(reopened.get(SA_ABNORMAL_FLAG).as_deref(), Some(FLAG_SET));
        assert_eq!(reopened.get(&sa_status_key(42)).as_deref(), Some("crash"));
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileParamStore::open(&path).unwrap_err(),
            UpdateError::Format(_)
        ));
    }

    #[test]
    fn test_notify_bundle_revert_counts_failures() {
        let store = FlakyStore {
            inner: MemoryParamStore::new(),
            reject: bundle_install_result_key("b"),
        };
        let failures = notify_bundle_revert(&store, &hmp_info(&["a", "b", "c"]));
        assert_eq!(failures, 1);
        assert_eq!(
            store.get(&bundle_install_result_key("a")).as_deref(),
            Some("revert")
        );
        assert_eq!(
            store.get(&bundle_install_result_key("c")).as_deref(),
            Some("revert")
        );
    }
}
