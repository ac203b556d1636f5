//! SA id to hmp table built from the factory root.

use crate::module::{list_hmps, list_packages, HmpInfo, ModuleFile};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// One module shipped by a factory hmp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaModule {
    pub id: i32,
    /// Module name, also the name of the process hosting the SA.
    pub name: String,
    pub hmp: String,
}

/// Read-mostly map of every factory module and hmp.
///
/// Built once before the boot pass and the queue runtime start, then shared
/// behind an `Arc`.
#[derive(Debug, Default)]
pub struct SaTable {
    modules: HashMap<i32, SaModule>,
    hmps: BTreeMap<String, HmpInfo>,
}

impl SaTable {
    /// Scan `preinstalled_dir`. Unreadable hmps and packages are skipped.
    pub fn build(preinstalled_dir: &Path) -> Self {
        let mut table = Self::default();

        let hmps = match list_hmps(preinstalled_dir) {
            Ok(hmps) => hmps,
            Err(e) => {
                tracing::warn!(path = %preinstalled_dir.display(), error = %e, "Failed to list factory hmps");
                return table;
            }
        };

        for hmp in hmps {
            let dir = preinstalled_dir.join(&hmp);
            let info = match HmpInfo::load(&dir) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(hmp = %hmp, error = %e, "Skipping hmp without valid pack.info");
                    continue;
                }
            };
            for path in list_packages(&dir).unwrap_or_default() {
                match ModuleFile::open(&path, preinstalled_dir) {
                    Ok(file) => {
                        table.modules.insert(
                            file.id(),
                            SaModule {
                                id: file.id(),
                                name: file.name().to_string(),
                                hmp: hmp.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping factory package")
                    }
                }
            }
            table.hmps.insert(hmp, info);
        }

        tracing::info!(
            hmps = table.hmps.len(),
            modules = table.modules.len(),
            "Built SA table"
        );
        table
    }

    pub fn module(&self, id: i32) -> Option<&SaModule> {
        self.modules.get(&id)
    }

    pub fn hmp_of(&self, id: i32) -> Option<&str> {
        self.modules.get(&id).map(|m| m.hmp.as_str())
    }

    /// Id of the SA hosted by `process_name`.
    pub fn id_by_process(&self, process_name: &str) -> Option<i32> {
        self.modules
            .values()
            .find(|m| m.name == process_name)
            .map(|m| m.id)
    }

    pub fn hmp_info(&self, hmp: &str) -> Option<&HmpInfo> {
        self.hmps.get(hmp)
    }

    pub fn contains_hmp(&self, hmp: &str) -> bool {
        self.hmps.contains_key(hmp)
    }

    /// Sorted hmp names.
    pub fn hmp_names(&self) -> Vec<String> {
        self.hmps.keys().cloned().collect()
    }

    /// Sorted SA ids.
    pub fn sa_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.modules.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn ids_of(&self, hmp: &str) -> HashSet<i32> {
        self.modules
            .values()
            .filter(|m| m.hmp == hmp)
            .map(|m| m.id)
            .collect()
    }

    pub fn all_ids(&self) -> HashSet<i32> {
        self.modules.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
