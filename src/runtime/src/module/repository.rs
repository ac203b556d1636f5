//! Index of module packages across the factory, staged and active roots.

use super::file::ModuleFile;
use super::pack::{list_hmps, list_packages};
use crate::log::ResultLog;
use hmp_update_core::config::UpdateConfig;
use hmp_update_core::error::{ErrorCode, Result, UpdateError};
use hmp_update_core::log::ResultRecord;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk root a module generation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleRoot {
    /// Factory-shipped, read-only.
    Preinstalled,
    /// Copied in by an install request, not yet activated.
    Staged,
    /// Previously activated update.
    Active,
}

impl ModuleRoot {
    pub const ALL: [ModuleRoot; 3] = [
        ModuleRoot::Preinstalled,
        ModuleRoot::Staged,
        ModuleRoot::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleRoot::Preinstalled => "preinstalled",
            ModuleRoot::Staged => "staged",
            ModuleRoot::Active => "active",
        }
    }
}

impl std::fmt::Display for ModuleRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type EntryMap = HashMap<i32, ModuleFile>;

/// Verified module files keyed by (root, module id).
///
/// Entries that fail verification are recorded in the result log and never
/// become visible to lookups.
pub struct ModuleFileRepository {
    preinstalled_dir: PathBuf,
    staged_dir: PathBuf,
    active_dir: PathBuf,
    result_log: Arc<ResultLog>,
    maps: RwLock<HashMap<ModuleRoot, EntryMap>>,
}

impl std::fmt::Debug for ModuleFileRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.maps.read();
        f.debug_struct("ModuleFileRepository")
            .field("preinstalled_dir", &self.preinstalled_dir)
            .field(
                "entries",
                &ModuleRoot::ALL
                    .iter()
                    .map(|root| (root.as_str(), maps.get(root).map_or(0, HashMap::len)))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ModuleFileRepository {
    pub fn new(config: &UpdateConfig, result_log: Arc<ResultLog>) -> Self {
        Self {
            preinstalled_dir: config.preinstalled_dir.clone(),
            staged_dir: config.install_dir.clone(),
            active_dir: config.active_dir.clone(),
            result_log,
            maps: RwLock::new(HashMap::new()),
        }
    }

    pub fn root_dir(&self, root: ModuleRoot) -> &Path {
        match root {
            ModuleRoot::Preinstalled => &self.preinstalled_dir,
            ModuleRoot::Staged => &self.staged_dir,
            ModuleRoot::Active => &self.active_dir,
        }
    }

    /// Index every package of `known_ids` under the three roots.
    ///
    /// Entries previously held for those ids are replaced; entries of other
    /// ids are left untouched. Returns the number of entries retained.
    pub fn index(&self, known_ids: &HashSet<i32>) -> usize {
        let factory = self.scan(ModuleRoot::Preinstalled, known_ids, None);
        let staged = self.scan(ModuleRoot::Staged, known_ids, Some(&factory));
        let active = self.scan(ModuleRoot::Active, known_ids, Some(&factory));
        let retained = factory.len() + staged.len() + active.len();

        let mut maps = self.maps.write();
        for (root, fresh) in [
            (ModuleRoot::Preinstalled, factory),
            (ModuleRoot::Staged, staged),
            (ModuleRoot::Active, active),
        ] {
            let map = maps.entry(root).or_default();
            map.retain(|id, _| !known_ids.contains(id));
            map.extend(fresh);
        }
        drop(maps);

        tracing::debug!(ids = known_ids.len(), retained, "Indexed module files");
        retained
    }

    fn scan(
        &self,
        root: ModuleRoot,
        known_ids: &HashSet<i32>,
        factory: Option<&EntryMap>,
    ) -> EntryMap {
        let root_dir = self.root_dir(root);
        let mut entries = EntryMap::new();

        let hmps = match list_hmps(root_dir) {
            Ok(hmps) => hmps,
            Err(e) => {
                tracing::warn!(root = %root, path = %root_dir.display(), error = %e, "Failed to list hmps");
                return entries;
            }
        };

        for hmp in hmps {
            let packages = match list_packages(&root_dir.join(&hmp)) {
                Ok(packages) => packages,
                Err(e) => {
                    tracing::warn!(root = %root, hmp = %hmp, error = %e, "Failed to list packages");
                    continue;
                }
            };

            for path in packages {
                let mut file = match ModuleFile::open(&path, &self.preinstalled_dir) {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable package");
                        self.result_log.record(ResultRecord::new(
                            path.display().to_string(),
                            e.code(),
                            e.to_string(),
                        ));
                        continue;
                    }
                };
                if !known_ids.contains(&file.id()) {
                    continue;
                }

                if let Some(factory) = factory {
                    if let Err(e) = self.verify_candidate(root, &mut file, factory) {
                        tracing::warn!(
                            root = %root,
                            path = %path.display(),
                            id = file.id(),
                            error = %e,
                            "Module verification failed"
                        );
                        self.result_log.record(ResultRecord::new(
                            path.display().to_string(),
                            ErrorCode::VerifySignFail,
                            e.to_string(),
                        ));
                        continue;
                    }
                }

                if let Some(previous) = entries.insert(file.id(), file) {
                    tracing::warn!(
                        root = %root,
                        id = previous.id(),
                        replaced = %previous.path().display(),
                        "Duplicate module id"
                    );
                }
            }
        }
        entries
    }

    /// Checks applied to every non-factory candidate.
    fn verify_candidate(
        &self,
        root: ModuleRoot,
        file: &mut ModuleFile,
        factory: &EntryMap,
    ) -> Result<()> {
        let trusted = factory.get(&file.id()).ok_or_else(|| {
            UpdateError::VerifyFailed(format!("no factory package for id {}", file.id()))
        })?;

        let candidate_rel = file.path().strip_prefix(self.root_dir(root)).ok();
        let factory_rel = trusted.path().strip_prefix(&self.preinstalled_dir).ok();
        if candidate_rel.is_none() || candidate_rel != factory_rel {
            return Err(UpdateError::VerifyFailed(format!(
                "{} does not match factory layout {}",
                file.path().display(),
                trusted.path().display()
            )));
        }

        #[cfg(feature = "hvb")]
        {
            crate::hvb::verify_package_signature(file.path(), trusted.public_key())?;
            if file.image().is_some() {
                file.verify_integrity(trusted.public_key())?;
            }
        }
        Ok(())
    }

    /// Whether `file` lives under the factory root.
    pub fn is_preinstalled(&self, file: &ModuleFile) -> bool {
        file.path().starts_with(&self.preinstalled_dir)
    }

    /// Trusted key for `id`, always taken from the factory entry.
    pub fn public_key_for(&self, id: i32) -> Option<Vec<u8>> {
        self.maps
            .read()
            .get(&ModuleRoot::Preinstalled)?
            .get(&id)
            .map(|file| file.public_key().to_vec())
    }

    pub fn lookup(&self, root: ModuleRoot, id: i32) -> Option<ModuleFile> {
        self.maps.read().get(&root)?.get(&id).cloned()
    }

    /// Entries of one hmp under `root`, sorted by id.
    pub fn entries_of_hmp(&self, root: ModuleRoot, hmp: &str) -> Vec<ModuleFile> {
        let maps = self.maps.read();
        let mut files: Vec<ModuleFile> = maps
            .get(&root)
            .map(|map| {
                map.values()
                    .filter(|file| file.hmp_name() == Some(hmp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        files.sort_by_key(ModuleFile::id);
        files
    }

    pub fn len(&self, root: ModuleRoot) -> usize {
        self.maps.read().get(&root).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        ModuleRoot::ALL.iter().all(|root| self.len(*root) == 0)
    }

    /// Drop the entries of `ids`, releasing their verified-boot data.
    pub fn release(&self, ids: &HashSet<i32>) {
        let mut maps = self.maps.write();
        for map in maps.values_mut() {
            map.retain(|id, file| {
                if ids.contains(id) {
                    file.release_verified_data();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Drop every entry, releasing verified-boot data.
    pub fn clear(&self) {
        let mut maps = self.maps.write();
        for map in maps.values_mut() {
            for file in map.values_mut() {
                file.release_verified_data();
            }
            map.clear();
        }
        tracing::debug!("Cleared module file repository");
    }
}
