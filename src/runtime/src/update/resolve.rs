//! Working-generation resolution for one hmp.

use crate::module::{list_packages, HmpInfo, ModuleFile, ModuleFileRepository, ModuleRoot};
use hmp_update_core::error::{Result, UpdateError};
use hmp_update_core::version::compare_version;
use std::path::Path;

/// Which generation of an hmp should be mounted.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// [`ModuleRoot::Active`] or [`ModuleRoot::Preinstalled`].
    pub generation: ModuleRoot,
    /// One file per module id, sorted by id. Active files still point into
    /// the active root; staging relocates them.
    pub files: Vec<ModuleFile>,
    /// The active generation is unusable while a pure-SA backup exists:
    /// revert before mounting.
    pub corrupted: bool,
}

impl Resolution {
    pub fn is_preinstalled(&self) -> bool {
        self.generation == ModuleRoot::Preinstalled
    }
}

/// Resolve `hmp` from the repository's current index.
///
/// The active generation wins only when every package in its directory
/// passed verification and each one is at least as new as its factory
/// counterpart. Modules the active generation does not carry keep their
/// factory file.
pub fn resolve(
    repository: &ModuleFileRepository,
    hmp: &str,
    active_dir: &Path,
    backup_dir: &Path,
) -> Result<Resolution> {
    let factory = repository.entries_of_hmp(ModuleRoot::Preinstalled, hmp);
    if factory.is_empty() {
        return Err(UpdateError::NotFound(format!(
            "no factory modules indexed for hmp {}",
            hmp
        )));
    }

    let preinstalled = Resolution {
        generation: ModuleRoot::Preinstalled,
        files: factory.clone(),
        corrupted: false,
    };

    let active_hmp = active_dir.join(hmp);
    if !active_hmp.is_dir() {
        return Ok(preinstalled);
    }

    let active = repository.entries_of_hmp(ModuleRoot::Active, hmp);
    let on_disk = list_packages(&active_hmp).map(|p| p.len()).unwrap_or(0);
    let favorable = !active.is_empty()
        && active.len() == on_disk
        && active.iter().all(|candidate| {
            factory
                .iter()
                .find(|f| f.id() == candidate.id())
                .is_some_and(|f| compare_version(&candidate.version(), &f.version()))
        });

    if favorable {
        let files = factory
            .into_iter()
            .map(|f| {
                active
                    .iter()
                    .find(|a| a.id() == f.id())
                    .cloned()
                    .unwrap_or(f)
            })
            .collect();
        tracing::debug!(hmp, "Resolved active generation");
        return Ok(Resolution {
            generation: ModuleRoot::Active,
            files,
            corrupted: false,
        });
    }

    let corrupted = is_pure_sa_backup(&backup_dir.join(hmp));
    tracing::warn!(
        hmp,
        verified = active.len(),
        packages = on_disk,
        corrupted,
        "Active generation not usable, falling back to factory"
    );
    Ok(Resolution {
        corrupted,
        ..preinstalled
    })
}

/// A backup holding exactly one package of a pure system-SA hmp.
fn is_pure_sa_backup(backup_hmp: &Path) -> bool {
    if !backup_hmp.is_dir() {
        return false;
    }
    let pure_sa = HmpInfo::load(backup_hmp).is_ok_and(|info| info.is_pure_sa());
    let packages = list_packages(backup_hmp).map(|p| p.len()).unwrap_or(0);
    pure_sa && packages == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hvb::builder::{sign_package, SigningKey};
    use crate::log::ResultLog;
    use crate::module::file::test_support::*;
    use hmp_update_core::config::UpdateConfig;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: UpdateConfig,
        key: SigningKey,
        repo: ModuleFileRepository,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig::rooted_at(dir.path());
        let log = Arc::new(ResultLog::new(&config.result_log_path));
        let repo = ModuleFileRepository::new(&config, log);
        Fixture {
            _dir: dir,
            config,
            key: SigningKey::generate().unwrap(),
            repo,
        }
    }

    fn hmp(fx: &Fixture, root: &Path, version: &str, signed: bool) {
        let dir = root.join("demo");
        write_pack_info(&dir, "demo", "sa", false, &[]);
        let path = dir.join("demo_sa.zip");
        let image = signed_image(&fx.key, "demo_sa");
        write_package(&path, "demo_sa", 7, version, Some(image.as_slice()), Some(&fx.key));
        if signed {
            sign_package(&path, &fx.key).unwrap();
        }
    }

    fn resolve_demo(fx: &Fixture) -> Resolution {
        fx.repo.index(&HashSet::from([7]));
        resolve(&fx.repo, "demo", &fx.config.active_dir, &fx.config.backup_dir).unwrap()
    }

    #[test]
    fn test_factory_only() {
        let fx = fixture();
        hmp(&fx, &fx.config.preinstalled_dir, "1.2.0", false);
        let resolution = resolve_demo(&fx);
        assert!(resolution.is_preinstalled());
        assert!(!resolution.corrupted);
        assert_eq!(resolution.files[0].version().to_string(), "1.2.0");
    }

    #[test]
    fn test_newer_active_wins() {
        let fx = fixture();
        hmp(&fx, &fx.config.preinstalled_dir, "1.2.0", false);
        hmp(&fx, &fx.config.active_dir, "1.3.0", true);
        let resolution = resolve_demo(&fx);
        assert_eq!(resolution.generation, ModuleRoot::Active);
        assert_eq!(resolution.files[0].version().to_string(), "1.3.0");
        assert!(resolution.files[0].path().starts_with(&fx.config.active_dir));
    }

    #[test]
    fn test_api_version_mismatch_never_selects_active() {
        let fx = fixture();
        hmp(&fx, &fx.config.preinstalled_dir, "1.2.0", false);
        hmp(&fx, &fx.config.active_dir, "2.9.0", true);
        let resolution = resolve_demo(&fx);
        assert!(resolution.is_preinstalled());
        assert!(!resolution.corrupted);
    }

    #[test]
    fn test_older_active_with_pure_sa_backup_is_corrupted() {
        let fx = fixture();
        hmp(&fx, &fx.config.preinstalled_dir, "1.2.0", false);
        hmp(&fx, &fx.config.active_dir, "1.1.0", true);
        hmp(&fx, &fx.config.backup_dir, "1.3.0", true);
        let resolution = resolve_demo(&fx);
        assert!(resolution.is_preinstalled());
        assert!(resolution.corrupted);
    }

    #[cfg(feature = "hvb")]
    #[test]
    fn test_unverified_active_falls_back() {
        let fx = fixture();
        hmp(&fx, &fx.config.preinstalled_dir, "1.2.0", false);
        hmp(&fx, &fx.config.active_dir, "1.3.0", false);
        let resolution = resolve_demo(&fx);
        assert!(resolution.is_preinstalled());
        assert!(!resolution.corrupted);
    }

    #[test]
    fn test_unknown_hmp() {
        let fx = fixture();
        let err = resolve(&fx.repo, "missing", &fx.config.active_dir, &fx.config.backup_dir)
            .unwrap_err();
        assert!(matches!(err, UpdateError::NotFound(_)));
    }
}
