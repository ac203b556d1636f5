//! On-demand install and uninstall of an hmp.

use super::fs::{backup_generation, copy_dir_recursive, remove_dir_if_exists, replace_dir, DirGuard};
use super::{resolve, ModuleUpdater, Resolution, RevertTrigger};
use crate::module::{list_packages, HmpInfo, ModuleFile, ModuleRoot};
use hmp_update_core::error::{Result, UpdateError};
use hmp_update_core::event::ModuleUpdateStatus;
use hmp_update_core::version::compare_version;
use std::collections::HashSet;
use std::path::Path;

impl ModuleUpdater {
    /// Install the hmp directory at `hmp_path`.
    ///
    /// The directory is copied into the staged root, verified, checked
    /// against the effective generation, backed up over and moved into the
    /// active root. Hot-install hmps are mounted right away; the others take
    /// effect on the next boot.
    pub fn install(&self, hmp_path: &Path) -> Result<ModuleUpdateStatus> {
        if !hmp_path.is_dir() {
            return Err(UpdateError::PathInvalid(format!(
                "{} is not an hmp directory",
                hmp_path.display()
            )));
        }
        let info = HmpInfo::load(hmp_path)?;
        self.ensure_known(&info.name)?;

        let lock = self.hmp_lock(&info.name);
        let _guard = lock.lock();

        let ids = self.table.ids_of(&info.name);
        let result = self.install_locked(&info, hmp_path, &ids);
        self.repository.release(&ids);
        result
    }

    fn install_locked(
        &self,
        info: &HmpInfo,
        hmp_path: &Path,
        ids: &HashSet<i32>,
    ) -> Result<ModuleUpdateStatus> {
        let hmp = info.name.as_str();
        let staged = self.config.install_dir.join(hmp);
        let _staged_guard = DirGuard::new(&staged);

        if hmp_path != staged {
            remove_dir_if_exists(&staged)?;
            copy_dir_recursive(hmp_path, &staged)?;
        }

        self.repository.index(ids);
        let current = resolve(
            &self.repository,
            hmp,
            &self.config.active_dir,
            &self.config.backup_dir,
        )?;
        let mut candidates = self.check_candidates(hmp, &staged, &current)?;

        let active = self.config.active_dir.join(hmp);
        backup_generation(&active, &self.config.backup_dir.join(hmp))?;
        replace_dir(&staged, &active)?;
        for file in candidates.iter_mut() {
            let relocated = file.path().strip_prefix(&staged).ok().map(|rel| active.join(rel));
            if let Some(path) = relocated {
                file.set_path(path);
            }
        }
        tracing::info!(hmp, modules = candidates.len(), "Installed new active generation");

        let mut status = ModuleUpdateStatus::new(hmp);
        status.is_hot_install = info.hot_install;
        if !info.hot_install {
            return Ok(status);
        }

        let mut files = self.repository.entries_of_hmp(ModuleRoot::Preinstalled, hmp);
        for file in files.iter_mut() {
            if let Some(candidate) = candidates.iter().find(|c| c.id() == file.id()) {
                *file = candidate.clone();
            }
        }

        self.unmount_hmp(hmp);
        let resolution = Resolution {
            generation: ModuleRoot::Active,
            files,
            corrupted: false,
        };
        if let Err(e) = self.activate_resolution(hmp, resolution) {
            tracing::warn!(hmp, error = %e, "Hot activation failed, reverting");
            if let Err(revert) = self.revert_locked(hmp, RevertTrigger::Install) {
                tracing::warn!(hmp, error = %revert, "Revert after failed hot install failed");
            }
            self.repository.index(ids);
            let restored = self.mount_locked(hmp, RevertTrigger::Install);
            tracing::info!(
                hmp,
                preinstalled = restored.is_pre_installed,
                success = restored.is_all_mount_success,
                "Remounted previous generation"
            );
            return Err(e);
        }
        Ok(status)
    }

    /// Every staged package must have survived verification and be at
    /// least as new as the generation in effect.
    fn check_candidates(
        &self,
        hmp: &str,
        staged: &Path,
        current: &Resolution,
    ) -> Result<Vec<ModuleFile>> {
        let packages = list_packages(staged)?;
        if packages.is_empty() {
            return Err(UpdateError::Format(format!(
                "{} contains no module packages",
                staged.display()
            )));
        }

        let indexed = self.repository.entries_of_hmp(ModuleRoot::Staged, hmp);
        let mut candidates = Vec::with_capacity(packages.len());
        for path in packages {
            let file = indexed
                .iter()
                .find(|f| f.path() == path)
                .cloned()
                .ok_or_else(|| {
                    UpdateError::VerifyFailed(format!(
                        "{} did not pass verification",
                        path.display()
                    ))
                })?;

            let floor = self.effective_version(file.name()).or_else(|| {
                current
                    .files
                    .iter()
                    .find(|f| f.id() == file.id())
                    .map(ModuleFile::version)
            });
            if let Some(floor) = floor {
                if !compare_version(&file.version(), &floor) {
                    return Err(UpdateError::VersionTooLow {
                        candidate: file.version().to_string(),
                        floor: floor.to_string(),
                    });
                }
            }
            candidates.push(file);
        }
        Ok(candidates)
    }

    /// Remove the installed and backup generations of `hmp`. The factory
    /// generation is used from the next boot on; mounted images stay in
    /// place until then.
    pub fn uninstall(&self, hmp: &str) -> Result<()> {
        self.ensure_known(hmp)?;
        let lock = self.hmp_lock(hmp);
        let _guard = lock.lock();

        let active = self.config.active_dir.join(hmp);
        let backup = self.config.backup_dir.join(hmp);
        if !active.exists() && !backup.exists() {
            return Err(UpdateError::NotFound(format!(
                "hmp {} has no installed generation",
                hmp
            )));
        }

        remove_dir_if_exists(&active)?;
        remove_dir_if_exists(&backup)?;
        remove_dir_if_exists(&self.config.mount_ready_dir.join(hmp))?;
        tracing::info!(hmp, "Uninstalled hmp");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::Fixture;
    use super::*;
    use crate::param::{ParamStore, POWER_CTRL};

    #[test]
    fn test_cold_install_moves_to_active_with_backup() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", false);
        fx.write_hmp(&fx.config.active_dir, "1.3.0", false);
        let download = fx._dir.path().join("download");
        let source = fx.write_hmp(&download, "1.4.0", false);

        let updater = fx.updater();
        let status = updater.install(&source).unwrap();
        assert!(!status.is_hot_install);

        let active = fx.config.active_dir.join("demo/demo_sa.zip");
        let backup = fx.config.backup_dir.join("demo/demo_sa.zip");
        assert_eq!(
            std::fs::read(&active).unwrap(),
            std::fs::read(source.join("demo_sa.zip")).unwrap()
        );
        assert!(backup.exists());
        assert!(!fx.config.install_dir.join("demo").exists());
        assert!(fx.mounter.mounts().is_empty());
        assert!(updater.repository().is_empty());
    }

    #[test]
    fn test_hot_install_mounts_immediately() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", true);
        let source = fx.write_hmp(&fx._dir.path().join("download"), "1.3.0", true);

        let updater = fx.updater();
        fx.boot(&updater);
        let status = updater.install(&source).unwrap();
        assert!(status.is_hot_install);
        assert!(status.is_all_mount_success);

        let mounts = fx.mounter.mounts();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].source, fx.config.mount_ready_dir.join("demo/demo_sa.zip"));
        assert_eq!(*fx.mounter.unmounts.lock(), vec![fx.config.mount_root.join("demo_sa")]);
        assert_eq!(updater.effective_version("demo_sa").unwrap().to_string(), "1.3.0");
    }

    #[test]
    fn test_failed_hot_install_reverts_without_reboot() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", true);
        let source = fx.write_hmp(&fx._dir.path().join("download"), "1.3.0", true);
        fx.mounter.fail_under(&fx.config.mount_ready_dir);

        let updater = fx.updater();
        let err = updater.install(&source).unwrap_err();
        assert!(matches!(err, UpdateError::ResourceExhausted(_)));

        assert!(!fx.config.active_dir.join("demo").exists());
        assert!(!fx.config.install_dir.join("demo").exists());
        assert!(fx.params.get(POWER_CTRL).is_none());
        assert_eq!(updater.effective_version("demo_sa").unwrap().to_string(), "1.2.0");
    }

    #[test]
    fn test_older_package_rejected() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", false);
        let source = fx.write_hmp(&fx._dir.path().join("download"), "1.1.9", false);

        let updater = fx.updater();
        let err = updater.install(&source).unwrap_err();
        assert!(matches!(err, UpdateError::VersionTooLow { .. }));
        assert!(!fx.config.active_dir.join("demo").exists());
        assert!(!fx.config.install_dir.join("demo").exists());
    }

    #[cfg(feature = "hvb")]
    #[test]
    fn test_unsigned_package_rejected() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", false);
        let source = fx._dir.path().join("download/demo");
        crate::module::file::test_support::write_pack_info(&source, "demo", "sa", false, &[]);
        let image = crate::module::file::test_support::signed_image(&fx.key, "demo_sa");
        crate::module::file::test_support::write_package(
            &source.join("demo_sa.zip"),
            "demo_sa",
            7,
            "1.3.0",
            Some(image.as_slice()),
            Some(&fx.key),
        );

        let updater = fx.updater();
        let err = updater.install(&source).unwrap_err();
        assert!(matches!(err, UpdateError::VerifyFailed(_)));
        assert!(!fx.config.active_dir.join("demo").exists());
    }

    #[test]
    fn test_install_rejects_bad_paths() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", false);
        let updater = fx.updater();

        let err = updater.install(&fx._dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, UpdateError::PathInvalid(_)));

        let stranger = fx._dir.path().join("download/other");
        crate::module::file::test_support::write_pack_info(&stranger, "other", "sa", false, &[]);
        let err = updater.install(&stranger).unwrap_err();
        assert!(matches!(err, UpdateError::NotFound(_)));
    }

    #[test]
    fn test_uninstall() {
        let fx = Fixture::new();
        fx.write_hmp(&fx.config.preinstalled_dir, "1.2.0", false);
        fx.write_hmp(&fx.config.active_dir, "1.3.0", false);
        fx.write_hmp(&fx.config.backup_dir, "1.2.5", false);
        let updater = fx.updater();

        updater.uninstall("demo").unwrap();
        assert!(!fx.config.active_dir.join("demo").exists());
        assert!(!fx.config.backup_dir.join("demo").exists());
        assert!(matches!(
            updater.uninstall("demo").unwrap_err(),
            UpdateError::NotFound(_)
        ));
    }
}
