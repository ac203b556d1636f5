//! Module update orchestrator.
//!
//! Per hmp: resolve the working generation, stage it, mount every module
//! image and, when anything fails, revert to the backup generation.
//!
//! ```text
//! Resolving ──► Activating ──► Mounted
//!     │              │
//!     └─(corrupted)──┴──► Revert ──► factory fallback
//! ```
//!
//! Every public entry point takes the hmp's lock first, so at most one
//! pass per hmp runs at a time no matter which trigger started it.

pub(crate) mod fs;
mod install;
pub mod resolve;
mod revert;

pub use resolve::{resolve, Resolution};

use crate::log::ResultLog;
use crate::module::{ModuleFile, ModuleFileRepository, ModuleRoot};
use crate::mount::ImageMounter;
use crate::param::ParamStore;
use crate::runtime::SaTable;
use dashmap::DashMap;
use hmp_update_core::config::UpdateConfig;
use hmp_update_core::error::{ErrorCode, Result, UpdateError};
use hmp_update_core::event::ModuleUpdateStatus;
use hmp_update_core::log::ResultRecord;
use hmp_update_core::version::ModuleVersion;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What started a revert. Only SA failures force a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevertTrigger {
    BootScan,
    Install,
    Reinstall,
    StatusReport,
    AppInstallFailure,
    SaLoadFailure,
    SaCrash,
}

impl RevertTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevertTrigger::BootScan => "boot_scan",
            RevertTrigger::Install => "install",
            RevertTrigger::Reinstall => "reinstall",
            RevertTrigger::StatusReport => "status_report",
            RevertTrigger::AppInstallFailure => "app_install_failure",
            RevertTrigger::SaLoadFailure => "sa_load_failure",
            RevertTrigger::SaCrash => "sa_crash",
        }
    }

    /// Boot-time and application-triggered reverts must never reboot:
    /// that would loop the device.
    pub fn forces_reboot(&self) -> bool {
        matches!(self, RevertTrigger::SaLoadFailure | RevertTrigger::SaCrash)
    }
}

impl std::fmt::Display for RevertTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator.
pub struct ModuleUpdater {
    config: UpdateConfig,
    table: Arc<SaTable>,
    repository: Arc<ModuleFileRepository>,
    result_log: Arc<ResultLog>,
    mounter: Arc<dyn ImageMounter>,
    params: Arc<dyn ParamStore>,
    hmp_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Mount points held per hmp; presence marks the hmp as mounted.
    mounted: DashMap<String, Vec<PathBuf>>,
    /// Module name to version of the generation actually mounted.
    effective: DashMap<String, ModuleVersion>,
}

impl std::fmt::Debug for ModuleUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleUpdater")
            .field("mount_root", &self.config.mount_root)
            .field("mounted", &self.mounted.len())
            .field("effective", &self.effective.len())
            .finish()
    }
}

impl ModuleUpdater {
    pub fn new(
        config: UpdateConfig,
        table: Arc<SaTable>,
        repository: Arc<ModuleFileRepository>,
        result_log: Arc<ResultLog>,
        mounter: Arc<dyn ImageMounter>,
        params: Arc<dyn ParamStore>,
    ) -> Self {
        Self {
            config,
            table,
            repository,
            result_log,
            mounter,
            params,
            hmp_locks: DashMap::new(),
            mounted: DashMap::new(),
            effective: DashMap::new(),
        }
    }

    pub fn table(&self) -> &SaTable {
        &self.table
    }

    pub fn repository(&self) -> &ModuleFileRepository {
        &self.repository
    }

    fn hmp_lock(&self, hmp: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.hmp_locks.entry(hmp.to_string()).or_default().value())
    }

    fn ensure_known(&self, hmp: &str) -> Result<()> {
        if self.table.contains_hmp(hmp) {
            Ok(())
        } else {
            Err(UpdateError::NotFound(format!("{} is not a preinstalled hmp", hmp)))
        }
    }

    /// Where a module's image is mounted.
    pub fn mount_point(&self, module_name: &str) -> PathBuf {
        self.config.mount_root.join(module_name)
    }

    pub fn is_mounted(&self, hmp: &str) -> bool {
        self.mounted.contains_key(hmp)
    }

    /// Version of the generation mounted for `module_name`.
    pub fn effective_version(&self, module_name: &str) -> Option<ModuleVersion> {
        self.effective.get(module_name).map(|v| *v)
    }

    /// Boot-pass entry point. An hmp already mounted by this process is
    /// left alone.
    ///
    /// The caller indexes the repository beforehand.
    pub fn check_and_mount(&self, hmp: &str) -> ModuleUpdateStatus {
        let lock = self.hmp_lock(hmp);
        let _guard = lock.lock();

        if self.is_mounted(hmp) {
            tracing::debug!(hmp, "Already mounted, skipping");
            return ModuleUpdateStatus::new(hmp);
        }
        self.mount_locked(hmp, RevertTrigger::BootScan)
    }

    /// Unmount and mount `hmp` again from its resolved generation.
    ///
    /// Heals an on-demand SA whose hot install left it unloaded.
    pub fn reinstall(&self, hmp: &str) -> Result<ModuleUpdateStatus> {
        self.ensure_known(hmp)?;
        let lock = self.hmp_lock(hmp);
        let _guard = lock.lock();

        let ids = self.table.ids_of(hmp);
        self.repository.index(&ids);
        self.unmount_hmp(hmp);
        let status = self.mount_locked(hmp, RevertTrigger::Reinstall);
        self.repository.release(&ids);

        tracing::info!(
            hmp,
            preinstalled = status.is_pre_installed,
            success = status.is_all_mount_success,
            "Reinstalled hmp"
        );
        Ok(status)
    }

    /// Resolve and mount, reverting and falling back to the factory
    /// generation when the resolved one cannot be mounted.
    fn mount_locked(&self, hmp: &str, trigger: RevertTrigger) -> ModuleUpdateStatus {
        let mut status = ModuleUpdateStatus::new(hmp);
        status.is_hot_install = self
            .table
            .hmp_info(hmp)
            .is_some_and(|info| info.hot_install);

        let resolution = match resolve(
            &self.repository,
            hmp,
            &self.config.active_dir,
            &self.config.backup_dir,
        ) {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!(hmp, error = %e, "Resolution failed");
                self.result_log
                    .record(ResultRecord::new(hmp, e.code(), e.to_string()));
                status.is_all_mount_success = false;
                return status;
            }
        };

        if resolution.corrupted {
            if let Err(e) = self.revert_locked(hmp, trigger) {
                tracing::warn!(hmp, error = %e, "Revert of corrupted active generation failed");
            }
        }

        status.is_pre_installed = resolution.is_preinstalled();
        let factory = self.repository.entries_of_hmp(ModuleRoot::Preinstalled, hmp);

        if let Err(e) = self.activate_resolution(hmp, resolution) {
            tracing::warn!(hmp, error = %e, "Activation failed");
            self.result_log
                .record(ResultRecord::new(hmp, e.code(), e.to_string()));
            status.is_all_mount_success = false;

            if !status.is_pre_installed {
                if let Err(e) = self.revert_locked(hmp, trigger) {
                    tracing::warn!(hmp, error = %e, "Revert after failed activation failed");
                }
                status.is_pre_installed = true;
                if let Err(e) = self.activate_files(hmp, factory) {
                    tracing::error!(hmp, error = %e, "Factory fallback mount failed");
                }
            }
        }
        status
    }

    fn activate_resolution(&self, hmp: &str, resolution: Resolution) -> Result<()> {
        let mount_ready = self.config.mount_ready_dir.join(hmp);
        let mut files = resolution.files;
        if resolution.generation == ModuleRoot::Active {
            self.stage_mount_ready(hmp, &mut files)?;
        } else {
            fs::remove_dir_if_exists(&mount_ready)?;
        }
        self.activate_files(hmp, files)
    }

    /// Hard-link the active generation into the mount-ready root and point
    /// the active files at their links.
    fn stage_mount_ready(&self, hmp: &str, files: &mut [ModuleFile]) -> Result<()> {
        let src = self.config.active_dir.join(hmp);
        let dst = self.config.mount_ready_dir.join(hmp);
        fs::remove_dir_if_exists(&dst)?;
        fs::link_tree(&src, &dst).map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to link {} into {}: {}", src.display(), dst.display(), e),
            ))
        })?;

        for file in files.iter_mut() {
            let relocated = file.path().strip_prefix(&src).ok().map(|rel| dst.join(rel));
            if let Some(path) = relocated {
                file.set_path(path);
            }
        }
        tracing::debug!(hmp, path = %dst.display(), "Staged mount-ready generation");
        Ok(())
    }

    /// Mount every image of `files`. On failure the mounts made so far are
    /// undone.
    fn activate_files(&self, hmp: &str, files: Vec<ModuleFile>) -> Result<()> {
        let mut mount_points = Vec::new();
        let mut versions = Vec::new();

        for mut file in files {
            match self.activate_module(&mut file) {
                Ok(Some(mount_point)) => mount_points.push(mount_point),
                Ok(None) => {}
                Err(e) => {
                    for mount_point in &mount_points {
                        self.unmount_point(mount_point);
                    }
                    return Err(e);
                }
            }
            versions.push((file.name().to_string(), file.version()));
        }

        for (name, version) in versions {
            tracing::info!(hmp, module = %name, version = %version, "Module active");
            self.effective.insert(name, version);
        }
        self.mounted.insert(hmp.to_string(), mount_points);
        Ok(())
    }

    /// Mount one module. Metadata-only modules have nothing to mount.
    fn activate_module(&self, file: &mut ModuleFile) -> Result<Option<PathBuf>> {
        if file.image().is_none() {
            return Ok(None);
        }
        let mount_point = self.mount_point(file.name());
        prepare_mount_point(&mount_point)?;

        let verity = cfg!(feature = "hvb") && !self.repository.is_preinstalled(file);
        if let Err(e) = self.mount_module(file, &mount_point, verity) {
            if let Err(cleanup) = std::fs::remove_dir(&mount_point) {
                tracing::debug!(path = %mount_point.display(), error = %cleanup, "Mount point not removed");
            }
            return Err(e);
        }
        Ok(Some(mount_point))
    }

    fn mount_module(&self, file: &mut ModuleFile, mount_point: &Path, verity: bool) -> Result<()> {
        #[cfg(feature = "hvb")]
        if verity {
            let key = self.repository.public_key_for(file.id()).ok_or_else(|| {
                UpdateError::VerifyFailed(format!("no trusted key for module id {}", file.id()))
            })?;
            file.verify_integrity(&key)?;
        }
        self.mounter.mount_image(file, mount_point, verity)
    }

    fn unmount_point(&self, mount_point: &Path) {
        if let Err(e) = self.mounter.unmount(mount_point) {
            tracing::warn!(path = %mount_point.display(), error = %e, "Unmount failed");
        }
    }

    /// Detach every image this process mounted for `hmp`.
    fn unmount_hmp(&self, hmp: &str) {
        if let Some((_, mount_points)) = self.mounted.remove(hmp) {
            for mount_point in &mount_points {
                self.unmount_point(mount_point);
            }
        }
    }

    /// Record a mount outcome observed out of band. A failed
    /// non-factory generation is reverted without rebooting.
    pub fn report_status(&self, status: &ModuleUpdateStatus) -> Result<()> {
        let (code, info) = if status.is_all_mount_success {
            (ErrorCode::Success, "mounted")
        } else {
            (ErrorCode::IoFailure, "mount failed")
        };
        self.result_log
            .append(&ResultRecord::new(&status.hmp_name, code, info))?;

        if !status.is_pre_installed && !status.is_all_mount_success {
            self.revert(&status.hmp_name, RevertTrigger::StatusReport)?;
        }
        Ok(())
    }

    /// Effective generation of `hmp` without mounting anything.
    pub fn describe(&self, hmp: &str) -> Result<Resolution> {
        self.ensure_known(hmp)?;
        let lock = self.hmp_lock(hmp);
        let _guard = lock.lock();

        let ids = self.table.ids_of(hmp);
        self.repository.index(&ids);
        let resolution = resolve(
            &self.repository,
            hmp,
            &self.config.active_dir,
            &self.config.backup_dir,
        );
        self.repository.release(&ids);
        resolution
    }

    pub fn root_dir(&self, root: ModuleRoot) -> &Path {
        self.repository.root_dir(root)
    }
}

/// Create `path`, refusing one that already has content.
fn prepare_mount_point(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        UpdateError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to create mount point {}: {}", path.display(), e),
        ))
    })?;
    if std::fs::read_dir(path)?.next().is_some() {
        return Err(UpdateError::ResourceExhausted(format!(
            "mount point {} is not empty",
            path.display()
        )));
    }
    Ok(())
}
