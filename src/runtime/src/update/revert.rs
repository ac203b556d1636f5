//! Revert to the backup generation.

use super::fs::{remove_dir_if_exists, replace_dir};
use super::{ModuleUpdater, RevertTrigger};
use crate::param::{notify_bundle_revert, POWER_CTRL, REBOOT_FOR_REVERT};
use hmp_update_core::error::Result;

impl ModuleUpdater {
    /// Revert `hmp`: drop its active generation, restore the backup over it
    /// and notify the bundle installer. SA-triggered reverts also request a
    /// reboot when an active generation was actually dropped.
    pub fn revert(&self, hmp: &str, trigger: RevertTrigger) -> Result<()> {
        self.ensure_known(hmp)?;
        let lock = self.hmp_lock(hmp);
        let _guard = lock.lock();
        self.revert_locked(hmp, trigger)
    }

    pub(super) fn revert_locked(&self, hmp: &str, trigger: RevertTrigger) -> Result<()> {
        let active = self.config.active_dir.join(hmp);
        let installed = active.exists();
        tracing::warn!(hmp, trigger = %trigger, installed, "Reverting hmp");

        let removed = remove_dir_if_exists(&active)
            .and_then(|_| remove_dir_if_exists(&self.config.mount_ready_dir.join(hmp)));

        if let Some(info) = self.table.hmp_info(hmp) {
            let failures = notify_bundle_revert(self.params.as_ref(), info);
            if failures > 0 {
                tracing::warn!(hmp, failures, "Some bundles were not notified");
            }
        }

        let restored = removed.and_then(|_| self.restore_backup(hmp));
        let success = restored.is_ok();
        if let Err(e) = self.result_log.update_revert_result(hmp, success) {
            tracing::warn!(hmp, error = %e, "Failed to record revert result");
        }

        // Without an active generation a reboot could only loop back here.
        if trigger.forces_reboot() && installed {
            match self.params.set(POWER_CTRL, REBOOT_FOR_REVERT) {
                Ok(()) => tracing::warn!(hmp, trigger = %trigger, "Requested reboot after revert"),
                Err(e) => tracing::error!(hmp, error = %e, "Failed to request reboot"),
            }
        }

        match &restored {
            Ok(true) => tracing::info!(hmp, "Restored backup generation"),
            Ok(false) => tracing::info!(hmp, "No backup, factory generation takes over"),
            Err(e) => tracing::error!(hmp, error = %e, "Revert failed"),
        }
        restored.map(|_| ())
    }

    /// Move the backup generation into the active root.
    fn restore_backup(&self, hmp: &str) -> Result<bool> {
        let backup = self.config.backup_dir.join(hmp);
        if !backup.is_dir() {
            return Ok(false);
        }
        replace_dir(&backup, &self.config.active_dir.join(hmp))?;
        Ok(true)
    }
}
