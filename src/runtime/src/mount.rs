//! Mounting module images.
//!
//! [`ImageMounter`] is the seam between the orchestrator and the kernel:
//! the default [`DeviceMounter`] goes through loop devices, dm-verity and
//! mount(2), tests substitute a recording implementation.

use crate::loopdev::{LoopDevice, LoopDeviceManager};
use crate::module::ModuleFile;
use hmp_update_core::config::{LoopConfig, MountConfig};
use hmp_update_core::error::{Result, UpdateError};
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Mounts module images read-only.
pub trait ImageMounter: Send + Sync {
    /// Prepare block devices for `count` upcoming mounts.
    fn preallocate(&self, count: u32) -> Result<()>;

    /// Mount the image embedded in `file` at `mount_point`.
    ///
    /// With `verity`, the image is mounted through a hash-tree checked
    /// device built from the file's verified-boot data.
    fn mount_image(&self, file: &ModuleFile, mount_point: &Path, verity: bool) -> Result<()>;

    /// Detach whatever is mounted at `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<()>;
}

/// Split a comma-separated option string into mount flags and fs data.
pub fn parse_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::MS_RDONLY;
    let mut data = Vec::new();
    for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        match option {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

/// Loop device, optional dm-verity, then mount(2).
#[derive(Debug)]
pub struct DeviceMounter {
    loops: LoopDeviceManager,
    create_retries: u32,
    mount: MountConfig,
}

impl DeviceMounter {
    pub fn new(loop_config: LoopConfig, mount: MountConfig) -> Self {
        Self {
            create_retries: loop_config.create_retries.max(1),
            loops: LoopDeviceManager::new(loop_config),
            mount,
        }
    }

    fn create_loop(&self, file: &ModuleFile) -> Result<LoopDevice> {
        let image = file.image().ok_or_else(|| {
            UpdateError::Format(format!("{} has no image", file.path().display()))
        })?;

        let mut last_err = None;
        for attempt in 1..=self.create_retries {
            match self.loops.create(file.path(), image.offset, image.length) {
                Ok(device) => return Ok(device),
                Err(e) => {
                    tracing::warn!(
                        path = %file.path().display(),
                        attempt,
                        error = %e,
                        "Loop device creation failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            UpdateError::ResourceExhausted("loop device creation not attempted".to_string())
        }))
    }

    /// Poll for the block device node to appear.
    fn wait_for_device(&self, device: &Path) -> Result<()> {
        for _ in 0..self.mount.wait_attempts {
            if device.exists() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(self.mount.wait_ms));
        }
        if device.exists() {
            return Ok(());
        }
        Err(UpdateError::ResourceExhausted(format!(
            "block device {} did not appear",
            device.display()
        )))
    }

    #[cfg(feature = "hvb")]
    fn stack_verity(
        &self,
        file: &ModuleFile,
        loop_device: &LoopDevice,
    ) -> Result<crate::dm::VerityDevice> {
        use crate::dm::{create_verity_device, verity_device_name, VerityTarget};

        let data = file.verified_data().ok_or_else(|| {
            UpdateError::VerifyFailed(format!(
                "{} has not been verified",
                file.path().display()
            ))
        })?;
        let target = VerityTarget::from_cert(loop_device.path(), data.cert());
        create_verity_device(&verity_device_name(file.name()), &target)
    }
}

impl ImageMounter for DeviceMounter {
    fn preallocate(&self, count: u32) -> Result<()> {
        self.loops.preallocate(count)
    }

    fn mount_image(&self, file: &ModuleFile, mount_point: &Path, verity: bool) -> Result<()> {
        let image = *file.image().ok_or_else(|| {
            UpdateError::Format(format!("{} has no image", file.path().display()))
        })?;

        let loop_device = self.create_loop(file)?;
        if let Err(e) = self.loops.configure_read_ahead(&loop_device) {
            tracing::warn!(device = %loop_device.path().display(), error = %e, "Read-ahead not configured");
        }

        #[cfg(feature = "hvb")]
        let verity_device = if verity {
            Some(self.stack_verity(file, &loop_device)?)
        } else {
            None
        };
        #[cfg(feature = "hvb")]
        let device: PathBuf = verity_device
            .as_ref()
            .map_or_else(|| loop_device.path().to_path_buf(), |d| d.path().to_path_buf());
        #[cfg(not(feature = "hvb"))]
        let device: PathBuf = {
            let _ = verity;
            loop_device.path().to_path_buf()
        };

        self.wait_for_device(&device)?;

        let (flags, data) = parse_mount_options(&self.mount.options);
        let data = (!data.is_empty()).then_some(data.as_str());
        nix::mount::mount(
            Some(device.as_path()),
            mount_point,
            Some(image.fs_type.as_str()),
            flags,
            data,
        )
        .map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "mount {} on {} failed: {}",
                    device.display(),
                    mount_point.display(),
                    e
                ),
            ))
        })?;

        #[cfg(feature = "hvb")]
        if let Some(verity_device) = verity_device {
            verity_device.keep();
        }
        loop_device.release();

        tracing::info!(
            module = %file.name(),
            device = %device.display(),
            mount_point = %mount_point.display(),
            fs_type = %image.fs_type,
            verity,
            "Mounted module image"
        );
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        nix::mount::umount2(mount_point, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("unmount {} failed: {}", mount_point.display(), e),
            ))
        })?;
        tracing::info!(mount_point = %mount_point.display(), "Unmounted module image");
        Ok(())
    }
}
