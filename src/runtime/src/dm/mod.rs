//! Verified block device provisioner.
//!
//! Stacks a dm-verity target on top of a loop device so every block read
//! from the mounted image is checked against the hash tree.

pub mod sys;

use crate::hvb::HashTreeCert;
use hmp_update_core::error::{Result, UpdateError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use sys::{DmRequest, TargetSpec};

const DM_CONTROL: &str = "/dev/device-mapper";
const SECTOR_SIZE: u64 = 512;

/// dm-verity table for one image.
///
/// Data and hash tree live on the same device: the tree starts at
/// `hash_start_block` hash blocks into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTarget {
    pub data_device: String,
    pub hash_device: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub num_data_blocks: u64,
    pub hash_start_block: u64,
    pub algorithm: String,
    pub root_digest: String,
    pub salt: String,
}

impl VerityTarget {
    /// Build the target for `device` from a verified certificate.
    pub fn from_cert(device: &Path, cert: &HashTreeCert) -> Self {
        let device = device.display().to_string();
        Self {
            data_device: device.clone(),
            hash_device: device,
            data_block_size: cert.data_block_size,
            hash_block_size: cert.hash_block_size,
            num_data_blocks: cert.num_data_blocks(),
            hash_start_block: cert.hash_start_block(),
            algorithm: cert.algorithm.clone(),
            root_digest: hex::encode(&cert.root_digest),
            salt: if cert.salt.is_empty() {
                "-".to_string()
            } else {
                hex::encode(&cert.salt)
            },
        }
    }

    /// Target length in 512-byte sectors.
    pub fn length_sectors(&self) -> u64 {
        self.num_data_blocks * self.data_block_size as u64 / SECTOR_SIZE
    }

    /// Parameter string of the `verity` target.
    pub fn params(&self) -> String {
        format!(
            "1 {} {} {} {} {} {} {} {} {}",
            self.data_device,
            self.hash_device,
            self.data_block_size,
            self.hash_block_size,
            self.num_data_blocks,
            self.hash_start_block,
            self.algorithm,
            self.root_digest,
            self.salt
        )
    }

    fn spec(&self) -> TargetSpec {
        TargetSpec {
            sector_start: 0,
            length: self.length_sectors(),
            target_type: "verity".to_string(),
            params: self.params(),
        }
    }
}

/// An active verity device. Dropping an armed device removes it.
#[derive(Debug)]
pub struct VerityDevice {
    name: String,
    path: PathBuf,
    armed: bool,
}

impl VerityDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the device after this handle goes away.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for VerityDevice {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = teardown_verity_device(&self.name) {
                tracing::warn!(name = %self.name, error = %e, "Failed to remove verity device");
            }
        }
    }
}

fn open_control() -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(DM_CONTROL)
        .map_err(|e| {
            UpdateError::ResourceExhausted(format!("failed to open {}: {}", DM_CONTROL, e))
        })
}

fn ioctl(control: &File, op: u32, request: &mut DmRequest, what: &str, name: &str) -> Result<()> {
    sys::dm_ioctl(control, op, request).map_err(|e| {
        UpdateError::Io(std::io::Error::new(
            e.kind(),
            format!("{} of dm device {} failed: {}", what, name, e),
        ))
    })
}

/// Node path of a dm device with the given minor.
pub fn device_node(minor: u32) -> PathBuf {
    let block = PathBuf::from(format!("/dev/block/dm-{}", minor));
    if Path::new("/dev/block").is_dir() {
        block
    } else {
        PathBuf::from(format!("/dev/dm-{}", minor))
    }
}

/// Whether a dm device named `name` exists.
pub fn device_exists(name: &str) -> Result<bool> {
    let control = open_control()?;
    let mut request = DmRequest::new(name, 0)?;
    match sys::dm_ioctl(&control, sys::DM_DEV_STATUS, &mut request) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create, load and resume a verity device named `name`.
pub fn create_verity_device(name: &str, target: &VerityTarget) -> Result<VerityDevice> {
    if device_exists(name)? {
        tracing::warn!(name, "Removing stale verity device");
        teardown_verity_device(name)?;
    }

    let control = open_control()?;
    let mut create = DmRequest::new(name, 0)?;
    ioctl(&control, sys::DM_DEV_CREATE, &mut create, "create", name)?;
    let path = device_node(sys::dev_minor(create.dev()));

    // From here on the device exists and must be removed on failure.
    let device = VerityDevice {
        name: name.to_string(),
        path,
        armed: true,
    };

    let mut load = DmRequest::with_target(name, sys::DM_READONLY_FLAG, &target.spec())?;
    ioctl(&control, sys::DM_TABLE_LOAD, &mut load, "table load", name)?;

    let mut resume = DmRequest::new(name, 0)?;
    ioctl(&control, sys::DM_DEV_SUSPEND, &mut resume, "resume", name)?;

    tracing::info!(
        name,
        device = %device.path.display(),
        data_blocks = target.num_data_blocks,
        "Created verity device"
    );
    Ok(device)
}

/// Remove the dm device named `name`.
pub fn teardown_verity_device(name: &str) -> Result<()> {
    let control = open_control()?;
    let mut remove = DmRequest::new(name, 0)?;
    ioctl(&control, sys::DM_DEV_REMOVE, &mut remove, "remove", name)?;
    tracing::debug!(name, "Removed verity device");
    Ok(())
}

/// Device name used for a module's verity device.
pub fn verity_device_name(module_name: &str) -> String {
    let name = format!("hmp-{}", module_name);
    name.chars().take(sys::DM_NAME_LEN - 1).collect()
}
