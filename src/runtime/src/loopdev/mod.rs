//! Loop device manager.
//!
//! Binds a byte range of a package file to a free loop device so the
//! embedded image can be mounted without being extracted.

pub mod sys;

use hmp_update_core::config::LoopConfig;
use hmp_update_core::error::{Result, UpdateError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const LOOP_CONTROL: &str = "/dev/loop-control";

/// Read-only filesystems known to reject `O_DIRECT`.
const EROFS_SUPER_MAGIC: u32 = 0xE0F5_E1E2;
const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const OVERLAYFS_SUPER_MAGIC: u32 = 0x794C_7630;
const BUFFERED_IO_FILESYSTEMS: [u32; 3] =
    [EROFS_SUPER_MAGIC, SQUASHFS_MAGIC, OVERLAYFS_SUPER_MAGIC];

/// Kernel release that introduced LOOP_CONFIGURE.
const LOOP_CONFIGURE_SINCE: (u32, u32) = (5, 8);

/// Flags every binding carries. AUTOCLEAR makes the kernel detach the
/// device once the last reference goes away.
pub fn bind_flags(direct_io: bool) -> u32 {
    let mut flags = sys::LO_FLAGS_READ_ONLY | sys::LO_FLAGS_AUTOCLEAR;
    if direct_io {
        flags |= sys::LO_FLAGS_DIRECT_IO;
    }
    flags
}

/// Split a binding for the legacy path: LOOP_SET_STATUS64 ignores the
/// direct I/O flag, so it is turned on with LOOP_SET_DIRECT_IO instead.
fn legacy_status(info: &sys::LoopInfo64) -> (sys::LoopInfo64, bool) {
    let mut status = *info;
    let direct_io = status.lo_flags & sys::LO_FLAGS_DIRECT_IO != 0;
    status.lo_flags &= !sys::LO_FLAGS_DIRECT_IO;
    (status, direct_io)
}

/// Index of a `loopN` device node name.
pub fn parse_loop_index(name: &str) -> Option<u32> {
    name.strip_prefix("loop")?.parse().ok()
}

/// `(major, minor)` of a kernel release string such as `5.10.110-android12`.
pub fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn supports_loop_configure() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let supported = sysinfo::System::kernel_version()
            .as_deref()
            .and_then(parse_kernel_version)
            .is_some_and(|version| version >= LOOP_CONFIGURE_SINCE);
        tracing::debug!(supported, "Probed LOOP_CONFIGURE support");
        supported
    })
}

/// A bound loop device.
///
/// Dropping an armed device detaches it. [`LoopDevice::release`] hands the
/// binding over to whatever now holds the device (a mount), leaving the
/// kernel's auto-clear to detach it later.
#[derive(Debug)]
pub struct LoopDevice {
    index: u32,
    path: PathBuf,
    file: File,
    armed: bool,
}

impl LoopDevice {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop owning the binding.
    pub fn release(mut self) {
        self.armed = false;
        tracing::debug!(device = %self.path.display(), "Released loop device ownership");
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = sys::clr_fd(&self.file) {
                tracing::debug!(device = %self.path.display(), error = %e, "Loop detach on drop failed");
            }
        }
    }
}

/// Allocates and binds loop devices.
#[derive(Debug)]
pub struct LoopDeviceManager {
    config: LoopConfig,
    dev_dir: PathBuf,
    /// Serialises "get free" + bind: the kernel pair is not atomic.
    control_lock: Mutex<()>,
}

impl LoopDeviceManager {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            dev_dir: PathBuf::from("/dev"),
            control_lock: Mutex::new(()),
        }
    }

    fn open_control() -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(LOOP_CONTROL)
            .map_err(|e| {
                UpdateError::ResourceExhausted(format!("failed to open {}: {}", LOOP_CONTROL, e))
            })
    }

    /// Highest `loopN` index currently present under `/dev`.
    fn highest_index(&self) -> Option<u32> {
        let entries = std::fs::read_dir(&self.dev_dir).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_loop_index))
            .max()
    }

    /// Add `count` loop devices after the highest existing one.
    pub fn preallocate(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let control = Self::open_control()?;
        let start = self.highest_index().map_or(0, |index| index + 1);

        for index in start..start + count {
            sys::ctl_add(&control, index).map_err(|e| {
                UpdateError::ResourceExhausted(format!("failed to add loop{}: {}", index, e))
            })?;
        }
        tracing::info!(start, count, "Preallocated loop devices");
        Ok(())
    }

    /// Open the backing file read-only, preferring direct I/O.
    ///
    /// Returns the file and whether direct I/O is in effect.
    fn open_backing(path: &Path) -> Result<(File, bool)> {
        let direct = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT | libc::O_CLOEXEC)
            .open(path);
        match direct {
            Ok(file) => return Ok((file, true)),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => {
                return Err(UpdateError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to open {}: {}", path.display(), e),
                )))
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        let magic = sys::statfs_magic(&file)?;
        if !BUFFERED_IO_FILESYSTEMS.contains(&magic) {
            return Err(UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "{} rejects direct I/O on filesystem {:#x}",
                    path.display(),
                    magic
                ),
            )));
        }
        tracing::debug!(path = %path.display(), magic = format!("{:#x}", magic), "Falling back to buffered I/O");
        Ok((file, false))
    }

    fn node_candidates(&self, index: u32) -> [PathBuf; 2] {
        [
            self.dev_dir.join("block").join(format!("loop{}", index)),
            self.dev_dir.join(format!("loop{}", index)),
        ]
    }

    /// Wait for the kernel to create the device node.
    fn wait_for_node(&self, index: u32) -> Result<PathBuf> {
        for attempt in 0..self.config.node_wait_attempts {
            if let Some(path) = self.node_candidates(index).into_iter().find(|p| p.exists()) {
                return Ok(path);
            }
            if attempt + 1 < self.config.node_wait_attempts {
                std::thread::sleep(Duration::from_millis(self.config.node_wait_ms));
            }
        }
        Err(UpdateError::ResourceExhausted(format!(
            "loop{} node did not appear",
            index
        )))
    }

    /// Bind `[offset, offset + length)` of `backing` to a free loop device.
    pub fn create(&self, backing: &Path, offset: u64, length: u64) -> Result<LoopDevice> {
        let (backing_file, direct_io) = Self::open_backing(backing)?;
        let tag = backing
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let info = sys::LoopInfo64::new(offset, length, bind_flags(direct_io), &tag);

        let _guard = self.control_lock.lock();
        let control = Self::open_control()?;
        let index = sys::ctl_get_free(&control).map_err(|e| {
            UpdateError::ResourceExhausted(format!("no free loop device: {}", e))
        })?;
        let path = self.wait_for_node(index)?;

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| {
                UpdateError::ResourceExhausted(format!("failed to open {}: {}", path.display(), e))
            })?;

        if supports_loop_configure() {
            let config = sys::LoopConfigRaw {
                fd: std::os::fd::AsRawFd::as_raw_fd(&backing_file) as u32,
                block_size: 0,
                info,
                reserved: [0; 8],
            };
            sys::configure(&device, &config).map_err(|e| {
                UpdateError::ResourceExhausted(format!(
                    "LOOP_CONFIGURE on {} failed: {}",
                    path.display(),
                    e
                ))
            })?;
        } else {
            Self::bind_legacy(&device, &backing_file, &info).map_err(|e| {
                UpdateError::ResourceExhausted(format!(
                    "binding {} failed: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        tracing::info!(
            device = %path.display(),
            backing = %backing.display(),
            offset,
            length,
            direct_io,
            "Bound loop device"
        );

        Ok(LoopDevice {
            index,
            path,
            file: device,
            armed: true,
        })
    }

    /// set-fd, set-status64, flush, set-blocksize and set-direct-io for
    /// pre-5.8 kernels.
    fn bind_legacy(device: &File, backing: &File, info: &sys::LoopInfo64) -> std::io::Result<()> {
        let (status, direct_io) = legacy_status(info);
        sys::set_fd(device, backing)?;
        let configured = sys::set_status(device, &status).and_then(|_| sys::flush_buffers(device));
        if let Err(e) = configured {
            let _ = sys::clr_fd(device);
            return Err(e);
        }
        if let Err(e) = sys::set_block_size(device, 4096) {
            tracing::debug!(error = %e, "LOOP_SET_BLOCK_SIZE not applied");
        }
        if direct_io {
            if let Err(e) = sys::set_direct_io(device, true) {
                tracing::warn!(error = %e, "LOOP_SET_DIRECT_IO rejected, keeping buffered I/O");
            }
        }
        Ok(())
    }

    /// Best-effort read-ahead tuning through sysfs.
    pub fn configure_read_ahead(&self, device: &LoopDevice) -> Result<()> {
        let path = PathBuf::from(format!(
            "/sys/block/loop{}/queue/read_ahead_kb",
            device.index()
        ));
        std::fs::write(&path, self.config.read_ahead_kb.to_string()).map_err(|e| {
            UpdateError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to write {}: {}", path.display(), e),
            ))
        })
    }
}
