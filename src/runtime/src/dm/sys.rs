//! Raw device-mapper ioctls on `/dev/device-mapper`.
//!
//! Requests are encoded into 8-byte aligned buffers holding a
//! `struct dm_ioctl` header, optionally followed by one
//! `struct dm_target_spec` and its NUL-terminated parameter string.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

pub const DM_DEV_CREATE: u32 = 0xC138_FD03;
pub const DM_DEV_REMOVE: u32 = 0xC138_FD04;
pub const DM_DEV_SUSPEND: u32 = 0xC138_FD06;
pub const DM_DEV_STATUS: u32 = 0xC138_FD07;
pub const DM_TABLE_LOAD: u32 = 0xC138_FD09;

pub const DM_READONLY_FLAG: u32 = 1 << 0;

pub const DM_VERSION: [u32; 3] = [4, 0, 0];
pub const DM_NAME_LEN: usize = 128;
pub const DM_MAX_TYPE_NAME: usize = 16;

/// `sizeof(struct dm_ioctl)`.
pub const DM_IOCTL_SIZE: usize = 312;
/// `sizeof(struct dm_target_spec)`.
pub const DM_TARGET_SPEC_SIZE: usize = 40;

const OFF_DATA_SIZE: usize = 12;
const OFF_DATA_START: usize = 16;
const OFF_TARGET_COUNT: usize = 20;
const OFF_FLAGS: usize = 28;
const OFF_DEV: usize = 40;
const OFF_NAME: usize = 48;

/// One table line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub sector_start: u64,
    /// Length in 512-byte sectors.
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

/// An encoded ioctl request.
#[derive(Debug, Clone)]
pub struct DmRequest {
    words: Vec<u64>,
    len: usize,
}

impl DmRequest {
    /// Header-only request for the device `name`.
    pub fn new(name: &str, flags: u32) -> io::Result<Self> {
        Self::build(name, flags, None)
    }

    /// Table load request carrying one target.
    pub fn with_target(name: &str, flags: u32, target: &TargetSpec) -> io::Result<Self> {
        Self::build(name, flags, Some(target))
    }

    fn build(name: &str, flags: u32, target: Option<&TargetSpec>) -> io::Result<Self> {
        if name.is_empty() || name.len() >= DM_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid dm device name '{}'", name),
            ));
        }

        let mut bytes = vec![0u8; DM_IOCTL_SIZE];
        for (i, word) in DM_VERSION.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
        }
        bytes[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name.as_bytes());
        bytes[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&flags.to_ne_bytes());
        bytes[OFF_DATA_START..OFF_DATA_START + 4]
            .copy_from_slice(&(DM_IOCTL_SIZE as u32).to_ne_bytes());

        if let Some(target) = target {
            if target.target_type.len() >= DM_MAX_TYPE_NAME {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid target type '{}'", target.target_type),
                ));
            }
            let params_len = (target.params.len() + 1).next_multiple_of(8);
            let spec_size = DM_TARGET_SPEC_SIZE + params_len;

            let mut spec = vec![0u8; spec_size];
            spec[0..8].copy_from_slice(&target.sector_start.to_ne_bytes());
            spec[8..16].copy_from_slice(&target.length.to_ne_bytes());
            // status (i32) stays 0; `next` is the offset to the following spec.
            spec[20..24].copy_from_slice(&(spec_size as u32).to_ne_bytes());
            spec[24..24 + target.target_type.len()].copy_from_slice(target.target_type.as_bytes());
            spec[DM_TARGET_SPEC_SIZE..DM_TARGET_SPEC_SIZE + target.params.len()]
                .copy_from_slice(target.params.as_bytes());

            bytes.extend_from_slice(&spec);
            bytes[OFF_TARGET_COUNT..OFF_TARGET_COUNT + 4].copy_from_slice(&1u32.to_ne_bytes());
        }

        let len = bytes.len();
        bytes[OFF_DATA_SIZE..OFF_DATA_SIZE + 4].copy_from_slice(&(len as u32).to_ne_bytes());

        let mut words = vec![0u64; len.div_ceil(8)];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        Ok(Self { words, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Request bytes as sent to the kernel.
    pub fn bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|w| w.to_ne_bytes())
            .take(self.len)
            .collect()
    }

    /// `dev` field of the (possibly kernel-updated) header.
    pub fn dev(&self) -> u64 {
        self.words[OFF_DEV / 8]
    }

    pub fn flags(&self) -> u32 {
        let word = self.words[OFF_FLAGS / 8];
        let bytes = word.to_ne_bytes();
        let off = OFF_FLAGS % 8;
        u32::from_ne_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    }
}

/// Minor number of a Linux `dev_t`.
pub fn dev_minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & 0xffff_ff00)) as u32
}

/// Issue `request` on the control device.
pub fn dm_ioctl(control: &File, op: u32, request: &mut DmRequest) -> io::Result<()> {
    // SAFETY: `words` is an 8-byte aligned buffer of at least `data_size`
    // bytes, as recorded in the header; the kernel writes within it.
    let ret = unsafe {
        libc::ioctl(
            control.as_raw_fd(),
            op as _,
            request.words.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        tracing::trace!(op = format!("{:#x}", op), error = %err, "dm ioctl failed");
        return Err(err);
    }
    Ok(())
}
