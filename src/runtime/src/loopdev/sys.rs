//! Raw loop device ioctls.
//!
//! Every `unsafe` block of the loop device manager lives here. Callers get
//! safe functions taking open files and validated structs.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

pub const LOOP_SET_FD: u32 = 0x4C00;
pub const LOOP_CLR_FD: u32 = 0x4C01;
pub const LOOP_SET_STATUS64: u32 = 0x4C04;
pub const LOOP_SET_DIRECT_IO: u32 = 0x4C08;
pub const LOOP_SET_BLOCK_SIZE: u32 = 0x4C09;
pub const LOOP_CONFIGURE: u32 = 0x4C0A;
pub const LOOP_CTL_ADD: u32 = 0x4C80;
pub const LOOP_CTL_GET_FREE: u32 = 0x4C82;
pub const BLKFLSBUF: u32 = 0x1261;

pub const LO_FLAGS_READ_ONLY: u32 = 1;
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
pub const LO_FLAGS_DIRECT_IO: u32 = 16;

pub const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

impl LoopInfo64 {
    /// Status for a read-only binding of `[offset, offset + size)`.
    ///
    /// `tag` is truncated to fit and always NUL-terminated.
    pub fn new(offset: u64, size: u64, flags: u32, tag: &str) -> Self {
        let mut lo_file_name = [0u8; LO_NAME_SIZE];
        let bytes = tag.as_bytes();
        let len = bytes.len().min(LO_NAME_SIZE - 1);
        lo_file_name[..len].copy_from_slice(&bytes[..len]);

        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: offset,
            lo_sizelimit: size,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: flags,
            lo_file_name,
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// `struct loop_config`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoopConfigRaw {
    pub fd: u32,
    pub block_size: u32,
    pub info: LoopInfo64,
    pub reserved: [u64; 8],
}

fn check(ret: libc::c_int, op: &str) -> io::Result<libc::c_int> {
    if ret < 0 {
        let err = io::Error::last_os_error();
        tracing::trace!(op, error = %err, "Loop ioctl failed");
        return Err(err);
    }
    Ok(ret)
}

/// Ask loop-control for a free device index.
pub fn ctl_get_free(control: &File) -> io::Result<u32> {
    // SAFETY: LOOP_CTL_GET_FREE takes no argument.
    let ret = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
    check(ret, "LOOP_CTL_GET_FREE").map(|index| index as u32)
}

/// Add a loop device with the given index. An existing device is not an error.
pub fn ctl_add(control: &File, index: u32) -> io::Result<()> {
    // SAFETY: LOOP_CTL_ADD takes the index by value.
    let ret = unsafe {
        libc::ioctl(
            control.as_raw_fd(),
            LOOP_CTL_ADD as _,
            index as libc::c_ulong,
        )
    };
    match check(ret, "LOOP_CTL_ADD") {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bind and configure in one call (Linux 5.8+).
pub fn configure(device: &File, config: &LoopConfigRaw) -> io::Result<()> {
    // SAFETY: `config` points to a live, fully initialised loop_config.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_CONFIGURE as _,
            config as *const LoopConfigRaw,
        )
    };
    check(ret, "LOOP_CONFIGURE").map(|_| ())
}

pub fn set_fd(device: &File, backing: &File) -> io::Result<()> {
    // SAFETY: LOOP_SET_FD takes the backing descriptor by value.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_FD as _,
            backing.as_raw_fd() as libc::c_ulong,
        )
    };
    check(ret, "LOOP_SET_FD").map(|_| ())
}

pub fn clr_fd(device: &File) -> io::Result<()> {
    // SAFETY: LOOP_CLR_FD takes no argument.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _) };
    check(ret, "LOOP_CLR_FD").map(|_| ())
}

pub fn set_status(device: &File, info: &LoopInfo64) -> io::Result<()> {
    // SAFETY: `info` points to a live, fully initialised loop_info64.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            info as *const LoopInfo64,
        )
    };
    check(ret, "LOOP_SET_STATUS64").map(|_| ())
}

pub fn set_direct_io(device: &File, enabled: bool) -> io::Result<()> {
    // SAFETY: LOOP_SET_DIRECT_IO takes the switch by value.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_DIRECT_IO as _,
            enabled as libc::c_ulong,
        )
    };
    check(ret, "LOOP_SET_DIRECT_IO").map(|_| ())
}

pub fn set_block_size(device: &File, block_size: u32) -> io::Result<()> {
    // SAFETY: LOOP_SET_BLOCK_SIZE takes the size by value.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_BLOCK_SIZE as _,
            block_size as libc::c_ulong,
        )
    };
    check(ret, "LOOP_SET_BLOCK_SIZE").map(|_| ())
}

/// Flush the block device buffer cache.
pub fn flush_buffers(device: &File) -> io::Result<()> {
    // SAFETY: BLKFLSBUF takes no argument.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), BLKFLSBUF as _, 0 as libc::c_ulong) };
    check(ret, "BLKFLSBUF").map(|_| ())
}

/// Filesystem magic of the filesystem holding `file`.
pub fn statfs_magic(file: &File) -> io::Result<u32> {
    let mut buf = std::mem::MaybeUninit::<libc::statfs>::zeroed();
    // SAFETY: `buf` is valid for writes of one statfs struct.
    let ret = unsafe { libc::fstatfs(file.as_raw_fd(), buf.as_mut_ptr()) };
    check(ret, "fstatfs")?;
    // SAFETY: fstatfs succeeded and initialised the struct.
    let stat = unsafe { buf.assume_init() };
    Ok((stat.f_type as u64 & 0xffff_ffff) as u32)
}
