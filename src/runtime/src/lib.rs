//! HMP Update Runtime - module update engine implementation.
//!
//! This crate provides the update-apply engine for hot-swappable module
//! packages: package parsing and verified-boot checks, loop device and
//! dm-verity provisioning, the resolve/activate/backup/revert state machine,
//! and the producer/consumer runtime that heals crashed modules.

#![allow(clippy::result_large_err)]

pub mod dm;
pub mod hvb;
pub mod log;
pub mod loopdev;
pub mod module;
pub mod mount;
pub mod param;
pub mod runtime;
pub mod service;
pub mod task;
pub mod update;
pub mod zip;

// Re-export common types
pub use hvb::{HashTreeCert, VerifiedBootData};
pub use log::ResultLog;
pub use loopdev::{LoopDevice, LoopDeviceManager};
pub use module::{
    FsType, HmpInfo, ImageStat, ModuleFile, ModuleFileRepository, ModuleRoot, PackType,
};
pub use mount::{DeviceMounter, ImageMounter};
pub use param::{FileParamStore, MemoryParamStore, ParamStore};
pub use runtime::{ProcessProbe, SaTable, SysinfoProbe, UpdateRuntime};
pub use service::{ModuleInfo, ModulePackageInfo, ModuleUpdateService};
pub use task::TaskManager;
pub use update::{ModuleUpdater, RevertTrigger};

/// HMP Update Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the metadata entry inside a module package.
pub const CONFIG_ENTRY: &str = "config.json";

/// Name of the mountable image entry inside a module package.
pub const IMAGE_ENTRY: &str = "module.img";

/// Name of the embedded public key entry inside a module package.
pub const PUBLIC_KEY_ENTRY: &str = "pub_key";

/// Name of the hmp metadata file.
pub const PACK_INFO: &str = "pack.info";
