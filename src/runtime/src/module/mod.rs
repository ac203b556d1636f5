//! Module packages: parsing, hmp metadata and the verified index.

pub mod file;
pub mod pack;
pub mod repository;

pub use file::{FsType, ImageStat, ModuleFile};
pub use pack::{list_hmps, list_packages, HmpInfo, PackType};
pub use repository::{ModuleFileRepository, ModuleRoot};
