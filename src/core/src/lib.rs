//! HMP Update Core - Foundational Types
//!
//! Types shared by the module update runtime and its daemon: the error
//! taxonomy and result codes, engine configuration, module versions,
//! result-log records, update events and the bounded update queue.

pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod queue;
pub mod version;

// Re-export commonly used types
pub use config::{LoopConfig, MountConfig, UpdateConfig};
pub use error::{ErrorCode, Result, UpdateError};
pub use event::{ModuleUpdateStatus, QueueEntry, SaSignal, APP_EVENT_ID};
pub use log::ResultRecord;
pub use queue::UpdateQueue;
pub use version::{compare_version, ModuleVersion};

/// HMP Update version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
