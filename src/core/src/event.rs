//! Update events flowing from signal producers to the revert/reinstall consumer.

use serde::{Deserialize, Serialize};

/// Source id marking "an application bundle inside this hmp failed to install".
///
/// SA ids are positive, so a negative sentinel cannot collide with them.
pub const APP_EVENT_ID: i32 = -1;

/// Signal tokens an SA reports through the parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaSignal {
    Loaded,
    Unloaded,
    LoadFail,
    Crash,
}

impl SaSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaSignal::Loaded => "loaded",
            SaSignal::Unloaded => "unloaded",
            SaSignal::LoadFail => "load_fail",
            SaSignal::Crash => "crash",
        }
    }

    /// Whether this signal warrants producer attention.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, SaSignal::Loaded)
    }
}

impl std::fmt::Display for SaSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SaSignal {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "loaded" => Ok(Self::Loaded),
            "unloaded" => Ok(Self::Unloaded),
            "load_fail" => Ok(Self::LoadFail),
            "crash" => Ok(Self::Crash),
            _ => Err(format!("unknown SA signal: '{}'", s)),
        }
    }
}

/// One entry of the update queue: (source id, status token).
///
/// For SA events the token is an [`SaSignal`] string; for application
/// events (`source_id == APP_EVENT_ID`) it is the hmp name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueEntry {
    pub source_id: i32,
    pub token: String,
}

impl QueueEntry {
    pub fn new(source_id: i32, token: impl Into<String>) -> Self {
        Self {
            source_id,
            token: token.into(),
        }
    }

    /// Event raised for an SA state change.
    pub fn sa(sa_id: i32, signal: SaSignal) -> Self {
        Self::new(sa_id, signal.as_str())
    }

    /// Event raised when the hmp's application bundle failed to install.
    pub fn app(hmp_name: impl Into<String>) -> Self {
        Self::new(APP_EVENT_ID, hmp_name)
    }

    /// The reserved stop sentinel `(0, "")`.
    pub fn stop() -> Self {
        Self::new(0, "")
    }

    pub fn is_stop(&self) -> bool {
        self.source_id == 0 && self.token.is_empty()
    }

    pub fn is_app(&self) -> bool {
        self.source_id == APP_EVENT_ID
    }
}

/// Outcome of one orchestration attempt for an hmp. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleUpdateStatus {
    pub hmp_name: String,
    pub is_pre_installed: bool,
    pub is_all_mount_success: bool,
    pub is_hot_install: bool,
}

impl ModuleUpdateStatus {
    pub fn new(hmp_name: impl Into<String>) -> Self {
        Self {
            hmp_name: hmp_name.into(),
            is_all_mount_success: true,
            ..Default::default()
        }
    }
}
