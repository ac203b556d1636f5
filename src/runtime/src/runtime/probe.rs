//! Process liveness checks.

use parking_lot::Mutex;
use sysinfo::System;

/// Answers whether a process with the given name is alive.
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, process_name: &str) -> bool;
}

/// Walks the process table.
///
/// The `System` snapshot is reused between calls and refreshed on each one.
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe").finish_non_exhaustive()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn is_running(&self, process_name: &str) -> bool {
        let mut sys = self.sys.lock();
        sys.refresh_processes();
        let running = sys.processes_by_exact_name(process_name).next().is_some();
        tracing::trace!(process = process_name, running, "Probed process");
        running
    }
}
