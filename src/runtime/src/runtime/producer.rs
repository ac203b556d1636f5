//! Signal producer: turns parameter-store flags into queue entries.

use super::SaTable;
use crate::param::{
    bundle_status_key, sa_status_key, ParamStore, BUNDLE_REVERT_FLAG, FLAG_CLEAR, FLAG_SET,
    SA_ABNORMAL_FLAG,
};
use hmp_update_core::event::{QueueEntry, SaSignal};
use hmp_update_core::queue::UpdateQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bundle status value marking a failed bundle install.
pub const BUNDLE_FAIL: &str = "fail";

pub(crate) struct Producer {
    pub(crate) table: Arc<SaTable>,
    pub(crate) params: Arc<dyn ParamStore>,
    pub(crate) queue: Arc<UpdateQueue>,
}

impl Producer {
    /// Sample both trigger flags once. Returns the number of entries queued.
    pub(crate) fn poll_once(&self) -> usize {
        let mut queued = 0;
        if self.take_flag(SA_ABNORMAL_FLAG) {
            queued += self.scan_sa_status();
        }
        if self.take_flag(BUNDLE_REVERT_FLAG) {
            queued += self.scan_bundle_status();
        }
        queued
    }

    /// Read-and-clear a trigger flag.
    fn take_flag(&self, name: &str) -> bool {
        if self.params.get(name).as_deref() != Some(FLAG_SET) {
            return false;
        }
        if let Err(e) = self.params.set(name, FLAG_CLEAR) {
            tracing::warn!(flag = name, error = %e, "Failed to clear trigger flag");
        }
        true
    }

    fn scan_sa_status(&self) -> usize {
        let mut queued = 0;
        for sa_id in self.table.sa_ids() {
            let key = sa_status_key(sa_id);
            let Some(token) = self.params.get(&key).filter(|t| !t.is_empty()) else {
                continue;
            };
            let signal = match token.parse::<SaSignal>() {
                Ok(signal) if signal.is_abnormal() => signal,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(sa_id, error = %e, "Ignoring SA status");
                    continue;
                }
            };

            if let Err(e) = self.params.set(&key, "") {
                tracing::warn!(sa_id, error = %e, "Failed to clear SA status");
            }
            tracing::info!(sa_id, signal = %signal, "Observed abnormal SA");
            if self.queue.put(QueueEntry::sa(sa_id, signal)) {
                queued += 1;
            }
        }
        queued
    }

    fn scan_bundle_status(&self) -> usize {
        let mut queued = 0;
        for hmp in self.table.hmp_names() {
            let key = bundle_status_key(&hmp);
            if self.params.get(&key).as_deref() != Some(BUNDLE_FAIL) {
                continue;
            }
            if let Err(e) = self.params.set(&key, "") {
                tracing::warn!(hmp = %hmp, error = %e, "Failed to clear bundle status");
            }
            tracing::info!(hmp = %hmp, "Observed failed bundle install");
            if self.queue.put(QueueEntry::app(hmp)) {
                queued += 1;
            }
        }
        queued
    }

    /// Poll until `exit` is set, then stop the queue so the consumer wakes.
    pub(crate) fn run(self, exit: Arc<AtomicBool>, poll: Duration) {
        tracing::debug!(poll_ms = poll.as_millis() as u64, "Producer started");
        while !exit.load(Ordering::SeqCst) {
            self.poll_once();
            std::thread::sleep(poll);
        }
        self.queue.stop();
        tracing::debug!("Producer stopped");
    }
}
