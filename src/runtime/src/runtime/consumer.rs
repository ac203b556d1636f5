//! Update consumer: drains the queue into reverts and reinstalls.

use super::{ProcessProbe, SaTable};
use crate::update::{ModuleUpdater, RevertTrigger};
use hmp_update_core::event::{QueueEntry, SaSignal};
use hmp_update_core::queue::UpdateQueue;
use std::sync::Arc;

/// What the consumer did with one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Reverted { hmp: String, trigger: RevertTrigger },
    Reinstalled { hmp: String },
    Skipped,
}

pub(crate) struct Consumer {
    pub(crate) updater: Arc<ModuleUpdater>,
    pub(crate) table: Arc<SaTable>,
    pub(crate) probe: Arc<dyn ProcessProbe>,
    pub(crate) queue: Arc<UpdateQueue>,
}

impl Consumer {
    pub(crate) fn handle(&self, entry: &QueueEntry) -> Action {
        if entry.is_app() {
            return self.revert(&entry.token, RevertTrigger::AppInstallFailure);
        }

        let Some(module) = self.table.module(entry.source_id) else {
            tracing::warn!(sa_id = entry.source_id, "Unknown SA id, skipping");
            return Action::Skipped;
        };
        let signal = match entry.token.parse::<SaSignal>() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(sa_id = entry.source_id, error = %e, "Skipping entry");
                return Action::Skipped;
            }
        };

        match signal {
            SaSignal::LoadFail => self.revert(&module.hmp, RevertTrigger::SaLoadFailure),
            SaSignal::Crash => self.revert(&module.hmp, RevertTrigger::SaCrash),
            SaSignal::Unloaded => {
                let hot = self
                    .table
                    .hmp_info(&module.hmp)
                    .is_some_and(|info| info.hot_install);
                if !hot || self.probe.is_running(&module.name) {
                    tracing::debug!(sa_id = module.id, hot, "Unloaded SA needs no action");
                    return Action::Skipped;
                }
                match self.updater.reinstall(&module.hmp) {
                    Ok(_) => Action::Reinstalled {
                        hmp: module.hmp.clone(),
                    },
                    Err(e) => {
                        tracing::warn!(hmp = %module.hmp, error = %e, "Reinstall failed");
                        Action::Skipped
                    }
                }
            }
            SaSignal::Loaded => Action::Skipped,
        }
    }

    fn revert(&self, hmp: &str, trigger: RevertTrigger) -> Action {
        match self.updater.revert(hmp, trigger) {
            Ok(()) => Action::Reverted {
                hmp: hmp.to_string(),
                trigger,
            },
            Err(e) => {
                tracing::warn!(hmp, trigger = %trigger, error = %e, "Revert failed");
                Action::Skipped
            }
        }
    }

    /// Handle entries until the stop sentinel arrives.
    pub(crate) fn run(self) {
        tracing::debug!("Consumer started");
        loop {
            let entry = self.queue.pop();
            if entry.is_stop() {
                break;
            }
            let action = self.handle(&entry);
            tracing::debug!(sa_id = entry.source_id, token = %entry.token, ?action, "Handled entry");
        }
        tracing::debug!("Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hvb::builder::{sign_package, SigningKey};
    use crate::log::ResultLog;
    use crate::module::file::test_support::*;
    use crate::module::ModuleFileRepository;
    use crate::param::{MemoryParamStore, ParamStore, POWER_CTRL, REBOOT_FOR_REVERT};
    use crate::update::test_support::RecordingMounter;
    use hmp_update_core::config::UpdateConfig;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::Path;

    #[derive(Default)]
    struct FakeProbe {
        running: Mutex<HashSet<String>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, process_name: &str) -> bool {
            self.running.lock().contains(process_name)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: UpdateConfig,
        params: Arc<MemoryParamStore>,
        mounter: Arc<RecordingMounter>,
        probe: Arc<FakeProbe>,
        consumer: Consumer,
    }

    fn write_hmp(root: &Path, key: &SigningKey, version: &str, hot: bool, sign: bool) {
        let dir = root.join("demo");
        write_pack_info(&dir, "demo", "sa", hot, &["com.demo.app"]);
        let path = dir.join("demo_sa.zip");
        let image = signed_image(key, "demo_sa");
        write_package(&path, "demo_sa", 42, version, Some(image.as_slice()), Some(key));
        if sign {
            sign_package(&path, key).unwrap();
        }
    }

    fn harness(hot: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateConfig::rooted_at(dir.path());
        let key = SigningKey::generate().unwrap();
        write_hmp(&config.preinstalled_dir, &key, "1.0.0", hot, false);
        write_hmp(&config.active_dir, &key, "1.1.0", hot, true);
        write_hmp(&config.backup_dir, &key, "1.0.5", hot, true);

        let log = Arc::new(ResultLog::new(&config.result_log_path));
        let table = Arc::new(SaTable::build(&config.preinstalled_dir));
        let params = Arc::new(MemoryParamStore::new());
        let mounter = Arc::new(RecordingMounter::default());
        let probe = Arc::new(FakeProbe::default());
        let updater = Arc::new(ModuleUpdater::new(
            config.clone(),
            Arc::clone(&table),
            Arc::new(ModuleFileRepository::new(&config, Arc::clone(&log))),
            log,
            mounter.clone(),
            params.clone(),
        ));
        let consumer = Consumer {
            updater,
            table,
            probe: probe.clone(),
            queue: Arc::new(UpdateQueue::new(4)),
        };
        Harness {
            _dir: dir,
            config,
            params,
            mounter,
            probe,
            consumer,
        }
    }

    #[test]
    fn test_crash_reverts_with_reboot() {
        let h = harness(false);
        let action = h.consumer.handle(&QueueEntry::sa(42, SaSignal::Crash));
        assert_eq!(
            action,
            Action::Reverted {
                hmp: "demo".into(),
                trigger: RevertTrigger::SaCrash
            }
        );
        assert_eq!(h.params.get(POWER_CTRL).as_deref(), Some(REBOOT_FOR_REVERT));
        assert!(!h.config.backup_dir.join("demo").exists());
    }

    #[test]
    fn test_app_failure_reverts_without_reboot() {
        let h = harness(false);
        let action = h.consumer.handle(&QueueEntry::app("demo"));
        assert!(matches!(
            action,
            Action::Reverted {
                trigger: RevertTrigger::AppInstallFailure,
                ..
            }
        ));
        assert!(h.params.get(POWER_CTRL).is_none());
    }

    #[test]
    fn test_unloaded_hot_sa_reinstalled_when_not_running() {
        let h = harness(true);
        let action = h.consumer.handle(&QueueEntry::sa(42, SaSignal::Unloaded));
        assert_eq!(action, Action::Reinstalled { hmp: "demo".into() });
        assert_eq!(h.mounter.mounts().len(), 1);

        h.probe.running.lock().insert("demo_sa".to_string());
        assert_eq!(
            h.consumer.handle(&QueueEntry::sa(42, SaSignal::Unloaded)),
            Action::Skipped
        );
    }

    #[test]
    fn test_unloaded_cold_sa_ignored() {
        let h = harness(false);
        assert_eq!(
            h.consumer.handle(&QueueEntry::sa(42, SaSignal::Unloaded)),
            Action::Skipped
        );
        assert!(h.mounter.mounts().is_empty());
    }

    #[test]
    fn test_unknown_entries_skipped() {
        let h = harness(false);
        assert_eq!(h.consumer.handle(&QueueEntry::sa(99, SaSignal::Crash)), Action::Skipped);
        assert_eq!(h.consumer.handle(&QueueEntry::new(42, "bogus")), Action::Skipped);
        assert_eq!(h.consumer.handle(&QueueEntry::app("ghost")), Action::Skipped);
        assert!(h.config.active_dir.join("demo").exists());
    }

    #[test]
    fn test_run_exits_on_stop() {
        let h = harness(false);
        let queue = Arc::clone(&h.consumer.queue);
        assert!(queue.put(QueueEntry::sa(42, SaSignal::Loaded)));
        queue.stop();
        h.consumer.run();
        assert!(h.params.get(POWER_CTRL).is_none());
    }
}
