//! Top-level module update service.
//!
//! Owns the SA table, repository, orchestrator and queue runtime and exposes
//! the operations the IPC layer calls: the boot-time pass, install,
//! uninstall, package queries, status reports and crash callbacks.

use crate::log::ResultLog;
use crate::module::{HmpInfo, ModuleFileRepository, ModuleRoot, PackType};
use crate::mount::ImageMounter;
use crate::param::ParamStore;
use crate::runtime::{ProcessProbe, SaTable, UpdateRuntime};
use crate::task::TaskManager;
use crate::update::ModuleUpdater;
use hmp_update_core::config::UpdateConfig;
use hmp_update_core::error::{ErrorCode, Result, UpdateError};
use hmp_update_core::event::{ModuleUpdateStatus, QueueEntry, SaSignal};
use hmp_update_core::log::ResultRecord;
use hmp_update_core::version::ModuleVersion;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One module of a reported hmp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub id: i32,
    pub version: String,
}

/// Effective generation of one hmp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePackageInfo {
    pub hmp_name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: PackType,
    pub hot_install: bool,
    /// `true` when the factory generation is in effect.
    pub is_preinstalled: bool,
    pub modules: Vec<ModuleInfo>,
}

pub struct ModuleUpdateService {
    config: UpdateConfig,
    table: Arc<SaTable>,
    result_log: Arc<ResultLog>,
    repository: Arc<ModuleFileRepository>,
    updater: Arc<ModuleUpdater>,
    mounter: Arc<dyn ImageMounter>,
    params: Arc<dyn ParamStore>,
    probe: Arc<dyn ProcessProbe>,
    runtime: Mutex<Option<UpdateRuntime>>,
    /// Crash callbacks are honoured only while the event service is up.
    crash_listener: AtomicBool,
}

impl std::fmt::Debug for ModuleUpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleUpdateService")
            .field("preinstalled_dir", &self.config.preinstalled_dir)
            .field("hmps", &self.table.hmp_names().len())
            .field("runtime", &self.runtime.lock().is_some())
            .finish()
    }
}

impl ModuleUpdateService {
    /// Validate `config` and build the SA table from the factory root.
    pub fn new(
        config: UpdateConfig,
        mounter: Arc<dyn ImageMounter>,
        params: Arc<dyn ParamStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let result_log = Arc::new(ResultLog::new(&config.result_log_path));
        let table = Arc::new(SaTable::build(&config.preinstalled_dir));
        let repository = Arc::new(ModuleFileRepository::new(&config, Arc::clone(&result_log)));
        let updater = Arc::new(ModuleUpdater::new(
            config.clone(),
            Arc::clone(&table),
            Arc::clone(&repository),
            Arc::clone(&result_log),
            Arc::clone(&mounter),
            Arc::clone(&params),
        ));

        Ok(Self {
            config,
            table,
            result_log,
            repository,
            updater,
            mounter,
            params,
            probe,
            runtime: Mutex::new(None),
            crash_listener: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn table(&self) -> &SaTable {
        &self.table
    }

    pub fn updater(&self) -> &ModuleUpdater {
        &self.updater
    }

    /// Boot-time pass: resolve and mount every factory hmp, one task per
    /// hmp. Blocks until the pool drains. Returns `true` when every hmp
    /// mounted.
    pub fn check_all_modules(&self) -> bool {
        let started = Instant::now();
        let count = u32::try_from(self.table.len()).unwrap_or(u32::MAX);
        if let Err(e) = self.mounter.preallocate(count) {
            tracing::warn!(count, error = %e, "Loop device preallocation failed");
        }

        self.repository.index(&self.table.all_ids());

        let mut pool = TaskManager::new(self.config.task_workers, self.config.task_queue_capacity);
        let mut all_succeeded = true;
        for hmp in self.table.hmp_names() {
            let updater = Arc::clone(&self.updater);
            let name = hmp.clone();
            if !pool.submit(move || updater.check_and_mount(&name).is_all_mount_success) {
                tracing::error!(hmp = %hmp, "Failed to schedule boot pass");
                all_succeeded = false;
            }
        }
        pool.wait();
        all_succeeded &= pool.all_succeeded();
        pool.shutdown();

        self.repository.clear();
        tracing::info!(
            hmps = self.table.hmp_names().len(),
            success = all_succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Boot-time module check complete"
        );
        all_succeeded
    }

    /// Install the hmp directory at `hmp_path` and record the outcome.
    pub fn install_one(&self, hmp_path: &Path) -> ErrorCode {
        let started = Instant::now();
        let name = HmpInfo::load(hmp_path)
            .map(|info| info.name)
            .unwrap_or_else(|_| hmp_path.display().to_string());

        let (code, info) = match self.updater.install(hmp_path) {
            Ok(status) if status.is_hot_install => (ErrorCode::Success, "installed and activated"),
            Ok(_) => (ErrorCode::Success, "installed, effective after reboot"),
            Err(e) => {
                tracing::warn!(hmp = %name, error = %e, "Install failed");
                let code = e.code();
                self.append_record(
                    ResultRecord::new(&name, code, e.to_string())
                        .with_duration(elapsed_ms(started.elapsed())),
                );
                return code;
            }
        };
        tracing::info!(hmp = %name, "Install succeeded");
        self.append_record(
            ResultRecord::new(&name, code, info).with_duration(elapsed_ms(started.elapsed())),
        );
        code
    }

    /// Remove the installed generations of `hmp_name`.
    pub fn uninstall_one(&self, hmp_name: &str) -> ErrorCode {
        let started = Instant::now();
        let (code, info) = match self.updater.uninstall(hmp_name) {
            Ok(()) => (ErrorCode::Success, "uninstalled".to_string()),
            Err(e) => {
                tracing::warn!(hmp = hmp_name, error = %e, "Uninstall failed");
                (e.code(), e.to_string())
            }
        };
        self.append_record(
            ResultRecord::new(hmp_name, code, info).with_duration(elapsed_ms(started.elapsed())),
        );
        code
    }

    fn append_record(&self, record: ResultRecord) {
        if let Err(e) = self.result_log.append(&record) {
            tracing::warn!(name = %record.name, error = %e, "Failed to write result record");
        }
    }

    /// Effective generation of every factory hmp, or of `hmp_name` when it
    /// is non-empty.
    pub fn get_package_info(&self, hmp_name: &str) -> Result<Vec<ModulePackageInfo>> {
        let names = if hmp_name.is_empty() {
            self.table.hmp_names()
        } else if self.table.contains_hmp(hmp_name) {
            vec![hmp_name.to_string()]
        } else {
            return Err(UpdateError::NotFound(format!(
                "{} is not a preinstalled hmp",
                hmp_name
            )));
        };

        let mut packages = Vec::with_capacity(names.len());
        for hmp in names {
            let resolution = self.updater.describe(&hmp)?;
            let dir = self.updater.root_dir(resolution.generation).join(&hmp);
            let info = match HmpInfo::load(&dir) {
                Ok(info) => info,
                Err(_) => self
                    .table
                    .hmp_info(&hmp)
                    .cloned()
                    .ok_or_else(|| UpdateError::NotFound(format!("pack.info of {}", hmp)))?,
            };

            packages.push(ModulePackageInfo {
                hmp_name: hmp,
                version: info.version,
                kind: info.kind,
                hot_install: info.hot_install,
                is_preinstalled: resolution.generation == ModuleRoot::Preinstalled,
                modules: resolution
                    .files
                    .iter()
                    .map(|file| ModuleInfo {
                        name: file.name().to_string(),
                        id: file.id(),
                        version: file.version().to_string(),
                    })
                    .collect(),
            });
        }
        Ok(packages)
    }

    /// Record a mount outcome observed by an external caller.
    pub fn report_status(&self, status: &ModuleUpdateStatus) -> Result<()> {
        self.updater.report_status(status)
    }

    /// Read and delete every result record.
    pub fn take_results(&self) -> Result<Vec<ResultRecord>> {
        self.result_log.take_all()
    }

    pub fn effective_version(&self, module_name: &str) -> Option<ModuleVersion> {
        self.updater.effective_version(module_name)
    }

    /// Spawn the producer and consumer threads. A second call is a no-op.
    pub fn start_runtime(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }
        *runtime = Some(UpdateRuntime::start(
            Arc::clone(&self.updater),
            Arc::clone(&self.table),
            Arc::clone(&self.params),
            Arc::clone(&self.probe),
            self.config.queue_capacity,
            Duration::from_millis(self.config.producer_poll_ms),
        )?);
        Ok(())
    }

    /// Crash notification for `process_name`. Returns whether a crash entry
    /// was queued.
    pub fn on_process_crash(&self, process_name: &str) -> bool {
        if !self.crash_listener.load(Ordering::SeqCst) {
            tracing::debug!(process = process_name, "Crash listener inactive, ignoring");
            return false;
        }
        let Some(sa_id) = self.table.id_by_process(process_name) else {
            tracing::debug!(process = process_name, "Crashed process hosts no known SA");
            return false;
        };

        let queue = self.runtime.lock().as_ref().map(UpdateRuntime::queue);
        match queue {
            Some(queue) => {
                tracing::warn!(process = process_name, sa_id, "SA process crashed");
                queue.put(QueueEntry::sa(sa_id, SaSignal::Crash))
            }
            None => {
                tracing::warn!(process = process_name, "Runtime not started, crash dropped");
                false
            }
        }
    }

    pub fn on_sys_event_service_available(&self) {
        self.crash_listener.store(true, Ordering::SeqCst);
        tracing::info!("Crash listener active");
    }

    pub fn on_sys_event_service_died(&self) {
        self.crash_listener.store(false, Ordering::SeqCst);
        tracing::info!("Crash listener inactive");
    }

    /// Stop the queue runtime and join its threads.
    pub fn shutdown(&self) {
        if let Some(mut runtime) = self.runtime.lock().take() {
            runtime.shutdown();
        }
    }
}

impl Drop for ModuleUpdateService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
