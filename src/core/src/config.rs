use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Module update engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Factory-shipped hmp directories (read-only partition)
    pub preinstalled_dir: PathBuf,

    /// Staging area for packages between install-begin and activation
    pub install_dir: PathBuf,

    /// Currently active (previously installed) generations
    pub active_dir: PathBuf,

    /// Last-known-good snapshot of the active generation
    pub backup_dir: PathBuf,

    /// Hard-linked copies of active images that are actually mounted
    pub mount_ready_dir: PathBuf,

    /// Parent directory of per-module mount points
    pub mount_root: PathBuf,

    /// Append-only result log consumed by the reporting API
    pub result_log_path: PathBuf,

    /// Backing file of the parameter store
    pub param_store_path: PathBuf,

    /// Capacity of the producer/consumer queue
    pub queue_capacity: usize,

    /// Capacity of the boot-time task queue
    pub task_queue_capacity: usize,

    /// Worker threads of the boot-time task pool
    pub task_workers: usize,

    /// Producer parameter sampling interval in milliseconds
    pub producer_poll_ms: u64,

    /// Loop device tuning
    #[serde(rename = "loop")]
    pub loop_device: LoopConfig,

    /// Mount tuning
    pub mount: MountConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            preinstalled_dir: PathBuf::from("/system/module_update"),
            install_dir: PathBuf::from("/data/module_update_package"),
            active_dir: PathBuf::from("/data/module_update/active"),
            backup_dir: PathBuf::from("/data/module_update/backup"),
            mount_ready_dir: PathBuf::from("/data/module_update/mount_ready"),
            mount_root: PathBuf::from("/module_update"),
            result_log_path: PathBuf::from("/data/updater/module_update_result"),
            param_store_path: PathBuf::from("/data/updater/module_update_params.json"),
            queue_capacity: 100,
            task_queue_capacity: 100,
            task_workers: 1,
            producer_poll_ms: 1000,
            loop_device: LoopConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Build a configuration rooted under `base`, mirroring the production layout.
    ///
    /// Used by tests and by sandboxed deployments.
    pub fn rooted_at(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            preinstalled_dir: base.join("system/module_update"),
            install_dir: base.join("data/module_update_package"),
            active_dir: base.join("data/module_update/active"),
            backup_dir: base.join("data/module_update/backup"),
            mount_ready_dir: base.join("data/module_update/mount_ready"),
            mount_root: base.join("module_update"),
            result_log_path: base.join("data/updater/module_update_result"),
            param_store_path: base.join("data/updater/module_update_params.json"),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON or YAML file (chosen by extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: UpdateConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => serde_json::from_str(&data)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 || self.task_queue_capacity == 0 {
            return Err(UpdateError::Config(
                "queue capacities must be greater than 0".to_string(),
            ));
        }
        if self.task_workers == 0 {
            return Err(UpdateError::Config(
                "task_workers must be greater than 0".to_string(),
            ));
        }
        if self.loop_device.create_retries == 0 {
            return Err(UpdateError::Config(
                "loop.create_retries must be greater than 0".to_string(),
            ));
        }

        let dirs = [
            ("preinstalled_dir", &self.preinstalled_dir),
            ("install_dir", &self.install_dir),
            ("active_dir", &self.active_dir),
            ("backup_dir", &self.backup_dir),
            ("mount_ready_dir", &self.mount_ready_dir),
            ("mount_root", &self.mount_root),
            ("result_log_path", &self.result_log_path),
            ("param_store_path", &self.param_store_path),
        ];
        for (name, dir) in dirs {
            if !dir.is_absolute() {
                return Err(UpdateError::Config(format!(
                    "{} must be an absolute path, got {}",
                    name,
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

/// Loop device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Attempts at binding a loop device before giving up
    pub create_retries: u32,

    /// Polls for the device node to appear
    pub node_wait_attempts: u32,

    /// Delay between device node polls
    pub node_wait_ms: u64,

    /// Read-ahead written to sysfs after binding
    pub read_ahead_kb: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            create_retries: 3,
            node_wait_attempts: 6,
            node_wait_ms: 50,
            read_ahead_kb: 128,
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Polls for the block device to appear before mounting
    pub wait_attempts: u32,

    /// Delay between block device polls
    pub wait_ms: u64,

    /// Mount data options
    pub options: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            wait_attempts: 150,
            wait_ms: 20,
            options: "noatime,nodev,dirsync".to_string(),
        }
    }
}
