//! Integration test: boot pass, fallback and crash revert end to end.
//!
//! Drives [`ModuleUpdateService`] over a temporary directory tree with a
//! recording mounter, so no loop devices, device-mapper targets or mounts
//! are created and the tests run unprivileged:
//!
//! 1. Factory-only hmp is mounted at boot
//! 2. Newer active generation is staged and mounted on verity
//! 3. Corrupted active image falls back to the factory generation
//! 4. SA crash reported through the parameter store reverts and reboots
//!
//! ```bash
//! cargo test -p hmp-update-runtime --test update_integration
//! ```

use hmp_update_core::config::UpdateConfig;
use hmp_update_core::error::{ErrorCode, Result};
use hmp_update_runtime::hvb::builder::{sign_package, ImageBuilder, SigningKey};
use hmp_update_runtime::param::{
    bundle_install_result_key, sa_status_key, POWER_CTRL, REBOOT_FOR_REVERT, SA_ABNORMAL_FLAG,
};
use hmp_update_runtime::{
    ImageMounter, MemoryParamStore, ModuleFile, ModuleUpdateService, ParamStore, ProcessProbe,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

const BLOCK: usize = 4096;

#[derive(Debug, Clone)]
struct Mounted {
    source: PathBuf,
    mount_point: PathBuf,
    verity: bool,
}

#[derive(Default)]
struct RecordingMounter {
    mounts: Mutex<Vec<Mounted>>,
}

impl RecordingMounter {
    fn mounts(&self) -> Vec<Mounted> {
        self.mounts.lock().unwrap().clone()
    }
}

impl ImageMounter for RecordingMounter {
    fn preallocate(&self, _count: u32) -> Result<()> {
        Ok(())
    }

    fn mount_image(&self, file: &ModuleFile, mount_point: &Path, verity: bool) -> Result<()> {
        self.mounts.lock().unwrap().push(Mounted {
            source: file.path().to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            verity,
        });
        Ok(())
    }

    fn unmount(&self, _mount_point: &Path) -> Result<()> {
        Ok(())
    }
}

struct NeverRunning;

impl ProcessProbe for NeverRunning {
    fn is_running(&self, _: &str) -> bool {
        false
    }
}

struct Device {
    _dir: tempfile::TempDir,
    config: UpdateConfig,
    key: SigningKey,
    mounter: Arc<RecordingMounter>,
    params: Arc<MemoryParamStore>,
}

impl Device {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UpdateConfig::rooted_at(dir.path());
        config.producer_poll_ms = 5;
        Self {
            _dir: dir,
            config,
            key: SigningKey::generate().unwrap(),
            mounter: Arc::new(RecordingMounter::default()),
            params: Arc::new(MemoryParamStore::new()),
        }
    }

    /// Filesystem data carrying the ext4 superblock magic.
    fn ext4_data() -> Vec<u8> {
        let mut data = vec![0u8; 2 * BLOCK];
        data[1080] = 0x53;
        data[1081] = 0xEF;
        data
    }

    fn image(&self) -> Vec<u8> {
        ImageBuilder::new("demo_sa")
            .build(&Self::ext4_data(), &self.key)
            .unwrap()
    }

    /// Write hmp `demo` with module `demo_sa` (id 42) under `root`.
    fn write_hmp(&self, root: &Path, version: &str, image: &[u8]) -> PathBuf {
        let dir = root.join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        let info = serde_json::json!({
            "name": "demo",
            "version": version,
            "type": "sa",
            "hotInstall": false,
            "bundles": ["com.demo.app"],
        });
        std::fs::write(dir.join("pack.info"), info.to_string()).unwrap();

        let path = dir.join("demo_sa.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer
            .start_file("config.json", SimpleFileOptions::default())
            .unwrap();
        let config = serde_json::json!({ "name": "demo_sa", "id": 42, "version": version });
        writer.write_all(config.to_string().as_bytes()).unwrap();
        writer.start_file("module.img", stored).unwrap();
        writer.write_all(image).unwrap();
        writer.start_file("pub_key", stored).unwrap();
        writer.write_all(&self.key.public_key()).unwrap();
        writer.finish().unwrap();

        if !root.starts_with(&self.config.preinstalled_dir) {
            sign_package(&path, &self.key).unwrap();
        }
        dir
    }

    fn service(&self) -> ModuleUpdateService {
        ModuleUpdateService::new(
            self.config.clone(),
            self.mounter.clone(),
            self.params.clone(),
            Arc::new(NeverRunning),
        )
        .unwrap()
    }
}

#[test]
fn test_factory_module_mounted_at_boot() {
    let device = Device::new();
    device.write_hmp(&device.config.preinstalled_dir, "1.2.0", &device.image());
    let service = device.service();

    assert!(service.check_all_modules());

    let mounts = device.mounter.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].mount_point, device.config.mount_root.join("demo_sa"));
    assert!(mounts[0].source.starts_with(&device.config.preinstalled_dir));
    assert!(!mounts[0].verity);
    assert_eq!(service.effective_version("demo_sa").unwrap().to_string(), "1.2.0");
    assert!(device.params.get(POWER_CTRL).is_none());
    assert!(service.take_results().unwrap().is_empty());
}

#[test]
fn test_newer_active_mounted_on_verity() {
    let device = Device::new();
    device.write_hmp(&device.config.preinstalled_dir, "1.2.0", &device.image());
    let active = device.write_hmp(&device.config.active_dir, "1.3.0", &device.image());
    let before = std::fs::read(active.join("demo_sa.zip")).unwrap();
    let service = device.service();

    assert!(service.check_all_modules());

    let mounts = device.mounter.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(
        mounts[0].source,
        device.config.mount_ready_dir.join("demo/demo_sa.zip")
    );
    assert_eq!(mounts[0].verity, cfg!(feature = "hvb"));
    assert_eq!(service.effective_version("demo_sa").unwrap().to_string(), "1.3.0");
    assert_eq!(std::fs::read(active.join("demo_sa.zip")).unwrap(), before);
    assert!(!device.config.backup_dir.join("demo").exists());
}

#[cfg(feature = "hvb")]
#[test]
fn test_corrupted_active_falls_back_without_reboot() {
    let device = Device::new();
    device.write_hmp(&device.config.preinstalled_dir, "1.2.0", &device.image());
    let mut corrupted = device.image();
    // First byte of the hash tree, right after the two data blocks.
    corrupted[2 * BLOCK] ^= 0xFF;
    let active = device.write_hmp(&device.config.active_dir, "1.3.0", &corrupted);
    let service = device.service();

    service.check_all_modules();

    let mounts = device.mounter.mounts();
    assert_eq!(mounts.len(), 1);
    assert!(mounts[0].source.starts_with(&device.config.preinstalled_dir));
    assert_eq!(service.effective_version("demo_sa").unwrap().to_string(), "1.2.0");
    assert!(!device.config.mount_ready_dir.join("demo").exists());
    assert!(device.params.get(POWER_CTRL).is_none());

    let records = service.take_results().unwrap();
    let active_path = active.join("demo_sa.zip").display().to_string();
    assert!(records
        .iter()
        .any(|r| r.name == active_path && r.error_code() == ErrorCode::VerifySignFail));
}

#[test]
fn test_sa_crash_reverts_to_backup_and_reboots() {
    let device = Device::new();
    device.write_hmp(&device.config.preinstalled_dir, "1.2.0", &device.image());
    device.write_hmp(&device.config.active_dir, "1.4.0", &device.image());
    let backup = device.write_hmp(&device.config.backup_dir, "1.3.0", &device.image());
    let backup_bytes = std::fs::read(backup.join("demo_sa.zip")).unwrap();
    let service = device.service();

    assert!(service.check_all_modules());
    service.start_runtime().unwrap();

    device.params.set(&sa_status_key(42), "crash").unwrap();
    device.params.set(SA_ABNORMAL_FLAG, "1").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while device.params.get(POWER_CTRL).is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    service.shutdown();

    assert_eq!(
        device.params.get(POWER_CTRL).as_deref(),
        Some(REBOOT_FOR_REVERT)
    );
    let active = device.config.active_dir.join("demo/demo_sa.zip");
    assert_eq!(std::fs::read(active).unwrap(), backup_bytes);
    assert!(!backup.exists());
    assert_eq!(
        device.params.get(&bundle_install_result_key("com.demo.app")).as_deref(),
        Some("revert")
    );
}
