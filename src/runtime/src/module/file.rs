//! One parsed module package.

use crate::hvb::{self, VerifiedBootData};
use crate::zip::ZipReader;
use crate::{CONFIG_ENTRY, IMAGE_ENTRY, PUBLIC_KEY_ENTRY};
use hmp_update_core::error::{Result, UpdateError};
use hmp_update_core::version::ModuleVersion;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// f2fs superblock magic, little-endian at byte 1024.
const F2FS_MAGIC: u32 = 0xF2F5_2010;
const F2FS_MAGIC_OFFSET: u64 = 1024;
/// ext2/3/4 superblock magic, little-endian at byte 1080.
const EXT4_MAGIC: u16 = 0xEF53;
const EXT4_MAGIC_OFFSET: u64 = 1080;

/// Filesystem of an embedded module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    F2fs,
    Ext4,
}

impl FsType {
    /// Name passed to mount(2).
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::F2fs => "f2fs",
            FsType::Ext4 => "ext4",
        }
    }

    /// Detect the filesystem from superblock magic inside `[offset, offset + length)`.
    pub fn detect(file: &File, offset: u64, length: u64) -> Option<Self> {
        if length >= F2FS_MAGIC_OFFSET + 4 {
            let mut buf = [0u8; 4];
            if file.read_exact_at(&mut buf, offset + F2FS_MAGIC_OFFSET).is_ok()
                && u32::from_le_bytes(buf) == F2FS_MAGIC
            {
                return Some(FsType::F2fs);
            }
        }
        if length >= EXT4_MAGIC_OFFSET + 2 {
            let mut buf = [0u8; 2];
            if file.read_exact_at(&mut buf, offset + EXT4_MAGIC_OFFSET).is_ok()
                && u16::from_le_bytes(buf) == EXT4_MAGIC
            {
                return Some(FsType::Ext4);
            }
        }
        None
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a mountable image inside its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStat {
    /// Byte offset of the raw image data within the package file.
    pub offset: u64,
    pub length: u64,
    pub fs_type: FsType,
}

/// `config.json` inside a module package.
#[derive(Debug, Deserialize)]
struct ModuleConfig {
    name: String,
    id: i32,
    version: String,
}

/// A parsed module package.
///
/// Clones share the verified-boot data, which is released once the last
/// clone lets go of it.
#[derive(Debug, Clone)]
pub struct ModuleFile {
    path: PathBuf,
    name: String,
    id: i32,
    version: ModuleVersion,
    public_key: Vec<u8>,
    image: Option<ImageStat>,
    verified: Option<Arc<VerifiedBootData>>,
}

impl ModuleFile {
    /// Open and parse a package.
    ///
    /// Packages outside `factory_root` must carry an image.
    pub fn open(path: impl AsRef<Path>, factory_root: &Path) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(UpdateError::PathInvalid(format!(
                "{} is not a package file",
                path.display()
            )));
        }

        let mut reader = ZipReader::open(path)?;
        if !reader.locate(CONFIG_ENTRY) {
            return Err(UpdateError::Format(format!(
                "{} has no {}",
                path.display(),
                CONFIG_ENTRY
            )));
        }
        let config: ModuleConfig = serde_json::from_slice(&reader.content()?).map_err(|e| {
            UpdateError::Format(format!("invalid {} in {}: {}", CONFIG_ENTRY, path.display(), e))
        })?;
        let version: ModuleVersion = config.version.parse()?;

        let image = if reader.locate(IMAGE_ENTRY) {
            Some(Self::stat_image(&reader, path)?)
        } else if path.starts_with(factory_root) {
            None
        } else {
            return Err(UpdateError::Format(format!(
                "update package {} carries no {}",
                path.display(),
                IMAGE_ENTRY
            )));
        };

        let public_key = Self::read_public_key(&mut reader, path)?;

        tracing::debug!(
            path = %path.display(),
            module = %config.name,
            id = config.id,
            version = %version,
            has_image = image.is_some(),
            "Opened module file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            name: config.name,
            id: config.id,
            version,
            public_key,
            image,
            verified: None,
        })
    }

    fn stat_image(reader: &ZipReader, path: &Path) -> Result<ImageStat> {
        if !reader.is_stored()? {
            return Err(UpdateError::Format(format!(
                "{} in {} must be stored uncompressed",
                IMAGE_ENTRY,
                path.display()
            )));
        }
        let offset = reader.byte_offset()?;
        let length = reader.size()?;

        let file = File::open(path)?;
        let fs_type = FsType::detect(&file, offset, length).ok_or_else(|| {
            UpdateError::Format(format!(
                "{} in {} has no known filesystem magic",
                IMAGE_ENTRY,
                path.display()
            ))
        })?;

        Ok(ImageStat {
            offset,
            length,
            fs_type,
        })
    }

    #[cfg(feature = "hvb")]
    fn read_public_key(reader: &mut ZipReader, path: &Path) -> Result<Vec<u8>> {
        if !reader.locate(PUBLIC_KEY_ENTRY) {
            return Err(UpdateError::Format(format!(
                "{} has no {}",
                path.display(),
                PUBLIC_KEY_ENTRY
            )));
        }
        let key = reader.content()?;
        if key.is_empty() {
            return Err(UpdateError::Format(format!(
                "{} has an empty {}",
                path.display(),
                PUBLIC_KEY_ENTRY
            )));
        }
        Ok(key)
    }

    #[cfg(not(feature = "hvb"))]
    fn read_public_key(_reader: &mut ZipReader, _path: &Path) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Relocate the logical identity, e.g. after the package moved to the
    /// active generation.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn version(&self) -> ModuleVersion {
        self.version
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn image(&self) -> Option<&ImageStat> {
        self.image.as_ref()
    }

    /// Name of the hmp directory holding this package.
    pub fn hmp_name(&self) -> Option<&str> {
        self.path.parent()?.file_name()?.to_str()
    }

    /// Verify the embedded image against `public_key`.
    ///
    /// Idempotent: once verified data is present the call succeeds without
    /// re-reading the image.
    pub fn verify_integrity(&mut self, public_key: &[u8]) -> Result<()> {
        if self.verified.is_some() {
            return Ok(());
        }
        let image = self.image.ok_or_else(|| {
            UpdateError::Format(format!("{} has no image to verify", self.path.display()))
        })?;

        let mut file = File::open(&self.path)?;
        let data = hvb::verify_image(&mut file, image.offset, image.length, public_key)?;
        if data.cert().data_size > image.length {
            return Err(UpdateError::VerifyFailed(format!(
                "certificate of {} covers more than the image",
                self.path.display()
            )));
        }

        tracing::debug!(path = %self.path.display(), id = self.id, "Module image verified");
        self.verified = Some(Arc::new(data));
        Ok(())
    }

    pub fn verified_data(&self) -> Option<&VerifiedBootData> {
        self.verified.as_deref()
    }

    /// Drop this handle's share of the verified-boot data.
    pub fn release_verified_data(&mut self) {
        self.verified = None;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::hvb::builder::{ImageBuilder, SigningKey};
    use std::io::Write;
    use std::path::Path;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    /// Raw ext4-looking filesystem data of `blocks` 4 KiB blocks.
    pub fn ext4_data(blocks: usize) -> Vec<u8> {
        let mut data = vec![0u8; blocks * 4096];
        data[1080] = 0x53;
        data[1081] = 0xEF;
        data
    }

    pub fn f2fs_data(blocks: usize) -> Vec<u8> {
        let mut data = vec![0u8; blocks * 4096];
        data[1024..1028].copy_from_slice(&0xF2F5_2010u32.to_le_bytes());
        data
    }

    /// Write a module package; `image` is embedded as a stored entry.
    pub fn write_package(
        path: &Path,
        name: &str,
        id: i32,
        version: &str,
        image: Option<&[u8]>,
        key: Option<&SigningKey>,
    ) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let deflated = SimpleFileOptions::default();
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        writer.start_file("config.json", deflated).unwrap();
        let config = serde_json::json!({ "name": name, "id": id, "version": version });
        writer.write_all(config.to_string().as_bytes()).unwrap();

        if let Some(image) = image {
            writer.start_file("module.img", stored).unwrap();
            writer.write_all(image).unwrap();
        }
        if let Some(key) = key {
            writer.start_file("pub_key", stored).unwrap();
            writer.write_all(&key.public_key()).unwrap();
        }
        writer.finish().unwrap();
    }

    /// Signed image wrapping ext4 data.
    pub fn signed_image(key: &SigningKey, partition: &str) -> Vec<u8> {
        ImageBuilder::new(partition)
            .build(&ext4_data(2), key)
            .unwrap()
    }

    pub fn write_pack_info(
        dir: &Path,
        name: &str,
        kind: &str,
        hot_install: bool,
        bundles: &[&str],
    ) {
        std::fs::create_dir_all(dir).unwrap();
        let info = serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "type": kind,
            "hotInstall": hot_install,
            "bundles": bundles,
        });
        std::fs::write(dir.join(crate::PACK_INFO), info.to_string()).unwrap();
    }
}
