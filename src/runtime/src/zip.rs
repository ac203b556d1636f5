//! Random-access reader over a module package archive.
//!
//! Besides entry lookup and extraction, the reader reports the raw byte
//! offset of an entry's data inside the archive file. Module images are
//! stored uncompressed and mapped through a loop device at that offset
//! instead of being extracted.

use hmp_update_core::error::{Result, UpdateError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use zip::{CompressionMethod, ZipArchive};

/// Local file header signature.
const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
/// Fixed part of the local file header.
const LOCAL_HEADER_SIZE: u64 = 30;

/// Metadata of the most recently located entry.
#[derive(Debug, Clone)]
struct LocatedEntry {
    name: String,
    size: u64,
    header_start: u64,
    data_start: u64,
    stored: bool,
}

/// Reader over one package archive.
pub struct ZipReader {
    path: PathBuf,
    archive: ZipArchive<File>,
    located: Option<LocatedEntry>,
}

impl std::fmt::Debug for ZipReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipReader")
            .field("path", &self.path)
            .field("located", &self.located)
            .finish()
    }
}

impl ZipReader {
    /// Open an archive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            UpdateError::Format(format!("failed to open archive {}: {}", path.display(), e))
        })?;
        let archive = ZipArchive::new(file).map_err(|e| {
            UpdateError::Format(format!("failed to read archive {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            archive,
            located: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locate an entry by name, making it the subject of the other queries.
    pub fn locate(&mut self, name: &str) -> bool {
        self.located = match self.archive.by_name(name) {
            Ok(entry) => Some(LocatedEntry {
                name: name.to_string(),
                size: entry.size(),
                header_start: entry.header_start(),
                data_start: entry.data_start(),
                stored: entry.compression() == CompressionMethod::Stored,
            }),
            Err(_) => None,
        };
        self.located.is_some()
    }

    fn current(&self) -> Result<&LocatedEntry> {
        self.located.as_ref().ok_or_else(|| {
            UpdateError::Format(format!(
                "no entry located in archive {}",
                self.path.display()
            ))
        })
    }

    /// Uncompressed content of the located entry.
    pub fn content(&mut self) -> Result<Vec<u8>> {
        let name = self.current()?.name.clone();
        let mut entry = self.archive.by_name(&name).map_err(|e| {
            UpdateError::Format(format!("failed to open entry {}: {}", name, e))
        })?;

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).map_err(|e| {
            UpdateError::Format(format!("failed to read entry {}: {}", name, e))
        })?;
        Ok(buf)
    }

    /// Uncompressed size of the located entry.
    pub fn size(&self) -> Result<u64> {
        Ok(self.current()?.size)
    }

    /// Whether the located entry is stored without compression.
    pub fn is_stored(&self) -> Result<bool> {
        Ok(self.current()?.stored)
    }

    /// Byte offset of the located entry's raw data within the archive file.
    ///
    /// The central directory's view of the entry is cross-checked against
    /// the local file header: signature, file name, and the resulting data
    /// offset must all agree.
    pub fn byte_offset(&self) -> Result<u64> {
        let entry = self.current()?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.header_start))?;
        let mut header = [0u8; LOCAL_HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|e| {
            UpdateError::Format(format!(
                "truncated local header for {} in {}: {}",
                entry.name,
                self.path.display(),
                e
            ))
        })?;

        let signature = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if signature != LOCAL_HEADER_SIGNATURE {
            return Err(UpdateError::Format(format!(
                "bad local header signature {:#010x} for {}",
                signature, entry.name
            )));
        }

        let name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
        let extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;

        let mut name = vec![0u8; name_len as usize];
        file.read_exact(&mut name)?;
        if name != entry.name.as_bytes() {
            return Err(UpdateError::Format(format!(
                "local header name mismatch for {}",
                entry.name
            )));
        }

        let offset = entry.header_start + LOCAL_HEADER_SIZE + name_len + extra_len;
        if offset != entry.data_start {
            return Err(UpdateError::Format(format!(
                "data offset mismatch for {}: local header says {}, central directory says {}",
                entry.name, offset, entry.data_start
            )));
        }

        tracing::trace!(entry = %entry.name, offset, "Located raw entry data");
        Ok(offset)
    }
}
