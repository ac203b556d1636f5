//! Verified-boot (HVB) metadata for module images and packages.
//!
//! A module image ends with a fixed 64-byte footer pointing at a signed
//! descriptor. The descriptor carries exactly one hash-tree certificate
//! describing a dm-verity style tree stored inside the image:
//!
//! ```text
//! +-----------+-------------------------+------------+--------+
//! | data      | hash tree (top level 1st)| descriptor | footer |
//! +-----------+-------------------------+------------+--------+
//! ```
//!
//! Packages (the zip files carrying the images) are signed separately: the
//! zip archive comment holds a magic tag and an Ed25519 signature over every
//! byte preceding the comment.

pub mod builder;

use hmp_update_core::error::UpdateError;
use ring::signature::{UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// Image footer magic.
pub const FOOTER_MAGIC: &[u8; 4] = b"HVBF";
/// Descriptor magic.
pub const DESCRIPTOR_MAGIC: &[u8; 4] = b"HVBD";
/// Size of the image footer.
pub const FOOTER_SIZE: u64 = 64;
/// Only supported footer version.
pub const FOOTER_VERSION: u32 = 1;
/// Package signature tag at the start of the zip comment.
pub const PACKAGE_SIG_MAGIC: &[u8; 8] = b"HMPSIGv1";
/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;
/// Length of the zip comment carrying the package signature.
pub const PACKAGE_SIG_LEN: usize = PACKAGE_SIG_MAGIC.len() + SIGNATURE_LEN;
/// The only hash algorithm accepted in certificates.
pub const HASH_ALGORITHM: &str = "sha256";

const DIGEST_LEN: usize = 32;
const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const EOCD_SIZE: usize = 22;

/// Verified-boot errors.
#[derive(Error, Debug)]
pub enum HvbError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("bad {0} magic")]
    BadMagic(&'static str),

    #[error("unsupported footer version {0}")]
    UnsupportedVersion(u32),

    #[error("expected exactly one certificate, found {0}")]
    CertificateCount(u32),

    #[error("signature mismatch")]
    BadSignature,

    #[error("package is not signed")]
    MissingSignature,

    #[error("unsupported hash algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("layout out of bounds: {0}")]
    OutOfBounds(String),

    #[error("root digest mismatch for partition '{0}'")]
    DigestMismatch(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HvbError> for UpdateError {
    fn from(err: HvbError) -> Self {
        match err {
            HvbError::Io(e) => UpdateError::Io(e),
            other => UpdateError::VerifyFailed(other.to_string()),
        }
    }
}

/// One hash-tree certificate from a verified descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTreeCert {
    pub partition: String,
    /// Size of the protected data region in bytes.
    pub data_size: u64,
    /// Offset of the hash tree from the start of the image.
    pub hash_tree_offset: u64,
    pub hash_tree_size: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub algorithm: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
}

impl HashTreeCert {
    pub fn num_data_blocks(&self) -> u64 {
        self.data_size / self.data_block_size as u64
    }

    /// First hash block, in units of `hash_block_size`.
    pub fn hash_start_block(&self) -> u64 {
        self.hash_tree_offset / self.hash_block_size as u64
    }

    fn check_layout(&self, desc_offset: u64) -> Result<(), HvbError> {
        if self.algorithm != HASH_ALGORITHM {
            return Err(HvbError::UnsupportedAlgorithm(self.algorithm.clone()));
        }
        for size in [self.data_block_size, self.hash_block_size] {
            if !size.is_power_of_two() || !(512..=65536).contains(&size) {
                return Err(HvbError::OutOfBounds(format!("block size {}", size)));
            }
        }
        if self.data_size == 0 || self.data_size % self.data_block_size as u64 != 0 {
            return Err(HvbError::OutOfBounds(format!(
                "data size {} is not a multiple of {}",
                self.data_size, self.data_block_size
            )));
        }
        if self.hash_tree_offset < self.data_size
            || self.hash_tree_offset % self.hash_block_size as u64 != 0
        {
            return Err(HvbError::OutOfBounds(format!(
                "hash tree offset {}",
                self.hash_tree_offset
            )));
        }
        let expected = hash_tree_size(self.num_data_blocks(), self.hash_block_size);
        if self.hash_tree_size != expected {
            return Err(HvbError::OutOfBounds(format!(
                "hash tree size {} (expected {})",
                self.hash_tree_size, expected
            )));
        }
        match self.hash_tree_offset.checked_add(self.hash_tree_size) {
            Some(end) if end <= desc_offset => {}
            _ => {
                return Err(HvbError::OutOfBounds(
                    "hash tree overlaps descriptor".to_string(),
                ))
            }
        }
        if self.root_digest.len() != DIGEST_LEN {
            return Err(HvbError::OutOfBounds(format!(
                "root digest length {}",
                self.root_digest.len()
            )));
        }
        Ok(())
    }
}

/// Verified-boot metadata produced by a successful image verification.
///
/// Not `Clone`: holders share it through `Arc`, and it is released exactly
/// once when the last holder drops it.
#[derive(Debug)]
pub struct VerifiedBootData {
    cert: HashTreeCert,
}

impl VerifiedBootData {
    pub fn cert(&self) -> &HashTreeCert {
        &self.cert
    }
}

impl Drop for VerifiedBootData {
    fn drop(&mut self) {
        tracing::trace!(partition = %self.cert.partition, "Released verified boot data");
    }
}

/// Number of hash blocks per tree level, bottom level first.
pub fn hash_tree_levels(data_blocks: u64, hash_block_size: u32) -> Vec<u64> {
    let per_block = (hash_block_size as u64 / DIGEST_LEN as u64).max(1);
    let mut levels = Vec::new();
    let mut count = data_blocks;
    loop {
        count = count.div_ceil(per_block);
        levels.push(count);
        if count <= 1 {
            break;
        }
    }
    levels
}

/// Total hash tree size in bytes.
pub fn hash_tree_size(data_blocks: u64, hash_block_size: u32) -> u64 {
    hash_tree_levels(data_blocks, hash_block_size).iter().sum::<u64>() * hash_block_size as u64
}

/// `sha256(salt || block)`, the dm-verity version 1 block digest.
pub(crate) fn salted_digest(salt: &[u8], block: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(block);
    hasher.finalize().into()
}

fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), HvbError> {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .map_err(|_| HvbError::BadSignature)
}

/// Little-endian cursor over descriptor bytes.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HvbError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(HvbError::Truncated("descriptor"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, HvbError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, HvbError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, HvbError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn blob(&mut self) -> Result<&'a [u8], HvbError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// Parse the certificates of a descriptor body (signature already stripped).
pub fn parse_certificates(body: &[u8]) -> Result<Vec<HashTreeCert>, HvbError> {
    let mut cur = Cursor::new(body);
    if cur.take(4)? != DESCRIPTOR_MAGIC {
        return Err(HvbError::BadMagic("descriptor"));
    }
    let count = cur.u32()?;
    let mut certs = Vec::new();
    for _ in 0..count {
        let partition = String::from_utf8_lossy(cur.blob()?).into_owned();
        let data_size = cur.u64()?;
        let hash_tree_offset = cur.u64()?;
        let hash_tree_size = cur.u64()?;
        let data_block_size = cur.u32()?;
        let hash_block_size = cur.u32()?;
        let algorithm = String::from_utf8_lossy(cur.blob()?).into_owned();
        let salt = cur.blob()?.to_vec();
        let root_digest = cur.blob()?.to_vec();
        certs.push(HashTreeCert {
            partition,
            data_size,
            hash_tree_offset,
            hash_tree_size,
            data_block_size,
            hash_block_size,
            algorithm,
            salt,
            root_digest,
        });
    }
    Ok(certs)
}

/// Parse exactly one certificate out of a descriptor body.
pub fn parse_certificate(body: &[u8]) -> Result<HashTreeCert, HvbError> {
    let mut certs = parse_certificates(body)?;
    if certs.len() != 1 {
        return Err(HvbError::CertificateCount(certs.len() as u32));
    }
    Ok(certs.remove(0))
}

/// Footer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Footer {
    desc_offset: u64,
    desc_size: u64,
}

fn parse_footer(raw: &[u8; FOOTER_SIZE as usize]) -> Result<Footer, HvbError> {
    if &raw[0..4] != FOOTER_MAGIC {
        return Err(HvbError::BadMagic("footer"));
    }
    let version = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if version != FOOTER_VERSION {
        return Err(HvbError::UnsupportedVersion(version));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[8..16]);
    let desc_offset = u64::from_le_bytes(word);
    word.copy_from_slice(&raw[16..24]);
    let desc_size = u64::from_le_bytes(word);
    Ok(Footer {
        desc_offset,
        desc_size,
    })
}

/// Verify an image region `[offset, offset + length)` of `reader`.
///
/// Checks the descriptor signature against `public_key`, requires exactly
/// one certificate, validates the tree layout and recomputes the root digest
/// from the top-level hash block.
pub fn verify_image<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    length: u64,
    public_key: &[u8],
) -> Result<VerifiedBootData, HvbError> {
    if length < FOOTER_SIZE {
        return Err(HvbError::Truncated("image"));
    }

    reader.seek(SeekFrom::Start(offset + length - FOOTER_SIZE))?;
    let mut raw = [0u8; FOOTER_SIZE as usize];
    reader.read_exact(&mut raw)?;
    let footer = parse_footer(&raw)?;

    let limit = length - FOOTER_SIZE;
    let desc_end = footer
        .desc_offset
        .checked_add(footer.desc_size)
        .filter(|end| *end <= limit)
        .ok_or_else(|| HvbError::OutOfBounds("descriptor beyond footer".to_string()))?;
    if footer.desc_size < (DESCRIPTOR_MAGIC.len() + 4 + SIGNATURE_LEN) as u64 {
        return Err(HvbError::Truncated("descriptor"));
    }
    tracing::trace!(desc_offset = footer.desc_offset, desc_end, "Read HVB footer");

    reader.seek(SeekFrom::Start(offset + footer.desc_offset))?;
    let mut descriptor = vec![0u8; footer.desc_size as usize];
    reader.read_exact(&mut descriptor)?;

    let (body, signature) = descriptor.split_at(descriptor.len() - SIGNATURE_LEN);
    verify_signature(public_key, body, signature)?;

    let cert = parse_certificate(body)?;
    cert.check_layout(footer.desc_offset)?;

    reader.seek(SeekFrom::Start(offset + cert.hash_tree_offset))?;
    let mut top = vec![0u8; cert.hash_block_size as usize];
    reader.read_exact(&mut top)?;
    if salted_digest(&cert.salt, &top)[..] != cert.root_digest[..] {
        return Err(HvbError::DigestMismatch(cert.partition.clone()));
    }

    tracing::debug!(
        partition = %cert.partition,
        data_blocks = cert.num_data_blocks(),
        "Image hash tree verified"
    );
    Ok(VerifiedBootData { cert })
}

/// Split a signed package into (signed region, signature).
pub fn split_package_signature(data: &[u8]) -> Result<(&[u8], &[u8]), HvbError> {
    if data.len() < EOCD_SIZE + PACKAGE_SIG_LEN {
        return Err(HvbError::MissingSignature);
    }
    let comment_start = data.len() - PACKAGE_SIG_LEN;
    let eocd = &data[comment_start - EOCD_SIZE..comment_start];
    let signature = u32::from_le_bytes([eocd[0], eocd[1], eocd[2], eocd[3]]);
    let comment_len = u16::from_le_bytes([eocd[20], eocd[21]]) as usize;
    if signature != EOCD_SIGNATURE || comment_len != PACKAGE_SIG_LEN {
        return Err(HvbError::MissingSignature);
    }

    let comment = &data[comment_start..];
    if &comment[..PACKAGE_SIG_MAGIC.len()] != PACKAGE_SIG_MAGIC {
        return Err(HvbError::BadMagic("package signature"));
    }
    Ok((&data[..comment_start], &comment[PACKAGE_SIG_MAGIC.len()..]))
}

/// Verify the signature carried in a package's zip comment.
pub fn verify_package_signature(path: &Path, public_key: &[u8]) -> Result<(), HvbError> {
    let data = std::fs::read(path)?;
    let (signed, signature) = split_package_signature(&data)?;
    verify_signature(public_key, signed, signature)?;
    tracing::trace!(path = %path.display(), "Package signature verified");
    Ok(())
}
