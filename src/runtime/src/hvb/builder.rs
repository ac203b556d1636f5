//! Signing side of the verified-boot format.
//!
//! Produces signed module images and signs package archives. This is the
//! packaging-tool counterpart of [`super::verify_image`] and
//! [`super::verify_package_signature`].

use super::{
    hash_tree_size, salted_digest, HashTreeCert, HvbError, DESCRIPTOR_MAGIC, FOOTER_MAGIC,
    FOOTER_SIZE, FOOTER_VERSION, HASH_ALGORITHM, PACKAGE_SIG_LEN, PACKAGE_SIG_MAGIC,
};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::path::Path;

const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_SALT_LEN: usize = 32;
const EOCD_SIZE: usize = 22;
const EOCD_SIGNATURE: u32 = 0x0605_4b50;

/// Ed25519 signing key.
pub struct SigningKey {
    pair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

impl SigningKey {
    /// Generate a fresh key.
    pub fn generate() -> Result<Self, HvbError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| HvbError::Key("key generation failed".to_string()))?;
        Self::from_pkcs8(doc.as_ref())
    }

    /// Load a PKCS#8 encoded key.
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, HvbError> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| HvbError::Key(format!("invalid PKCS#8 key: {}", e)))?;
        Ok(Self {
            pair,
            pkcs8: pkcs8.to_vec(),
        })
    }

    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Raw 32-byte public key, the format stored in packages as `pub_key`.
    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.pair.sign(message).as_ref().to_vec()
    }
}

/// Build a dm-verity hash tree over `data` (a whole number of blocks).
///
/// Returns the tree in on-disk order (top level first) and the root digest.
pub fn build_hash_tree(data: &[u8], block_size: usize, salt: &[u8]) -> (Vec<u8>, [u8; 32]) {
    let mut levels: Vec<Vec<u8>> = Vec::new();
    loop {
        let input: &[u8] = levels.last().map(Vec::as_slice).unwrap_or(data);
        let mut level = Vec::new();
        for block in input.chunks(block_size) {
            level.extend_from_slice(&salted_digest(salt, block));
        }
        let padded = level.len().div_ceil(block_size).max(1) * block_size;
        level.resize(padded, 0);

        let done = level.len() == block_size;
        levels.push(level);
        if done {
            break;
        }
    }

    let root = levels
        .last()
        .map(|top| salted_digest(salt, top))
        .unwrap_or_default();
    let tree = levels.into_iter().rev().flatten().collect();
    (tree, root)
}

/// Builder for signed module images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    partition: String,
    block_size: u32,
    salt: Option<Vec<u8>>,
}

impl ImageBuilder {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            salt: None,
        }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn salt(mut self, salt: Vec<u8>) -> Self {
        self.salt = Some(salt);
        self
    }

    /// Pad `data` to the block size, append its hash tree, the signed
    /// descriptor and the footer.
    pub fn build(&self, data: &[u8], key: &SigningKey) -> Result<Vec<u8>, HvbError> {
        if data.is_empty() {
            return Err(HvbError::OutOfBounds("empty image data".to_string()));
        }
        let block_size = self.block_size as usize;
        if !self.block_size.is_power_of_two() || block_size < 512 {
            return Err(HvbError::OutOfBounds(format!("block size {}", block_size)));
        }

        let salt = match &self.salt {
            Some(salt) => salt.clone(),
            None => {
                let mut salt = vec![0u8; DEFAULT_SALT_LEN];
                SystemRandom::new()
                    .fill(&mut salt)
                    .map_err(|_| HvbError::Key("salt generation failed".to_string()))?;
                salt
            }
        };

        let mut image = data.to_vec();
        image.resize(data.len().div_ceil(block_size) * block_size, 0);
        let data_size = image.len() as u64;

        let (tree, root) = build_hash_tree(&image, block_size, &salt);
        let cert = HashTreeCert {
            partition: self.partition.clone(),
            data_size,
            hash_tree_offset: data_size,
            hash_tree_size: hash_tree_size(data_size / self.block_size as u64, self.block_size),
            data_block_size: self.block_size,
            hash_block_size: self.block_size,
            algorithm: HASH_ALGORITHM.to_string(),
            salt,
            root_digest: root.to_vec(),
        };
        image.extend_from_slice(&tree);

        let desc_offset = image.len() as u64;
        let descriptor = encode_descriptor(&cert, key);
        image.extend_from_slice(&descriptor);
        image.extend_from_slice(&encode_footer(desc_offset, descriptor.len() as u64));
        Ok(image)
    }
}

fn put_blob(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Serialize one certificate into a signed descriptor.
pub fn encode_descriptor(cert: &HashTreeCert, key: &SigningKey) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(DESCRIPTOR_MAGIC);
    buf.extend_from_slice(&1u32.to_le_bytes());
    put_blob(&mut buf, cert.partition.as_bytes());
    buf.extend_from_slice(&cert.data_size.to_le_bytes());
    buf.extend_from_slice(&cert.hash_tree_offset.to_le_bytes());
    buf.extend_from_slice(&cert.hash_tree_size.to_le_bytes());
    buf.extend_from_slice(&cert.data_block_size.to_le_bytes());
    buf.extend_from_slice(&cert.hash_block_size.to_le_bytes());
    put_blob(&mut buf, cert.algorithm.as_bytes());
    put_blob(&mut buf, &cert.salt);
    put_blob(&mut buf, &cert.root_digest);

    let signature = key.sign(&buf);
    buf.extend_from_slice(&signature);
    buf
}

fn encode_footer(desc_offset: u64, desc_size: u64) -> [u8; FOOTER_SIZE as usize] {
    let mut footer = [0u8; FOOTER_SIZE as usize];
    footer[0..4].copy_from_slice(FOOTER_MAGIC);
    footer[4..8].copy_from_slice(&FOOTER_VERSION.to_le_bytes());
    footer[8..16].copy_from_slice(&desc_offset.to_le_bytes());
    footer[16..24].copy_from_slice(&desc_size.to_le_bytes());
    footer
}

/// Append a package signature to an unsigned zip archive in memory.
///
/// The archive must end with an end-of-central-directory record carrying
/// an empty comment.
pub fn sign_package_bytes(mut data: Vec<u8>, key: &SigningKey) -> Result<Vec<u8>, HvbError> {
    if data.len() < EOCD_SIZE {
        return Err(HvbError::Truncated("archive"));
    }
    let eocd = data.len() - EOCD_SIZE;
    let signature = u32::from_le_bytes([
        data[eocd],
        data[eocd + 1],
        data[eocd + 2],
        data[eocd + 3],
    ]);
    let comment_len = u16::from_le_bytes([data[eocd + 20], data[eocd + 21]]);
    if signature != EOCD_SIGNATURE || comment_len != 0 {
        return Err(HvbError::BadMagic("end of central directory"));
    }

    data[eocd + 20..eocd + 22].copy_from_slice(&(PACKAGE_SIG_LEN as u16).to_le_bytes());
    let signature = key.sign(&data);
    data.extend_from_slice(PACKAGE_SIG_MAGIC);
    data.extend_from_slice(&signature);
    Ok(data)
}

/// Sign a package file in place.
pub fn sign_package(path: &Path, key: &SigningKey) -> Result<(), HvbError> {
    let data = std::fs::read(path)?;
    let signed = sign_package_bytes(data, key)?;
    std::fs::write(path, signed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{split_package_signature, verify_package_signature};
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_tree_single_block() {
        let data = vec![7u8; 4096];
        let (tree, root) = build_hash_tree(&data, 4096, b"salt");
        assert_eq!(tree.len(), 4096);
        assert_eq!(&tree[..32], &salted_digest(b"salt", &data));
        assert_eq!(root, salted_digest(b"salt", &tree));
    }

    #[test]
    fn test_hash_tree_two_levels_top_first() {
        let data = vec![1u8; 129 * 512];
        let (tree, root) = build_hash_tree(&data, 512, &[]);
        // 16 digests per 512-byte block: 129 -> 9 -> 1
        assert_eq!(tree.len(), 10 * 512);
        assert_eq!(tree.len() as u64, hash_tree_size(129, 512));
        assert_eq!(root, salted_digest(&[], &tree[..512]));
    }

    #[test]
    fn test_sign_package_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("config.json", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"{}").unwrap();
        writer.finish().unwrap();

        let key = SigningKey::generate().unwrap();
        sign_package(&path, &key).unwrap();
        verify_package_signature(&path, &key.public_key()).unwrap();

        // Signed archives still open as regular zips.
        let archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);

        // Signing twice is rejected: the comment is no longer empty.
        assert!(sign_package(&path, &key).is_err());
    }

    #[test]
    fn test_tampered_package_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        writer
            .start_file("a.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let key = SigningKey::generate().unwrap();
        sign_package(&path, &key).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[40] ^= 0x01;
        assert!(split_package_signature(&data).is_ok());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            verify_package_signature(&path, &key.public_key()).unwrap_err(),
            HvbError::BadSignature
        ));
    }

    #[test]
    fn test_key_pkcs8_reload() {
        let key = SigningKey::generate().unwrap();
        let reloaded = SigningKey::from_pkcs8(key.pkcs8()).unwrap();
        assert_eq!(key.public_key(), reloaded.public_key());
        assert!(SigningKey::from_pkcs8(b"garbage").is_err());
    }
}
