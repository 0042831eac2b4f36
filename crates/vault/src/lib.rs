//! Encrypted chunked container engine.
//!
//! A container is a single file with three regions: a fixed 48-byte header,
//! an append-only region of encrypted compressed chunks, and an encrypted
//! manifest blob at the tail. The header pins the authoritative manifest
//! location; older manifest blobs and the chunks of deleted files become
//! unreferenced garbage (the file only grows, reclamation is a future
//! format revision).
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! offset  size  field
//!   0      4    magic = 0x4F435632
//!   4      4    format_version = 1
//!   8      8    manifest_offset
//!  16      8    manifest_length
//!  24      8    flags (reserved, 0)
//!  32     16    pwhash_salt
//! ```
//!
//! Every encrypted region (chunks and manifest alike) is a
//! `nonce || ciphertext || tag` blob produced by [`vault_crypto`]; the
//! plaintext inside is zstd-compressed. Writes append chunks, then commit
//! by appending a fresh manifest blob, fsyncing, and patching the two
//! header pointer fields with a single 16-byte write. A crash before the
//! patch leaves the previous manifest authoritative; chunk appends alone
//! are never observable.
//!
//! Concurrency: a [`Container`] owns its file handle and is single-threaded
//! by contract. Only one writer per on-disk container is supported.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;
use vault_crypto::{CryptoError, MasterKey, SALT_LEN};
use vault_manifest::{ChunkRef, CodecError, FileEntry, Manifest};

/// Container magic number ("OCV2").
pub const CONTAINER_MAGIC: u32 = 0x4F43_5632;
/// On-disk format version.
pub const CONTAINER_VERSION: u32 = 1;
/// Fixed header length in bytes.
pub const HEADER_LEN: u64 = 48;
/// Plaintext chunk size. Fixed for a given container session.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;
// The manifest pointer pair (offset, length) starts here; it is patched as
// one 16-byte write so a torn update cannot split the two fields.
const MANIFEST_PTR_OFFSET: u64 = 8;

/// Errors surfaced by container operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// `open` was called on a path that does not exist.
    #[error("container not found")]
    ContainerNotFound,
    /// `create` was called on a path that already exists.
    #[error("container already exists")]
    FileExists,
    /// Bad magic, truncated header, or malformed manifest.
    #[error("invalid container format: {0}")]
    InvalidContainerFormat(String),
    /// The manifest failed to authenticate: wrong password (or tampering,
    /// which is indistinguishable).
    #[error("wrong password")]
    InvalidPassword,
    /// The virtual path is not present in the manifest.
    #[error("file not found in container")]
    FileNotFound,
    /// Underlying file or compression error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Password hashing failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,
    /// A chunk failed to authenticate or decrypt. The key already
    /// authenticated the manifest, so this is data corruption rather than a
    /// wrong password.
    #[error("decryption failed: corrupted data")]
    DecryptionFailed,
    /// An allocation sized by container metadata could not be satisfied.
    #[error("out of memory: {0} bytes")]
    OutOfMemory(usize),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyDerivationFailed(m) => Self::KeyDerivationFailed(m),
            CryptoError::EncryptionFailed => Self::EncryptionFailed,
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            CryptoError::InvalidPassword => Self::InvalidPassword,
        }
    }
}

impl From<CodecError> for VaultError {
    fn from(e: CodecError) -> Self {
        Self::InvalidContainerFormat(e.to_string())
    }
}

// Write stamps are wall-clock milliseconds forced strictly monotonic across
// the process, so repeated writes within one tick still order correctly.
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

fn next_write_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut prev = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let stamp = now.max(prev + 1);
        match LAST_STAMP.compare_exchange(prev, stamp, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return stamp,
            Err(observed) => prev = observed,
        }
    }
}

fn alloc_bytes(len: usize) -> Result<Vec<u8>, VaultError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| VaultError::OutOfMemory(len))?;
    v.resize(len, 0);
    Ok(v)
}

struct Header {
    manifest_offset: u64,
    manifest_length: u64,
    flags: u64,
    salt: [u8; SALT_LEN],
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&CONTAINER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.manifest_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.manifest_length.to_le_bytes());
        buf[24..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..48].copy_from_slice(&self.salt);
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, VaultError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        if magic != CONTAINER_MAGIC {
            return Err(VaultError::InvalidContainerFormat("bad magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
        if version != CONTAINER_VERSION {
            return Err(VaultError::InvalidContainerFormat(format!(
                "unsupported format version {version}"
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[32..48]);
        Ok(Self {
            manifest_offset: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            manifest_length: u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes")),
            flags: u64::from_le_bytes(buf[24..32].try_into().expect("8 bytes")),
            salt,
        })
    }
}

/// An open container: the file handle, the derived master key, and the
/// in-memory manifest cache keyed by virtual path.
pub struct Container {
    path: PathBuf,
    file: File,
    key: MasterKey,
    entries: BTreeMap<String, FileEntry>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.path)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Create a new container at `path`, protected by `password`.
    ///
    /// The path must not exist; parent directories are created as needed.
    /// The new container carries a freshly generated salt and an empty,
    /// already-committed manifest.
    pub fn create(path: impl AsRef<Path>, password: &str) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(VaultError::FileExists);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&vault_crypto::random_bytes(SALT_LEN));
        let key = vault_crypto::derive_key(password, &salt)?;

        let mut file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        let header = Header { manifest_offset: 0, manifest_length: 0, flags: 0, salt };
        file.write_all(&header.encode())?;

        let mut container =
            Self { path: path.to_path_buf(), file, key, entries: BTreeMap::new() };
        container.save_manifest()?;
        debug!(path = %container.path.display(), "container created");
        Ok(container)
    }

    /// Open an existing container with `password`.
    ///
    /// The header is validated, the key re-derived from the stored salt, and
    /// the manifest decrypted into memory. A wrong password surfaces as
    /// [`VaultError::InvalidPassword`] when the manifest tag fails.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VaultError::ContainerNotFound);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut raw).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                VaultError::InvalidContainerFormat("truncated header".into())
            } else {
                VaultError::Io(e)
            }
        })?;
        let header = Header::decode(&raw)?;
        let key = vault_crypto::derive_key(password, &header.salt)?;

        let mut container =
            Self { path: path.to_path_buf(), file, key, entries: BTreeMap::new() };
        container.load_manifest(&header)?;
        debug!(
            path = %container.path.display(),
            files = container.entries.len(),
            "container opened"
        );
        Ok(container)
    }

    /// Filesystem path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the manifest entry for a virtual path.
    pub fn entry(&self, vpath: &str) -> Option<&FileEntry> {
        self.entries.get(vpath)
    }

    /// Virtual paths currently present, in manifest order.
    pub fn list_files(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Read the full plaintext of a virtual file.
    pub fn read_file(&mut self, vpath: &str) -> Result<Vec<u8>, VaultError> {
        let entry = self.entries.get(vpath).ok_or(VaultError::FileNotFound)?.clone();

        let file_len = self.file.metadata()?.len();
        let mut out = Vec::new();
        out.try_reserve_exact(entry.original_size as usize)
            .map_err(|_| VaultError::OutOfMemory(entry.original_size as usize))?;

        for chunk in &entry.chunks {
            let end = chunk.offset.checked_add(u64::from(chunk.compressed_size));
            if chunk.offset < HEADER_LEN || end.is_none() || end.unwrap_or(u64::MAX) > file_len {
                return Err(VaultError::InvalidContainerFormat(format!(
                    "chunk at {} exceeds container bounds",
                    chunk.offset
                )));
            }

            let mut blob = alloc_bytes(chunk.compressed_size as usize)?;
            self.file.seek(SeekFrom::Start(chunk.offset))?;
            self.file.read_exact(&mut blob)?;

            // The manifest already authenticated under this key, so a bad
            // tag here means on-disk corruption, not a wrong password.
            let compressed = vault_crypto::decrypt(&blob, &self.key)
                .map_err(|_| VaultError::DecryptionFailed)?;
            let plain = zstd::bulk::decompress(&compressed, chunk.original_size as usize)?;
            if plain.len() != chunk.original_size as usize {
                return Err(VaultError::InvalidContainerFormat(
                    "chunk decompressed to unexpected size".into(),
                ));
            }
            out.extend_from_slice(&plain);
        }

        if out.len() as u64 != entry.original_size {
            return Err(VaultError::InvalidContainerFormat(
                "chunk sizes do not add up to the entry size".into(),
            ));
        }
        Ok(out)
    }

    /// Write (or overwrite) a virtual file.
    ///
    /// The data is split into [`CHUNK_SIZE`] chunks, each compressed then
    /// encrypted and appended to the container; the manifest is re-committed
    /// afterwards. Every write builds a fresh entry, so both stamps reset
    /// and an overwritten file's old chunks become garbage.
    pub fn write_file(&mut self, vpath: &str, data: &[u8]) -> Result<(), VaultError> {
        let ctime = next_write_stamp();
        let mtime = ctime;

        let mut pos = self.file.seek(SeekFrom::End(0))?;
        let mut chunks = Vec::with_capacity(data.len().div_ceil(CHUNK_SIZE));
        for plain in data.chunks(CHUNK_SIZE) {
            let compressed = zstd::bulk::compress(plain, ZSTD_LEVEL)?;
            let blob = vault_crypto::encrypt(&compressed, &self.key)?;
            self.file.write_all(&blob)?;
            chunks.push(ChunkRef {
                offset: pos,
                compressed_size: blob.len() as u32,
                original_size: plain.len() as u32,
            });
            pos += blob.len() as u64;
        }

        self.entries.insert(
            vpath.to_string(),
            FileEntry {
                path: vpath.to_string(),
                original_size: data.len() as u64,
                ctime,
                mtime,
                chunks,
            },
        );
        self.save_manifest()?;
        debug!(path = %self.path.display(), vpath, bytes = data.len(), "file written");
        Ok(())
    }

    /// Remove a virtual file from the manifest.
    ///
    /// The file's chunks stay behind as unreferenced garbage; only the
    /// manifest changes.
    pub fn delete_file(&mut self, vpath: &str) -> Result<(), VaultError> {
        if self.entries.remove(vpath).is_none() {
            return Err(VaultError::FileNotFound);
        }
        self.save_manifest()?;
        debug!(path = %self.path.display(), vpath, "file deleted");
        Ok(())
    }

    /// Flush and close the container.
    pub fn close(self) -> Result<(), VaultError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn load_manifest(&mut self, header: &Header) -> Result<(), VaultError> {
        self.entries.clear();
        if header.manifest_offset == 0 && header.manifest_length == 0 {
            return Ok(());
        }

        let file_len = self.file.metadata()?.len();
        let end = header.manifest_offset.checked_add(header.manifest_length);
        if header.manifest_offset < HEADER_LEN || end.is_none() || end.unwrap_or(u64::MAX) > file_len
        {
            return Err(VaultError::InvalidContainerFormat(
                "manifest pointer exceeds container bounds".into(),
            ));
        }

        let mut blob = alloc_bytes(header.manifest_length as usize)?;
        self.file.seek(SeekFrom::Start(header.manifest_offset))?;
        self.file.read_exact(&mut blob)?;

        let compressed = vault_crypto::decrypt(&blob, &self.key)?;
        let raw = zstd::stream::decode_all(compressed.as_slice())
            .map_err(|_| VaultError::InvalidContainerFormat("manifest decompression".into()))?;
        let manifest = vault_manifest::deserialize(&raw)?;
        for entry in manifest.files {
            self.entries.insert(entry.path.clone(), entry);
        }
        Ok(())
    }

    // Commit sequence: (1) append the encrypted manifest blob, (2) fsync,
    // (3) patch (manifest_offset, manifest_length) as one 16-byte write.
    // A crash before (3) leaves the previous manifest authoritative.
    fn save_manifest(&mut self) -> Result<(), VaultError> {
        let manifest = Manifest {
            version: vault_manifest::MANIFEST_VERSION,
            files: self.entries.values().cloned().collect(),
        };
        let raw = vault_manifest::serialize(&manifest);
        let compressed = zstd::bulk::compress(&raw, ZSTD_LEVEL)?;
        let blob = vault_crypto::encrypt(&compressed, &self.key)?;

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&blob)?;
        self.file.sync_data()?;

        let mut ptr = [0u8; 16];
        ptr[0..8].copy_from_slice(&offset.to_le_bytes());
        ptr[8..16].copy_from_slice(&(blob.len() as u64).to_le_bytes());
        self.file.seek(SeekFrom::Start(MANIFEST_PTR_OFFSET))?;
        self.file.write_all(&ptr)?;
        self.file.flush()?;
        debug!(
            path = %self.path.display(),
            files = manifest.files.len(),
            offset,
            length = blob.len(),
            "manifest committed"
        );
        Ok(())
    }
}
