//! Binary codec for the container manifest (the directory of file entries).
//!
//! The encoding is deterministic and length-prefixed; all integers are
//! little-endian. Grammar:
//!
//! ```text
//! Manifest  := u32 version | u32 file_count | FileEntry{file_count}
//! FileEntry := String path | u64 original_size | u64 ctime | u64 mtime
//!              | u32 chunk_count | ChunkRef{chunk_count}
//! ChunkRef  := u64 offset | u32 compressed_size | u32 original_size
//! String    := u32 length | bytes{length}
//! ```
//!
//! Decoding checks every read against the remaining buffer, rejects any
//! version other than 1, and by default ignores trailing bytes so future
//! encoders may append extensions. [`deserialize_strict`] rejects them.

#![deny(unsafe_code)]

use thiserror::Error;

/// The only manifest version this codec understands.
pub const MANIFEST_VERSION: u32 = 1;

/// Errors produced while decoding a manifest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A field extends past the end of the buffer.
    #[error("unexpected end of manifest buffer")]
    UnexpectedEof,
    /// The manifest declares a version this codec does not understand.
    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(u32),
    /// Strict decoding found bytes after the last file entry.
    #[error("{0} trailing bytes after manifest")]
    TrailingBytes(usize),
    /// A path field is not valid UTF-8.
    #[error("manifest path is not valid utf-8")]
    InvalidPath,
}

/// Physical location of one chunk of a file inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    /// Absolute file offset of the encrypted blob.
    pub offset: u64,
    /// On-disk length of the blob (nonce + ciphertext + tag).
    pub compressed_size: u32,
    /// Plaintext length this chunk decompresses to.
    pub original_size: u32,
}

/// One virtual file: its path, sizes, write stamps and chunk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Virtual path, unique within a manifest, case-sensitive.
    pub path: String,
    /// Total plaintext size; equals the sum of chunk `original_size`s.
    pub original_size: u64,
    /// Creation stamp (opaque monotonic counter).
    pub ctime: u64,
    /// Last-write stamp (opaque monotonic counter).
    pub mtime: u64,
    /// Chunks in logical order; concatenated they form the file.
    pub chunks: Vec<ChunkRef>,
}

/// The container directory: an ordered list of file entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version, always [`MANIFEST_VERSION`] when produced here.
    pub version: u32,
    /// File entries in serialization order.
    pub files: Vec<FileEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self { version: MANIFEST_VERSION, files: Vec::new() }
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, u32::try_from(s.len()).expect("path length fits u32"));
    out.extend_from_slice(s.as_bytes());
}

/// Serialize a manifest to its canonical byte form.
pub fn serialize(manifest: &Manifest) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, manifest.version);
    put_u32(&mut out, manifest.files.len() as u32);
    for file in &manifest.files {
        put_str(&mut out, &file.path);
        put_u64(&mut out, file.original_size);
        put_u64(&mut out, file.ctime);
        put_u64(&mut out, file.mtime);
        put_u32(&mut out, file.chunks.len() as u32);
        for chunk in &file.chunks {
            put_u64(&mut out, chunk.offset);
            put_u32(&mut out, chunk.compressed_size);
            put_u32(&mut out, chunk.original_size);
        }
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidPath)
    }
}

fn decode(buf: &[u8], strict: bool) -> Result<Manifest, CodecError> {
    let mut r = Reader::new(buf);

    let version = r.read_u32()?;
    if version != MANIFEST_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let file_count = r.read_u32()?;
    let mut files = Vec::new();
    for _ in 0..file_count {
        let path = r.read_string()?;
        let original_size = r.read_u64()?;
        let ctime = r.read_u64()?;
        let mtime = r.read_u64()?;

        let chunk_count = r.read_u32()?;
        let mut chunks = Vec::new();
        for _ in 0..chunk_count {
            chunks.push(ChunkRef {
                offset: r.read_u64()?,
                compressed_size: r.read_u32()?,
                original_size: r.read_u32()?,
            });
        }
        files.push(FileEntry { path, original_size, ctime, mtime, chunks });
    }

    if strict && r.remaining() > 0 {
        return Err(CodecError::TrailingBytes(r.remaining()));
    }
    Ok(Manifest { version, files })
}

/// Decode a manifest, ignoring any trailing bytes (forward-compatible).
pub fn deserialize(buf: &[u8]) -> Result<Manifest, CodecError> {
    decode(buf, false)
}

/// Decode a manifest and reject trailing bytes.
pub fn deserialize_strict(buf: &[u8]) -> Result<Manifest, CodecError> {
    decode(buf, true)
}
