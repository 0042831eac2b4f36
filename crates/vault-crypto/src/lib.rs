//! Crypto primitives for the encrypted container format.
//!
//! Everything here is wire-visible: the key, salt, nonce and tag sizes are
//! part of the on-disk format and must not change without a format version
//! bump. Encrypted blobs are laid out as `nonce || ciphertext || tag`.
//!
//! Security model
//! - Keys are derived with Argon2id (memory-hard, 64 MiB / 2 iterations /
//!   1 lane) so offline guessing is expensive.
//! - ChaCha20-Poly1305 provides confidentiality and integrity; a failed
//!   authentication tag is indistinguishable from a wrong password and is
//!   reported as [`CryptoError::InvalidPassword`].
//! - Derived keys are wiped from memory on drop.

#![deny(unsafe_code)]

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

/// Derived key length in bytes (ChaCha20-Poly1305 key).
pub const KEY_LEN: usize = 32;
/// Salt length the container format stores in its header.
pub const SALT_LEN: usize = 16;
/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Poly1305 authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Minimum salt length accepted by [`derive_key`]. The container format
/// always supplies [`SALT_LEN`] bytes; the lower bound exists for the
/// primitive contract only.
pub const MIN_SALT_LEN: usize = 8;

const ARGON2_MEM_KIB: u32 = 65536; // 64 MiB
const ARGON2_ITERS: u32 = 2;
const ARGON2_LANES: u32 = 1;

/// Errors emitted by the crypto primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Password hashing failed (bad parameters or primitive error).
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,
    /// The blob is malformed (too short to hold nonce and tag).
    #[error("decryption failed: malformed blob")]
    DecryptionFailed,
    /// Authentication tag mismatch: wrong key or tampered ciphertext.
    /// The two causes are cryptographically indistinguishable.
    #[error("authentication failed: wrong password or tampered data")]
    InvalidPassword,
}

/// A 32-byte symmetric key, zeroized when dropped.
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Fill a fresh buffer with `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Derive a [`MasterKey`] from a password and salt with Argon2id.
///
/// Parameters are fixed (64 MiB memory, 2 iterations, 1 lane) and part of
/// the container contract. Salts shorter than [`MIN_SALT_LEN`] are rejected.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<MasterKey, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::KeyDerivationFailed(format!(
            "salt too short: {} < {MIN_SALT_LEN}",
            salt.len()
        )));
    }
    let params =
        argon2::Params::new(ARGON2_MEM_KIB, ARGON2_ITERS, ARGON2_LANES, Some(KEY_LEN))
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(MasterKey(key))
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` blob produced by [`encrypt`].
///
/// A tag mismatch surfaces as [`CryptoError::InvalidPassword`]; a blob too
/// short to contain a nonce and tag is [`CryptoError::DecryptionFailed`].
pub fn decrypt(blob: &[u8], key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce, ct) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| CryptoError::InvalidPassword)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn random_bytes_len_and_variability() {
        let a = random_bytes(SALT_LEN);
        let b = random_bytes(SALT_LEN);
        assert_eq!(a.len(), SALT_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn encrypt_layout_and_roundtrip() {
        let key = test_key(7);
        let blob = encrypt(b"hello container", &key).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + b"hello container".len() + TAG_LEN);
        let pt = decrypt(&blob, &key).unwrap();
        assert_eq!(pt, b"hello container");
    }

    #[test]
    fn fresh_nonce_per_call() {
        let key = test_key(1);
        let a = encrypt(b"same input", &key).unwrap();
        let b = encrypt(b"same input", &key).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_key(9);
        let blob = encrypt(b"", &key).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + TAG_LEN);
        assert_eq!(decrypt(&blob, &key).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn wrong_key_is_invalid_password() {
        let blob = encrypt(b"secret", &test_key(2)).unwrap();
        let err = decrypt(&blob, &test_key(3)).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPassword));
    }

    #[test]
    fn any_flipped_byte_fails_authentication() {
        let key = test_key(4);
        let blob = encrypt(b"integrity", &key).unwrap();
        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(decrypt(&tampered, &key), Err(CryptoError::InvalidPassword)),
                "byte {i} did not break the tag"
            );
        }
    }

    #[test]
    fn truncated_blob_is_decryption_failed() {
        let err = decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1], &test_key(5)).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn derive_key_is_deterministic_per_salt() {
        let salt = [0x5a; SALT_LEN];
        let k1 = derive_key("correct horse", &salt).unwrap();
        let k2 = derive_key("correct horse", &salt).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let mut other_salt = salt;
        other_salt[0] ^= 0xff;
        let k3 = derive_key("correct horse", &other_salt).unwrap();
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn derive_key_rejects_short_salt() {
        let err = derive_key("pw", &[0u8; MIN_SALT_LEN - 1]).unwrap_err();
        assert!(matches!(err, CryptoError::KeyDerivationFailed(_)));
    }
}
