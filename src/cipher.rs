//! Content cipher for sealed record payloads.
//!
//! # Algorithm
//!
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//! - **Nonce**: 12 random bytes from the OS RNG, fresh for every seal
//! - **Key**: 256-bit per-user secret, generated once at registration and
//!   never derived from a password
//!
//! The 16-byte authentication tag is stored next to the ciphertext so the
//! record row carries `(algorithm, nonce, tag)` as explicit metadata.
//! A nonce must never be reused with the same key; the record store enforces
//! that with a unique `(owner_id, cipher_nonce)` constraint.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EngineError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Algorithm identifier persisted with every sealed payload
pub const ALGORITHM_ID: &str = "chacha20-poly1305";

/// Key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

// =============================================================================
// Types
// =============================================================================

/// Per-user content key. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct UserKey([u8; KEY_LEN]);

impl UserKey {
    /// Rebuild a key from stored bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(EngineError::Validation(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UserKey(..)")
    }
}

/// Sealed payload plus the metadata needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub algorithm: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

// =============================================================================
// Key Generation
// =============================================================================

/// Generate a fresh per-user content key.
pub fn generate_user_key() -> UserKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    UserKey(key)
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// =============================================================================
// Seal / Open
// =============================================================================

/// Seal a plaintext under `key` with a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &UserKey) -> Result<SealedPayload> {
    let nonce = generate_nonce();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| EngineError::Validation(format!("Encryption failed: {e}")))?;

    Ok(SealedPayload {
        algorithm: ALGORITHM_ID.to_string(),
        nonce: nonce.to_vec(),
        ciphertext: buffer,
        tag: tag.to_vec(),
    })
}

/// Open a sealed payload.
///
/// # Errors
///
/// Returns [`EngineError::CipherAuthenticationFailed`] if the tag does not
/// verify: wrong key, tampered ciphertext, malformed nonce or tag, or an
/// unknown algorithm id.
pub fn open(sealed: &SealedPayload, key: &UserKey) -> Result<Vec<u8>> {
    if sealed.algorithm != ALGORITHM_ID
        || sealed.nonce.len() != NONCE_LEN
        || sealed.tag.len() != AUTH_TAG_LEN
    {
        return Err(EngineError::CipherAuthenticationFailed);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            b"",
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| EngineError::CipherAuthenticationFailed)?;

    Ok(buffer)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_user_key();
        let payload = "dear future me, the garden is blooming".as_bytes();

        let sealed = seal(payload, &key).unwrap();
        assert_eq!(sealed.algorithm, ALGORITHM_ID);
        assert_eq!(sealed.nonce.len(), NONCE_LEN);
        assert_eq!(sealed.tag.len(), AUTH_TAG_LEN);
        assert_eq!(sealed.ciphertext.len(), payload.len());
        assert_ne!(sealed.ciphertext, payload);

        assert_eq!(open(&sealed, &key).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let key = generate_user_key();
        let sealed = seal(b"", &key).unwrap();
        assert!(open(&sealed, &key).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = generate_user_key();
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = generate_user_key();
        let other = generate_user_key();
        let sealed = seal(b"secret", &key).unwrap();

        assert!(matches!(
            open(&sealed, &other),
            Err(EngineError::CipherAuthenticationFailed)
        ));
    }

    #[test]
    fn test_bit_flips_fail() {
        let key = generate_user_key();
        let sealed = seal(b"integrity matters", &key).unwrap();

        for i in 0..sealed.ciphertext.len() {
            let mut tampered = sealed.clone();
            tampered.ciphertext[i] ^= 0x01;
            assert!(open(&tampered, &key).is_err(), "ciphertext byte {i}");
        }

        for i in 0..AUTH_TAG_LEN {
            let mut tampered = sealed.clone();
            tampered.tag[i] ^= 0x80;
            assert!(open(&tampered, &key).is_err(), "tag byte {i}");
        }

        let mut tampered = sealed.clone();
        tampered.nonce[0] ^= 0x01;
        assert!(open(&tampered, &key).is_err());
    }

    #[test]
    fn test_malformed_metadata_fails() {
        let key = generate_user_key();
        let sealed = seal(b"x", &key).unwrap();

        let mut wrong_alg = sealed.clone();
        wrong_alg.algorithm = "aes-256-cbc".into();
        assert!(matches!(
            open(&wrong_alg, &key),
            Err(EngineError::CipherAuthenticationFailed)
        ));

        let mut short_tag = sealed.clone();
        short_tag.tag.truncate(8);
        assert!(matches!(
            open(&short_tag, &key),
            Err(EngineError::CipherAuthenticationFailed)
        ));
    }

    #[test]
    fn test_user_key_from_slice() {
        let key = generate_user_key();
        let restored = UserKey::from_slice(key.as_bytes()).unwrap();
        assert_eq!(restored.as_bytes(), key.as_bytes());
        assert!(UserKey::from_slice(&[0u8; 16]).is_err());
    }
}
