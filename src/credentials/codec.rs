//! # Credential Codec
//!
//! Authenticated encryption of generated database passwords at rest.
//!
//! Each call draws a fresh salt and nonce, derives a per-record key from the
//! master secret with scrypt (N=2^14, r=8, p=1) and seals with AES-256-GCM
//! using a 16-byte nonce. The stored form is self-contained:
//!
//! ```text
//! base64( salt[32] || nonce[16] || tag[16] || ciphertext )
//! ```
//!
//! The layout and parameters must not change: previously stored
//! credentials are decrypted with exactly these settings.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
const HEADER_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// AES-256-GCM with a 128-bit nonce
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Codec failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Not base64, too short, or not UTF-8 after decryption
    #[error("malformed stored credential: {0}")]
    Malformed(String),

    /// Tag did not verify: tampered data or a different master secret
    #[error("stored credential failed authentication")]
    Authentication,

    #[error("credential codec failure: {0}")]
    Internal(String),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Encrypts and decrypts credentials under a process-wide master secret
#[derive(Clone)]
pub struct CredentialCodec {
    master_secret: Vec<u8>,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("master_secret", &"<redacted>")
            .finish()
    }
}

impl CredentialCodec {
    /// Create a codec for a master secret
    pub fn new(master_secret: impl AsRef<[u8]>) -> Self {
        Self {
            master_secret: master_secret.as_ref().to_vec(),
        }
    }

    /// Encrypt with a fresh random salt and nonce
    pub fn encrypt(&self, plaintext: &str) -> CodecResult<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);
        self.seal(plaintext, &salt, &nonce)
    }

    /// Decrypt a stored credential. Never returns plaintext unless the tag verifies.
    pub fn decrypt(&self, encoded: &str) -> CodecResult<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CodecError::Malformed(format!("invalid base64: {}", e)))?;

        if raw.len() < HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "expected at least {} bytes, got {}",
                HEADER_LEN,
                raw.len()
            )));
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let cipher = self.cipher(salt)?;
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CodecError::Authentication)?;

        String::from_utf8(buffer)
            .map_err(|_| CodecError::Malformed("plaintext is not UTF-8".to_string()))
    }

    fn seal(&self, plaintext: &str, salt: &[u8], nonce: &[u8]) -> CodecResult<String> {
        let cipher = self.cipher(salt)?;
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", &mut buffer)
            .map_err(|e| CodecError::Internal(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + buffer.len());
        out.extend_from_slice(salt);
        out.extend_from_slice(nonce);
        out.extend_from_slice(tag.as_slice());
        out.extend_from_slice(&buffer);
        Ok(STANDARD.encode(out))
    }

    fn cipher(&self, salt: &[u8]) -> CodecResult<Aes256Gcm16> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| CodecError::Internal(e.to_string()))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(&self.master_secret, salt, &params, &mut key)
            .map_err(|e| CodecError::Internal(e.to_string()))?;
        Ok(Aes256Gcm16::new(GenericArray::from_slice(&key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-master-secret";
    const PASSWORD: &str = "Abc123XyZ789DefGhi456JkL";

    /// Produced by the previous service for salt = 00..1f, nonce = a0..af
    const STORED: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh+goaKjpKWmp6ipqqusra6vOcl/W9UdBuygDEgNkl2eqKxO0VqFItK25TlYnPyXWbFUHGmzSK2Q7A==";

    fn fixed_salt_and_nonce() -> ([u8; SALT_LEN], [u8; NONCE_LEN]) {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        for (i, b) in salt.iter_mut().enumerate() {
            *b = i as u8;
        }
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = 0xA0 + i as u8;
        }
        (salt, nonce)
    }

    #[test]
    fn test_round_trip() {
        let codec = CredentialCodec::new(SECRET);
        let stored = codec.encrypt(PASSWORD).unwrap();
        assert_ne!(stored, PASSWORD);
        assert!(!stored.contains(PASSWORD));
        assert_eq!(codec.decrypt(&stored).unwrap(), PASSWORD);
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_call() {
        let codec = CredentialCodec::new(SECRET);
        let a = codec.encrypt(PASSWORD).unwrap();
        let b = codec.encrypt(PASSWORD).unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decrypt(&a).unwrap(), codec.decrypt(&b).unwrap());
    }

    #[test]
    fn test_reads_existing_stored_credential() {
        let codec = CredentialCodec::new(SECRET);
        assert_eq!(codec.decrypt(STORED).unwrap(), PASSWORD);
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let codec = CredentialCodec::new(SECRET);
        let (salt, nonce) = fixed_salt_and_nonce();
        assert_eq!(codec.seal(PASSWORD, &salt, &nonce).unwrap(), STORED);

        let raw = STANDARD.decode(STORED).unwrap();
        assert_eq!(raw.len(), HEADER_LEN + PASSWORD.len());
        assert_eq!(&raw[..SALT_LEN], &salt);
        assert_eq!(&raw[SALT_LEN..SALT_LEN + NONCE_LEN], &nonce);
    }

    #[test]
    fn test_wrong_master_secret_fails_authentication() {
        let stored = CredentialCodec::new(SECRET).encrypt(PASSWORD).unwrap();
        let other = CredentialCodec::new("another-secret");
        assert_eq!(other.decrypt(&stored), Err(CodecError::Authentication));
    }

    #[test]
    fn test_tampering_fails_authentication() {
        let codec = CredentialCodec::new(SECRET);
        let mut raw = STANDARD.decode(STORED).unwrap();

        // Flip one bit in the ciphertext, the tag, and the salt in turn
        for index in [raw.len() - 1, SALT_LEN + NONCE_LEN, 0] {
            raw[index] ^= 0x01;
            let tampered = STANDARD.encode(&raw);
            assert_eq!(codec.decrypt(&tampered), Err(CodecError::Authentication));
            raw[index] ^= 0x01;
        }
    }

    #[test]
    fn test_malformed_input() {
        let codec = CredentialCodec::new(SECRET);
        assert!(matches!(codec.decrypt("not base64!"), Err(CodecError::Malformed(_))));
        let short = STANDARD.encode([0u8; HEADER_LEN - 1]);
        assert!(matches!(codec.decrypt(&short), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_empty_plaintext() {
        let codec = CredentialCodec::new(SECRET);
        let stored = codec.encrypt("").unwrap();
        assert_eq!(STANDARD.decode(&stored).unwrap().len(), HEADER_LEN);
        assert_eq!(codec.decrypt(&stored).unwrap(), "");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let codec = CredentialCodec::new(SECRET);
        assert!(!format!("{:?}", codec).contains(SECRET));
    }
}
