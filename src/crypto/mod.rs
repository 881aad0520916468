//! Content and name encryption
//!
//! File contents pass through an [`Encryptor`] before upload; remote paths
//! pass through a [`PathCipher`] so the server only ever sees opaque tokens.
//!
//! - [`StreamEncryptor`]: XChaCha20-Poly1305 STREAM segments
//! - [`DeterministicPathCipher`]: per-segment synthetic-nonce encryption
//! - [`PassthroughEncryptor`] / [`PlainPathCipher`]: unencrypted remotes and tests

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub mod path;
pub mod stream;

pub use path::{DeterministicPathCipher, PathCipher, PlainPathCipher};
pub use stream::StreamEncryptor;

/// Size of every symmetric key in bytes
pub const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Crypto errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream-transforming writer returned by an [`Encryptor`]
///
/// Plaintext goes in through `write`; `finish` consumes the writer, flushes
/// any buffered state and yields the complete ciphertext.
pub trait CipherWriter: Send {
    fn write(&mut self, plaintext: &[u8]) -> Result<(), CryptoError>;

    fn finish(self: Box<Self>) -> Result<Bytes, CryptoError>;
}

/// Content encryption filter
pub trait Encryptor: Send + Sync {
    /// Start a new ciphertext stream
    fn encrypting_writer(&self) -> Result<Box<dyn CipherWriter>, CryptoError>;

    /// Reverse a complete ciphertext produced by this encryptor
    fn decrypt(&self, ciphertext: Bytes) -> Result<Bytes, CryptoError>;
}

/// Identity filter
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryptor;

struct PassthroughWriter {
    buf: Vec<u8>,
}

impl CipherWriter for PassthroughWriter {
    fn write(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        self.buf.extend_from_slice(plaintext);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Bytes, CryptoError> {
        Ok(Bytes::from(self.buf))
    }
}

impl Encryptor for PassthroughEncryptor {
    fn encrypting_writer(&self) -> Result<Box<dyn CipherWriter>, CryptoError> {
        Ok(Box::new(PassthroughWriter { buf: Vec::new() }))
    }

    fn decrypt(&self, ciphertext: Bytes) -> Result<Bytes, CryptoError> {
        Ok(ciphertext)
    }
}

/// Keys derived from a single master key
///
/// Contents and names use independent subkeys.
#[derive(Clone)]
pub struct KeyMaterial {
    pub data_key: [u8; KEY_SIZE],
    pub name_key: [u8; KEY_SIZE],
    pub name_mac_key: [u8; KEY_SIZE],
}

impl KeyMaterial {
    /// Derive subkeys from raw master key bytes
    pub fn derive(master: &[u8]) -> Result<Self, CryptoError> {
        if master.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                master.len()
            )));
        }

        Ok(Self {
            data_key: derive_subkey(master, b"charmfs data v1")?,
            name_key: derive_subkey(master, b"charmfs name v1")?,
            name_mac_key: derive_subkey(master, b"charmfs name mac v1")?,
        })
    }

    /// Derive subkeys from a base64 encoded master key
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let master = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("master key is not base64: {e}")))?;
        Self::derive(&master)
    }

    /// Generate a fresh base64 encoded master key
    pub fn generate_base64() -> String {
        let master: [u8; KEY_SIZE] = rand::random();
        STANDARD.encode(master)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([redacted])")
    }
}

fn derive_subkey(master: &[u8], label: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(label);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_is_identity() {
        let mut writer = PassthroughEncryptor.encrypting_writer().unwrap();
        writer.write(b"hello ").unwrap();
        writer.write(b"world").unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(&out[..], b"hello world");
    }

    #[test]
    fn test_subkeys_are_distinct() {
        let keys = KeyMaterial::derive(&[7u8; KEY_SIZE]).unwrap();
        assert_ne!(keys.data_key, keys.name_key);
        assert_ne!(keys.name_key, keys.name_mac_key);
    }

    #[test]
    fn test_short_master_key_rejected() {
        assert!(matches!(
            KeyMaterial::derive(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_generated_key_round_trips() {
        let encoded = KeyMaterial::generate_base64();
        assert!(KeyMaterial::from_base64(&encoded).is_ok());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let keys = KeyMaterial::derive(&[1u8; KEY_SIZE]).unwrap();
        assert_eq!(format!("{keys:?}"), "KeyMaterial([redacted])");
    }
}
