//! Remote path obfuscation
//!
//! Paths are encrypted one segment at a time so directory structure
//! survives on the server and listings can be decrypted name by name.

use super::{CryptoError, HmacSha256, KeyMaterial, KEY_SIZE};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hmac::Mac;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Characters left as-is by [`PlainPathCipher`]
const SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Maps plaintext paths to path-safe tokens and back
pub trait PathCipher: Send + Sync {
    /// Encrypt a full `/`-separated path; the empty path is the root
    fn encrypt_path(&self, path: &str) -> Result<String, CryptoError>;

    /// Decrypt a single name returned by a directory listing
    fn decrypt_name(&self, name: &str) -> Result<String, CryptoError>;
}

/// Split a path into validated segments
fn segments(path: &str) -> Result<Vec<&str>, CryptoError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split('/')
        .map(|segment| match segment {
            "" => Err(CryptoError::InvalidPath(format!(
                "empty segment in '{path}'"
            ))),
            "." | ".." => Err(CryptoError::InvalidPath(format!(
                "relative segment '{segment}' in '{path}'"
            ))),
            s => Ok(s),
        })
        .collect()
}

/// Deterministic segment encryption
///
/// Each segment is sealed with XChaCha20-Poly1305 under a synthetic nonce
/// `HMAC-SHA256(mac_key, segment)[..24]`, so equal names always map to the
/// same token. Tokens are `base64url(nonce || ciphertext)` without padding.
#[derive(Clone)]
pub struct DeterministicPathCipher {
    key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl DeterministicPathCipher {
    pub fn new(key: [u8; KEY_SIZE], mac_key: [u8; KEY_SIZE]) -> Self {
        Self { key, mac_key }
    }

    pub fn from_keys(keys: &KeyMaterial) -> Self {
        Self::new(keys.name_key, keys.name_mac_key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    fn synthetic_nonce(&self, segment: &str) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(segment.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        Ok(nonce)
    }

    fn seal_segment(&self, segment: &str) -> Result<String, CryptoError> {
        let nonce = self.synthetic_nonce(segment)?;
        let sealed = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), segment.as_bytes())
            .map_err(|e| CryptoError::Encryption(format!("name seal failed: {e}")))?;

        let mut token = Vec::with_capacity(NONCE_SIZE + sealed.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }
}

impl std::fmt::Debug for DeterministicPathCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeterministicPathCipher")
    }
}

impl PathCipher for DeterministicPathCipher {
    fn encrypt_path(&self, path: &str) -> Result<String, CryptoError> {
        let sealed = segments(path)?
            .into_iter()
            .map(|segment| self.seal_segment(segment))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sealed.join("/"))
    }

    fn decrypt_name(&self, name: &str) -> Result<String, CryptoError> {
        let token = URL_SAFE_NO_PAD
            .decode(name)
            .map_err(|e| CryptoError::Decryption(format!("name '{name}' is not a token: {e}")))?;
        if token.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption(format!(
                "name '{name}' is too short to be a token"
            )));
        }

        let (nonce, sealed) = token.split_at(NONCE_SIZE);
        let opened = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decryption(format!("name '{name}' failed authentication")))?;

        String::from_utf8(opened)
            .map_err(|_| CryptoError::Decryption(format!("name '{name}' is not UTF-8")))
    }
}

/// Percent-encodes segments without encrypting them
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainPathCipher;

impl PathCipher for PlainPathCipher {
    fn encrypt_path(&self, path: &str) -> Result<String, CryptoError> {
        let encoded: Vec<String> = segments(path)?
            .into_iter()
            .map(|segment| utf8_percent_encode(segment, SEGMENT_SET).to_string())
            .collect();
        Ok(encoded.join("/"))
    }

    fn decrypt_name(&self, name: &str) -> Result<String, CryptoError> {
        percent_decode_str(name)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|e| CryptoError::Decryption(format!("name '{name}' is not UTF-8: {e}")))
    }
}
