//! Segmented content encryption
//!
//! Layout: `nonce_prefix (19 bytes) || segment* || last_segment`, each
//! segment being `SEGMENT_SIZE` plaintext bytes sealed with a 16-byte tag.
//! The last segment carries the STREAM last-block flag, so truncating the
//! ciphertext at a segment boundary fails authentication.

use super::{CipherWriter, CryptoError, Encryptor, KeyMaterial, KEY_SIZE};
use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};

/// Plaintext bytes per sealed segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

/// XChaCha20 nonce minus the 5 bytes STREAM reserves for counter and flag
pub const NONCE_PREFIX_SIZE: usize = 19;

/// Content encryptor backed by XChaCha20-Poly1305 STREAM
#[derive(Clone)]
pub struct StreamEncryptor {
    key: [u8; KEY_SIZE],
}

impl StreamEncryptor {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    pub fn from_keys(keys: &KeyMaterial) -> Self {
        Self::new(keys.data_key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    /// Ciphertext length for a plaintext of `plaintext_len` bytes
    pub fn ciphertext_len(plaintext_len: u64) -> u64 {
        let segment = SEGMENT_SIZE as u64;
        let segments = if plaintext_len == 0 {
            1
        } else {
            plaintext_len.div_ceil(segment)
        };
        NONCE_PREFIX_SIZE as u64 + plaintext_len + segments * TAG_SIZE as u64
    }
}

impl std::fmt::Debug for StreamEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamEncryptor")
    }
}

struct StreamWriter {
    encryptor: EncryptorBE32<XChaCha20Poly1305>,
    pending: Vec<u8>,
    out: BytesMut,
}

impl CipherWriter for StreamWriter {
    fn write(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        self.pending.extend_from_slice(plaintext);

        // Hold back a full segment so the final one can be sealed as last.
        while self.pending.len() > SEGMENT_SIZE {
            let sealed = self
                .encryptor
                .encrypt_next(&self.pending[..SEGMENT_SIZE])
                .map_err(|e| CryptoError::Encryption(format!("segment seal failed: {e}")))?;
            self.out.extend_from_slice(&sealed);
            self.pending.drain(..SEGMENT_SIZE);
        }

        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Bytes, CryptoError> {
        let StreamWriter {
            encryptor,
            pending,
            mut out,
        } = *self;

        let sealed = encryptor
            .encrypt_last(pending.as_slice())
            .map_err(|e| CryptoError::Encryption(format!("final segment seal failed: {e}")))?;
        out.extend_from_slice(&sealed);

        Ok(out.freeze())
    }
}

impl Encryptor for StreamEncryptor {
    fn encrypting_writer(&self) -> Result<Box<dyn CipherWriter>, CryptoError> {
        let nonce: [u8; NONCE_PREFIX_SIZE] = rand::random();
        let encryptor = EncryptorBE32::from_aead(self.cipher(), GenericArray::from_slice(&nonce));

        let mut out = BytesMut::with_capacity(NONCE_PREFIX_SIZE + SEGMENT_SIZE + TAG_SIZE);
        out.extend_from_slice(&nonce);

        Ok(Box::new(StreamWriter {
            encryptor,
            pending: Vec::with_capacity(SEGMENT_SIZE),
            out,
        }))
    }

    fn decrypt(&self, ciphertext: Bytes) -> Result<Bytes, CryptoError> {
        if ciphertext.len() < NONCE_PREFIX_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (nonce, mut rest) = ciphertext.split_at(NONCE_PREFIX_SIZE);
        let mut decryptor = DecryptorBE32::from_aead(self.cipher(), GenericArray::from_slice(nonce));
        let mut plaintext = BytesMut::with_capacity(rest.len());

        const SEALED_SEGMENT: usize = SEGMENT_SIZE + TAG_SIZE;
        while rest.len() > SEALED_SEGMENT {
            let opened = decryptor
                .decrypt_next(&rest[..SEALED_SEGMENT])
                .map_err(|_| CryptoError::Decryption("segment authentication failed".into()))?;
            plaintext.extend_from_slice(&opened);
            rest = &rest[SEALED_SEGMENT..];
        }

        let opened = decryptor
            .decrypt_last(rest)
            .map_err(|_| CryptoError::Decryption("final segment authentication failed".into()))?;
        plaintext.extend_from_slice(&opened);

        Ok(plaintext.freeze())
    }
}
