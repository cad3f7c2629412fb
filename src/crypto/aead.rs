//! ChaCha20-Poly1305 AEAD for I-frame payloads.
//!
//! The associated data is the final 7-byte frame header exactly as it goes
//! on the wire, i.e. with the length field already including the 16-byte
//! tag. Tampering with the address, length or control field therefore
//! breaks authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroize;

use crate::core::{SecurityError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE, SESSION_KEY_SIZE};

/// A session key for AEAD operations. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt a payload. Returns ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SecurityError::EncryptionFailed)
}

/// Decrypt a payload produced by [`seal`].
///
/// A tag mismatch is a security incident for the caller to account.
pub fn open(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(SecurityError::AuthenticationFailed);
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SecurityError::AuthenticationFailed)
}
