//! Binding key management.
//!
//! The binding key is the 32-byte X25519 static secret provisioned on both
//! sides when the secondary is bound to this host. It never leaves the
//! security worker; the engine only ever sees public keys.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{SecurityError, PUBLIC_KEY_SIZE};

/// The host's binding key. Zeroized on drop.
pub struct BindingKey {
    secret: [u8; 32],
}

impl BindingKey {
    /// Generate a fresh random binding key.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    /// Wrap existing key material.
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Load the key from its file (64 hex characters).
    pub fn load(path: &Path) -> Result<Self, SecurityError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SecurityError::BindingKey(format!("{}: {e}", path.display())))?;
        let mut secret = [0u8; 32];
        decode_hex(text.trim(), &mut secret)
            .map_err(|e| SecurityError::BindingKey(format!("{}: {e}", path.display())))?;
        Ok(Self { secret })
    }

    /// Write the key to `path` with owner-only permissions.
    pub fn store(&self, path: &Path) -> io::Result<()> {
        let mut text = String::with_capacity(65);
        for byte in &self.secret {
            text.push_str(&format!("{byte:02x}"));
        }
        text.push('\n');
        fs::write(path, text)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
    }

    /// The 64-bit identifier of this key, reported during the handshake.
    pub fn key_id(&self) -> u64 {
        let public = self.public();
        u64::from_le_bytes(public.as_bytes()[..8].try_into().unwrap())
    }

    /// Public half of the binding key.
    pub fn public(&self) -> PublicKey {
        PublicKey::from(&StaticSecret::from(self.secret))
    }

    /// Raw secret bytes, for mixing into the session KDF.
    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Drop for BindingKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// An ephemeral X25519 keypair for one handshake or rekey.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key, sent to the secondary.
    pub fn public(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Consume the keypair, computing the shared secret with the peer.
    pub fn diffie_hellman(self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote_public));
        *shared.as_bytes()
    }
}

fn decode_hex(text: &str, out: &mut [u8; 32]) -> Result<(), String> {
    if text.len() != 64 {
        return Err(format!("expected 64 hex characters, got {}", text.len()));
    }
    for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| "invalid utf-8".to_string())?;
        out[i] = u8::from_str_radix(s, 16).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = BindingKey::generate();
        let b = BindingKey::generate();
        assert_ne!(a.public().as_bytes(), b.public().as_bytes());
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("cpcd-key-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("binding.key");

        let key = BindingKey::generate();
        key.store(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = BindingKey::load(&path).unwrap();
        assert_eq!(loaded.public().as_bytes(), key.public().as_bytes());
        assert_eq!(loaded.key_id(), key.key_id());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_fails() {
        let err = BindingKey::load(Path::new("/nonexistent/binding.key"));
        assert!(matches!(err, Err(SecurityError::BindingKey(_))));
    }

    #[test]
    fn test_ephemeral_agreement() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        let a_pub = a.public();
        let b_pub = b.public();

        let shared_a = a.diffie_hellman(&b_pub);
        let shared_b = b.diffie_hellman(&a_pub);
        assert_eq!(shared_a, shared_b);
    }
}
