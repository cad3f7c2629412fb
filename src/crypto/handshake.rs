//! Session key exchange over the security endpoint.
//!
//! The handshake is a fixed three-step exchange carried in I-frames on
//! endpoint 14:
//!
//! ```text
//! host -> secondary   RequestId
//! host <- secondary   IdResponse { key_id }
//! host -> secondary   EphemeralPublic { public }
//! host <- secondary   EphemeralResponse { public }
//! host -> secondary   SessionIdExchange { id }      (for logging)
//! host <- secondary   SessionIdExchange { id }
//! ```
//!
//! Both sides then derive the session key with HKDF-SHA256 over the
//! ephemeral ECDH output, salted with the shared binding secret. An
//! attacker without the binding key cannot impersonate either side even
//! with full visibility of the exchange.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::core::{SecurityError, PUBLIC_KEY_SIZE, SESSION_KEY_SIZE};
use crate::crypto::aead::SessionKey;

const MSG_REQUEST_ID: u8 = 0x01;
const MSG_ID_RESPONSE: u8 = 0x02;
const MSG_EPHEMERAL_PUBLIC: u8 = 0x03;
const MSG_EPHEMERAL_RESPONSE: u8 = 0x04;
const MSG_SESSION_ID: u8 = 0x05;

/// A message on the security endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Host asks the secondary which binding key it holds.
    RequestId,
    /// Secondary names its binding key.
    IdResponse {
        /// 64-bit identifier of the secondary's binding key.
        key_id: u64,
    },
    /// Host sends its ephemeral public key.
    EphemeralPublic {
        /// X25519 public key.
        public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Secondary answers with its ephemeral public key.
    EphemeralResponse {
        /// X25519 public key.
        public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Either side announces the session identifier it derived.
    SessionIdExchange {
        /// Derived 64-bit session identifier.
        id: u64,
    },
}

impl HandshakeMessage {
    /// Serialize for transmission on the security endpoint.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HandshakeMessage::RequestId => vec![MSG_REQUEST_ID],
            HandshakeMessage::IdResponse { key_id } => {
                let mut buf = vec![MSG_ID_RESPONSE];
                buf.extend_from_slice(&key_id.to_le_bytes());
                buf
            }
            HandshakeMessage::EphemeralPublic { public } => {
                let mut buf = vec![MSG_EPHEMERAL_PUBLIC];
                buf.extend_from_slice(public);
                buf
            }
            HandshakeMessage::EphemeralResponse { public } => {
                let mut buf = vec![MSG_EPHEMERAL_RESPONSE];
                buf.extend_from_slice(public);
                buf
            }
            HandshakeMessage::SessionIdExchange { id } => {
                let mut buf = vec![MSG_SESSION_ID];
                buf.extend_from_slice(&id.to_le_bytes());
                buf
            }
        }
    }

    /// Parse a message received on the security endpoint.
    pub fn decode(data: &[u8]) -> Result<Self, SecurityError> {
        let malformed = || SecurityError::HandshakeFailed("malformed handshake message".into());
        let (&tag, body) = data.split_first().ok_or_else(malformed)?;
        match tag {
            MSG_REQUEST_ID if body.is_empty() => Ok(HandshakeMessage::RequestId),
            MSG_ID_RESPONSE => {
                let key_id = u64::from_le_bytes(body.try_into().map_err(|_| malformed())?);
                Ok(HandshakeMessage::IdResponse { key_id })
            }
            MSG_EPHEMERAL_PUBLIC => {
                let public = body.try_into().map_err(|_| malformed())?;
                Ok(HandshakeMessage::EphemeralPublic { public })
            }
            MSG_EPHEMERAL_RESPONSE => {
                let public = body.try_into().map_err(|_| malformed())?;
                Ok(HandshakeMessage::EphemeralResponse { public })
            }
            MSG_SESSION_ID => {
                let id = u64::from_le_bytes(body.try_into().map_err(|_| malformed())?);
                Ok(HandshakeMessage::SessionIdExchange { id })
            }
            _ => Err(SecurityError::HandshakeFailed(format!(
                "unknown handshake message 0x{tag:02x}"
            ))),
        }
    }
}

/// Derive the session key and session identifier.
///
/// `binding_secret` salts the KDF; `ephemeral_shared` is the ECDH output of
/// the two ephemeral keys.
pub fn derive_session(
    binding_secret: &[u8; 32],
    ephemeral_shared: &[u8; 32],
) -> Result<(SessionKey, u64), SecurityError> {
    let hk = Hkdf::<Sha256>::new(Some(binding_secret.as_slice()), ephemeral_shared);

    let mut key = [0u8; SESSION_KEY_SIZE];
    hk.expand(b"cpc session key", &mut key)
        .map_err(|_| SecurityError::HandshakeFailed("HKDF expand failed".into()))?;

    let mut id_bytes = [0u8; 8];
    hk.expand(b"cpc session id", &mut id_bytes)
        .map_err(|_| SecurityError::HandshakeFailed("HKDF expand failed".into()))?;

    Ok((SessionKey::from_bytes(key), u64::from_le_bytes(id_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeypair;

    #[test]
    fn test_message_roundtrip() {
        let messages = [
            HandshakeMessage::RequestId,
            HandshakeMessage::IdResponse { key_id: 0xDEAD_BEEF },
            HandshakeMessage::EphemeralPublic { public: [7u8; 32] },
            HandshakeMessage::EphemeralResponse { public: [9u8; 32] },
            HandshakeMessage::SessionIdExchange { id: 42 },
        ];
        for msg in messages {
            assert_eq!(HandshakeMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(HandshakeMessage::decode(&[]).is_err());
        assert!(HandshakeMessage::decode(&[0xFF]).is_err());
        // RequestId with trailing bytes
        assert!(HandshakeMessage::decode(&[MSG_REQUEST_ID, 0x00]).is_err());
        // Truncated public key
        assert!(HandshakeMessage::decode(&[MSG_EPHEMERAL_PUBLIC, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_both_sides_derive_same_session() {
        let binding = [0x11u8; 32];

        let host = EphemeralKeypair::generate();
        let secondary = EphemeralKeypair::generate();
        let host_pub = host.public();
        let sec_pub = secondary.public();

        let shared_host = host.diffie_hellman(&sec_pub);
        let shared_sec = secondary.diffie_hellman(&host_pub);

        let (key_h, id_h) = derive_session(&binding, &shared_host).unwrap();
        let (key_s, id_s) = derive_session(&binding, &shared_sec).unwrap();

        assert_eq!(key_h.as_bytes(), key_s.as_bytes());
        assert_eq!(id_h, id_s);
    }

    #[test]
    fn test_different_binding_different_key() {
        let shared = [0x55u8; 32];
        let (a, _) = derive_session(&[1u8; 32], &shared).unwrap();
        let (b, _) = derive_session(&[2u8; 32], &shared).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
