//! The security worker thread.
//!
//! One thread exclusively owns all key material: the binding key, the
//! in-flight ephemeral keypair, and the established session (key plus both
//! frame counters). The engine talks to it through a single-slot command
//! channel; every command carries a oneshot for its reply, so replies are
//! synchronous from the engine's point of view without ever blocking the
//! event loop on crypto work.

use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::core::{SecurityError, PUBLIC_KEY_SIZE};
use crate::crypto::aead::{open, seal, SessionKey};
use crate::crypto::handshake::derive_session;
use crate::crypto::keys::{BindingKey, EphemeralKeypair};
use crate::crypto::nonce::{construct_nonce, Direction, FrameCounter};

/// Commands accepted by the worker.
pub enum SecurityCommand {
    /// Start a fresh handshake: generate an ephemeral keypair.
    InitSession,
    /// Start a rekey of the current session: generate a new ephemeral.
    Rekey,
    /// Finish a handshake or rekey with the secondary's ephemeral public.
    Complete {
        /// The secondary's ephemeral public key.
        remote_public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Encrypt one I-frame payload.
    Encrypt {
        /// Endpoint the frame travels on.
        endpoint: u8,
        /// Final wire header (length includes the tag), used as AAD.
        header: [u8; 7],
        /// Plaintext payload.
        plaintext: Vec<u8>,
    },
    /// Decrypt one I-frame payload.
    Decrypt {
        /// Endpoint the frame arrived on.
        endpoint: u8,
        /// Received wire header, used as AAD.
        header: [u8; 7],
        /// Ciphertext with trailing tag.
        ciphertext: Vec<u8>,
    },
    /// Drop all session state (link reset).
    ResetSession,
    /// Jump the TX counter. Test scaffolding for exhaustion scenarios.
    #[doc(hidden)]
    ForceTxCounter(u64),
}

/// Replies produced by the worker.
#[derive(Debug)]
pub enum SecurityReply {
    /// Local ephemeral public key for an InitSession/Rekey.
    LocalPublic([u8; PUBLIC_KEY_SIZE]),
    /// Session established; carries the derived 64-bit session id.
    SessionReady(u64),
    /// Encrypted payload; `rekey_due` asks the engine to start a rekey.
    Encrypted {
        /// Ciphertext with trailing tag.
        ciphertext: Vec<u8>,
        /// The TX counter crossed the rekey threshold.
        rekey_due: bool,
    },
    /// Decrypted payload.
    Decrypted(Vec<u8>),
    /// Session state dropped, or counter forced.
    Done,
}

struct Request {
    cmd: SecurityCommand,
    reply: oneshot::Sender<Result<SecurityReply, SecurityError>>,
}

struct Session {
    key: SessionKey,
    id: u64,
    tx: FrameCounter,
    rx: FrameCounter,
}

struct Worker {
    binding: BindingKey,
    ephemeral: Option<EphemeralKeypair>,
    session: Option<Session>,
}

impl Worker {
    fn handle(&mut self, cmd: SecurityCommand) -> Result<SecurityReply, SecurityError> {
        match cmd {
            SecurityCommand::InitSession | SecurityCommand::Rekey => {
                let keypair = EphemeralKeypair::generate();
                let public = keypair.public();
                self.ephemeral = Some(keypair);
                Ok(SecurityReply::LocalPublic(public))
            }
            SecurityCommand::Complete { remote_public } => {
                let keypair = self
                    .ephemeral
                    .take()
                    .ok_or_else(|| SecurityError::HandshakeFailed("no handshake in flight".into()))?;
                let shared = keypair.diffie_hellman(&remote_public);
                let (key, id) = derive_session(self.binding.secret_bytes(), &shared)?;
                let sid = format!("{id:016x}");
                info!(session_id = %sid, "security session established");
                self.session = Some(Session {
                    key,
                    id,
                    tx: FrameCounter::new(),
                    rx: FrameCounter::new(),
                });
                Ok(SecurityReply::SessionReady(id))
            }
            SecurityCommand::Encrypt {
                endpoint,
                header,
                plaintext,
            } => {
                let session = self.session.as_mut().ok_or(SecurityError::NotInitialized)?;
                let counter = session.tx.next()?;
                let nonce = construct_nonce(endpoint, Direction::HostToSecondary, counter);
                let ciphertext = seal(&session.key, &nonce, &header, &plaintext)?;
                Ok(SecurityReply::Encrypted {
                    ciphertext,
                    rekey_due: session.tx.rekey_due(),
                })
            }
            SecurityCommand::Decrypt {
                endpoint,
                header,
                ciphertext,
            } => {
                let session = self.session.as_mut().ok_or(SecurityError::NotInitialized)?;
                let counter = session.rx.current();
                let nonce = construct_nonce(endpoint, Direction::SecondaryToHost, counter);
                let plaintext = open(&session.key, &nonce, &header, &ciphertext)?;
                // Advance only after the tag verified: a rejected frame is
                // retransmitted under the same nonce.
                let _ = session.rx.next()?;
                Ok(SecurityReply::Decrypted(plaintext))
            }
            SecurityCommand::ResetSession => {
                debug!("security session reset");
                self.ephemeral = None;
                self.session = None;
                Ok(SecurityReply::Done)
            }
            SecurityCommand::ForceTxCounter(value) => {
                let session = self.session.as_mut().ok_or(SecurityError::NotInitialized)?;
                session.tx.force(value);
                Ok(SecurityReply::Done)
            }
        }
    }
}

/// Handle through which the engine drives the security worker.
#[derive(Clone)]
pub struct SecurityHandle {
    tx: mpsc::SyncSender<Request>,
}

impl SecurityHandle {
    /// Spawn the worker thread owning `binding`.
    pub fn spawn(binding: BindingKey) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Request>(1);
        thread::Builder::new()
            .name("cpc-security".into())
            .spawn(move || {
                let mut worker = Worker {
                    binding,
                    ephemeral: None,
                    session: None,
                };
                while let Ok(request) = rx.recv() {
                    let result = worker.handle(request.cmd);
                    let _ = request.reply.send(result);
                }
            })
            .expect("failed to spawn security worker");
        Self { tx }
    }

    /// Issue one command and await its reply.
    pub async fn call(&self, cmd: SecurityCommand) -> Result<SecurityReply, SecurityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request {
                cmd,
                reply: reply_tx,
            })
            .map_err(|_| SecurityError::WorkerGone)?;
        reply_rx.await.map_err(|_| SecurityError::WorkerGone)?
    }

    /// Start a handshake, returning the local ephemeral public key.
    pub async fn init_session(&self) -> Result<[u8; PUBLIC_KEY_SIZE], SecurityError> {
        match self.call(SecurityCommand::InitSession).await? {
            SecurityReply::LocalPublic(public) => Ok(public),
            _ => Err(SecurityError::WorkerGone),
        }
    }

    /// Start a rekey, returning the new local ephemeral public key.
    pub async fn rekey(&self) -> Result<[u8; PUBLIC_KEY_SIZE], SecurityError> {
        match self.call(SecurityCommand::Rekey).await? {
            SecurityReply::LocalPublic(public) => Ok(public),
            _ => Err(SecurityError::WorkerGone),
        }
    }

    /// Finish the exchange; returns the derived session id.
    pub async fn complete(
        &self,
        remote_public: [u8; PUBLIC_KEY_SIZE],
    ) -> Result<u64, SecurityError> {
        match self.call(SecurityCommand::Complete { remote_public }).await? {
            SecurityReply::SessionReady(id) => Ok(id),
            _ => Err(SecurityError::WorkerGone),
        }
    }

    /// Encrypt a payload; the boolean asks for a rekey when true.
    pub async fn encrypt(
        &self,
        endpoint: u8,
        header: [u8; 7],
        plaintext: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), SecurityError> {
        match self
            .call(SecurityCommand::Encrypt {
                endpoint,
                header,
                plaintext,
            })
            .await?
        {
            SecurityReply::Encrypted {
                ciphertext,
                rekey_due,
            } => Ok((ciphertext, rekey_due)),
            _ => Err(SecurityError::WorkerGone),
        }
    }

    /// Decrypt a payload received on `endpoint`.
    pub async fn decrypt(
        &self,
        endpoint: u8,
        header: [u8; 7],
        ciphertext: Vec<u8>,
    ) -> Result<Vec<u8>, SecurityError> {
        match self
            .call(SecurityCommand::Decrypt {
                endpoint,
                header,
                ciphertext,
            })
            .await?
        {
            SecurityReply::Decrypted(plaintext) => Ok(plaintext),
            _ => Err(SecurityError::WorkerGone),
        }
    }

    /// Drop all session state.
    pub async fn reset_session(&self) -> Result<(), SecurityError> {
        self.call(SecurityCommand::ResetSession).await?;
        Ok(())
    }

    /// Jump the TX counter. Test scaffolding for exhaustion scenarios.
    #[doc(hidden)]
    pub async fn force_tx_counter(&self, value: u64) -> Result<(), SecurityError> {
        self.call(SecurityCommand::ForceTxCounter(value)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::REKEY_THRESHOLD;
    use crate::crypto::keys::EphemeralKeypair;

    /// Stand-in for the secondary's side of the handshake.
    fn secondary_complete(
        binding: &BindingKey,
        host_public: [u8; 32],
    ) -> (SessionKey, u64, [u8; 32]) {
        let eph = EphemeralKeypair::generate();
        let public = eph.public();
        let shared = eph.diffie_hellman(&host_public);
        let (key, id) = derive_session(binding.secret_bytes(), &shared).unwrap();
        (key, id, public)
    }

    #[tokio::test]
    async fn test_full_handshake_and_roundtrip() {
        let binding = BindingKey::generate();
        let binding_copy = BindingKey::from_bytes(*binding.secret_bytes());
        let handle = SecurityHandle::spawn(binding);

        let host_public = handle.init_session().await.unwrap();
        let (sec_key, sec_id, sec_public) = secondary_complete(&binding_copy, host_public);
        let session_id = handle.complete(sec_public).await.unwrap();
        assert_eq!(session_id, sec_id);

        // Host encrypts, "secondary" decrypts with its derived key.
        let header = [0x14, 0x05, 0x14, 0x00, 0x40, 0x00, 0x00];
        let (ct, rekey_due) = handle.encrypt(5, header, b"hello".to_vec()).await.unwrap();
        assert!(!rekey_due);

        let nonce = construct_nonce(5, Direction::HostToSecondary, 0);
        let pt = open(&sec_key, &nonce, &header, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[tokio::test]
    async fn test_encrypt_before_handshake_fails() {
        let handle = SecurityHandle::spawn(BindingKey::generate());
        let err = handle.encrypt(5, [0u8; 7], b"x".to_vec()).await;
        assert!(matches!(err, Err(SecurityError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_decrypt_tag_mismatch_does_not_advance_counter() {
        let binding = BindingKey::generate();
        let binding_copy = BindingKey::from_bytes(*binding.secret_bytes());
        let handle = SecurityHandle::spawn(binding);

        let host_public = handle.init_session().await.unwrap();
        let (sec_key, _, sec_public) = secondary_complete(&binding_copy, host_public);
        handle.complete(sec_public).await.unwrap();

        let header = [0x14, 0x03, 0x14, 0x00, 0x00, 0x00, 0x00];
        let nonce = construct_nonce(3, Direction::SecondaryToHost, 0);
        let good = seal(&sec_key, &nonce, &header, b"data").unwrap();

        let mut bad = good.clone();
        bad[0] ^= 0xFF;
        assert!(handle.decrypt(3, header, bad).await.is_err());

        // Counter did not advance: the intact ciphertext still decrypts.
        let pt = handle.decrypt(3, header, good).await.unwrap();
        assert_eq!(pt, b"data");
    }

    #[tokio::test]
    async fn test_rekey_due_at_threshold() {
        let binding = BindingKey::generate();
        let binding_copy = BindingKey::from_bytes(*binding.secret_bytes());
        let handle = SecurityHandle::spawn(binding);

        let host_public = handle.init_session().await.unwrap();
        let (_, _, sec_public) = secondary_complete(&binding_copy, host_public);
        handle.complete(sec_public).await.unwrap();

        handle.force_tx_counter(REKEY_THRESHOLD - 1).await.unwrap();
        let (_, rekey_due) = handle.encrypt(5, [0u8; 7], vec![1]).await.unwrap();
        assert!(rekey_due);

        // A rekey installs a fresh key and resets the counters.
        let new_public = handle.rekey().await.unwrap();
        let (_, _, sec_public2) = secondary_complete(&binding_copy, new_public);
        handle.complete(sec_public2).await.unwrap();
        let (_, rekey_due) = handle.encrypt(5, [0u8; 7], vec![2]).await.unwrap();
        assert!(!rekey_due);
    }
}
