//! Security layer: session key exchange, per-frame AEAD, nonce management.
//!
//! All key material lives on the worker thread ([`SecurityHandle::spawn`]);
//! the engine only tracks the session state mirror to gate writes.

mod aead;
mod handshake;
mod keys;
mod nonce;
mod worker;

pub use aead::{open, seal, SessionKey};
pub use handshake::{derive_session, HandshakeMessage};
pub use keys::{BindingKey, EphemeralKeypair};
pub use nonce::{construct_nonce, Direction, FrameCounter};
pub use worker::{SecurityCommand, SecurityHandle, SecurityReply};

/// Lifecycle of the authenticated-encryption session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; encrypted endpoints refuse traffic.
    NotReady,
    /// Handshake in flight.
    Initializing,
    /// Session established; encrypted traffic may flow.
    Initialized,
    /// Rekey in flight; writes are backpressured until it completes.
    Resetting,
}
