//! Error types for the CPC daemon.

use thiserror::Error;

/// Errors in the security layer.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Handshake with the secondary failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD tag did not verify. Treated as a security incident.
    #[error("AEAD authentication failed")]
    AuthenticationFailed,

    /// Frame counter reached its 29-bit limit before a rekey completed.
    #[error("frame counter exhausted - rekey required")]
    CounterExhausted,

    /// An operation required an established session.
    #[error("security session not initialized")]
    NotInitialized,

    /// The binding key file is missing or unusable.
    #[error("binding key unavailable: {0}")]
    BindingKey(String),

    /// The security worker is gone.
    #[error("security worker terminated")]
    WorkerGone,
}

/// Errors in the protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The endpoint id cannot be used by clients.
    #[error("endpoint {0} is reserved")]
    ReservedEndpoint(u8),

    /// The endpoint is not in a state that allows the operation.
    #[error("endpoint {id} is {state}")]
    BadState {
        /// Endpoint id.
        id: u8,
        /// Human-readable state name.
        state: &'static str,
    },

    /// Another client already owns the endpoint.
    #[error("endpoint {0} already connected")]
    AlreadyConnected(u8),

    /// Write rejected because the security session is not established yet.
    /// The caller may retry once the session reports Initialized.
    #[error("security session not ready, retry later")]
    SessionNotReady,

    /// Payload exceeds what fits in a single frame.
    #[error("payload of {0} bytes exceeds the maximum write size")]
    PayloadTooLarge(usize),

    /// The engine task is gone.
    #[error("engine terminated")]
    EngineGone,
}

/// Top-level daemon errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Security layer error.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Frame encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] crate::link::FrameError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
