//! Protocol constants for the CPC link layer and daemon.
//!
//! These values are fixed by the wire protocol shared with the secondary
//! and MUST NOT be changed independently of its firmware.

use std::time::Duration;

// =============================================================================
// FRAMING
// =============================================================================

/// Start-of-header flag byte. Every frame begins with it.
pub const FLAG_BYTE: u8 = 0x14;

/// Fixed header size: flag + address + length(2) + control + header CRC(2).
pub const HEADER_SIZE: usize = 7;

/// Number of leading header bytes covered by the header CRC.
pub const HEADER_CRC_SPAN: usize = 5;

/// Size of a CRC-16 field on the wire.
pub const CRC_SIZE: usize = 2;

/// Maximum payload carried by a single frame (the MTU of the link).
pub const MAX_PAYLOAD_SIZE: usize = 4087;

// =============================================================================
// ENDPOINT ADDRESSING
// =============================================================================

/// System endpoint: control plane (properties, reset notifications).
pub const EP_SYSTEM: u8 = 0;

/// Security endpoint: session handshake traffic. Not openable by clients.
pub const EP_SECURITY: u8 = 14;

/// Reserved endpoint id. Never opened.
pub const EP_RESERVED: u8 = 15;

/// Size of the dense endpoint table (8-bit address space).
pub const ENDPOINT_COUNT: usize = 256;

// =============================================================================
// ARQ
// =============================================================================

/// Sequence numbers are taken modulo this value.
pub const SEQ_MOD: u8 = 8;

/// Largest TX window the protocol allows.
pub const MAX_WINDOW: u8 = 7;

/// Default TX window size.
pub const DEFAULT_WINDOW: u8 = 1;

/// Initial retransmission timeout.
pub const RTO_INITIAL: Duration = Duration::from_millis(100);

/// Cap for the exponential RTO backoff.
pub const RTO_MAX: Duration = Duration::from_secs(5);

/// Retransmissions of one frame before the endpoint faults.
pub const MAX_RETRIES: u32 = 5;

/// Delay before a standalone RR is sent to ack received data.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(50);

// =============================================================================
// ERROR POLICY
// =============================================================================

/// Protocol violations tolerated inside [`VIOLATION_WINDOW`] before the
/// daemon forces a link reset.
pub const VIOLATION_THRESHOLD: usize = 10;

/// Sliding window for counting protocol violations.
pub const VIOLATION_WINDOW: Duration = Duration::from_secs(1);

/// Authentication failures tolerated inside [`INCIDENT_WINDOW`] before an
/// endpoint is closed with a security incident.
pub const INCIDENT_THRESHOLD: usize = 3;

/// Sliding window for counting security incidents.
pub const INCIDENT_WINDOW: Duration = Duration::from_secs(30);

/// How long shutdown waits for U-Acks after sending U-Reset everywhere.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// SECURITY
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Session key size (ChaCha20 key).
pub const SESSION_KEY_SIZE: usize = 32;

/// Frame counters are 29-bit; this is one past the largest usable value.
pub const FRAME_COUNTER_LIMIT: u64 = 1 << 29;

/// TX counter value at which a rekey is scheduled.
pub const REKEY_THRESHOLD: u64 = FRAME_COUNTER_LIMIT - 8;

// =============================================================================
// HOST INTERFACE
// =============================================================================

/// Version byte of the library <-> daemon socket protocol.
pub const LIBRARY_API_VERSION: u8 = 3;

/// Largest user payload accepted on an endpoint socket. Matches what fits
/// in one frame; encrypted endpoints lose [`AEAD_TAG_SIZE`] of it to the tag.
pub const MAX_WRITE_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Default daemon instance name, used in socket paths.
pub const DEFAULT_INSTANCE_NAME: &str = "cpcd_0";

/// Default directory under which per-instance socket directories live.
pub const DEFAULT_SOCKET_FOLDER: &str = "/dev/shm";
