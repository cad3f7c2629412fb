//! Per-endpoint state.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::{INCIDENT_THRESHOLD, INCIDENT_WINDOW, SEQ_MOD};
use crate::engine::retransmit::RetransmitQueue;
use crate::engine::timer::TimerId;

/// Why an endpoint ended in the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// The peer reported an error on its side of the endpoint.
    RemoteError,
    /// Repeated AEAD authentication failures.
    SecurityIncident,
    /// A control-plane endpoint exhausted its retransmissions.
    FaultNoAck,
    /// The peer endpoint was not open when we tried to reach it.
    DestUnreach,
}

/// Lifecycle state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Not in use.
    Closed,
    /// Traffic may flow.
    Open,
    /// Local close in progress, waiting for the peer's U-Ack.
    Closing,
    /// A user endpoint gave up after retry exhaustion or link loss.
    ConnectionLost,
    /// Terminal error; not reopened automatically.
    Error(FaultReason),
}

impl EndpointState {
    /// Wire code reported to clients and in endpoint-state properties.
    pub fn code(self) -> u8 {
        match self {
            EndpointState::Closed => 0,
            EndpointState::Open => 1,
            EndpointState::Closing => 2,
            EndpointState::ConnectionLost => 3,
            EndpointState::Error(FaultReason::RemoteError) => 4,
            EndpointState::Error(FaultReason::SecurityIncident) => 5,
            EndpointState::Error(FaultReason::FaultNoAck) => 6,
            EndpointState::Error(FaultReason::DestUnreach) => 7,
        }
    }

    /// Short name for diagnostics and errors.
    pub fn name(self) -> &'static str {
        match self {
            EndpointState::Closed => "closed",
            EndpointState::Open => "open",
            EndpointState::Closing => "closing",
            EndpointState::ConnectionLost => "connection-lost",
            EndpointState::Error(_) => "error",
        }
    }
}

/// State for one endpoint id, owned exclusively by the engine.
pub struct Endpoint {
    /// Endpoint id (also the frame address).
    pub id: u8,
    /// Lifecycle state.
    pub state: EndpointState,
    /// TX window size.
    pub tx_window: u8,
    /// Next TX sequence number (mod 8).
    pub seq: u8,
    /// Next RX sequence number we expect; also our outbound ack value.
    pub expected_rx: u8,
    /// Unacked I-frames.
    pub retransmit: RetransmitQueue,
    /// Writes waiting for window room or session readiness.
    pub pending_writes: VecDeque<Vec<u8>>,
    /// Armed retransmit timer, present iff the retransmit queue is nonempty.
    pub retransmit_timer: Option<TimerId>,
    /// Armed delayed-ack timer.
    pub ack_timer: Option<TimerId>,
    /// Delivery channel to the connected client, if any.
    pub sink: Option<mpsc::UnboundedSender<Bytes>>,
    /// Payloads on this endpoint are AEAD-protected.
    pub encrypted: bool,
    /// A locally sent U-Reset awaits the peer's U-Ack.
    pub awaiting_uack: bool,
    /// Recent AEAD authentication failures.
    incidents: VecDeque<Instant>,
}

impl Endpoint {
    /// Fresh closed endpoint.
    pub fn new(id: u8, tx_window: u8, encrypted: bool) -> Self {
        Self {
            id,
            state: EndpointState::Closed,
            tx_window,
            seq: 0,
            expected_rx: 0,
            retransmit: RetransmitQueue::new(),
            pending_writes: VecDeque::new(),
            retransmit_timer: None,
            ack_timer: None,
            sink: None,
            encrypted,
            awaiting_uack: false,
            incidents: VecDeque::new(),
        }
    }

    /// Window room left for new I-frames.
    pub fn can_send(&self) -> bool {
        self.retransmit.len() < self.tx_window as usize
    }

    /// Reset sequence numbers and in-flight traffic (open / peer reset).
    pub fn reset_sequencing(&mut self) {
        self.seq = 0;
        self.expected_rx = 0;
        self.retransmit.clear();
    }

    /// Advance the next TX sequence number, returning the one to use now.
    pub fn take_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = (self.seq + 1) % SEQ_MOD;
        seq
    }

    /// Record an AEAD authentication failure.
    ///
    /// Returns true when the incident threshold has been crossed and the
    /// endpoint must transition to a security-incident error.
    pub fn record_incident(&mut self, now: Instant) -> bool {
        self.incidents.push_back(now);
        while let Some(&front) = self.incidents.front() {
            if now.duration_since(front) > INCIDENT_WINDOW {
                self.incidents.pop_front();
            } else {
                break;
            }
        }
        self.incidents.len() >= INCIDENT_THRESHOLD
    }
}
