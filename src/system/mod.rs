//! System endpoint (id 0) bookkeeping.
//!
//! The engine owns the conversation with the secondary's control plane:
//! reliable property queries ride I-frames, fire-and-forget notifications
//! ride U-Information frames. This module tracks outstanding queries by
//! their command sequence number and drives the startup discovery ladder.

mod property;

use std::collections::HashMap;

use tokio::sync::oneshot;

pub use property::{PropertyId, SystemCommand, SystemError};

/// Host link protocol version, checked against the secondary at discovery.
pub const PROTOCOL_VERSION: u32 = 5;

/// Steps of the startup discovery ladder, run in order after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    /// Verify the link protocol version.
    ProtocolVersion,
    /// Read the capability bitmask.
    Capabilities,
    /// Read the secondary's maximum RX payload.
    RxCapability,
}

impl DiscoveryStep {
    /// The property this step reads.
    pub fn property(self) -> PropertyId {
        match self {
            DiscoveryStep::ProtocolVersion => PropertyId::ProtocolVersion,
            DiscoveryStep::Capabilities => PropertyId::Capabilities,
            DiscoveryStep::RxCapability => PropertyId::RxCapability,
        }
    }

    /// The step after this one, or `None` when discovery is complete.
    pub fn next(self) -> Option<Self> {
        match self {
            DiscoveryStep::ProtocolVersion => Some(DiscoveryStep::Capabilities),
            DiscoveryStep::Capabilities => Some(DiscoveryStep::RxCapability),
            DiscoveryStep::RxCapability => None,
        }
    }
}

/// What a pending property query is for.
pub enum PendingQuery {
    /// Open-endpoint gate: is the peer endpoint open?
    EndpointOpenCheck {
        /// Endpoint being opened locally.
        endpoint: u8,
        /// Reply channel back to the control socket.
        reply: oneshot::Sender<bool>,
    },
    /// One rung of the startup discovery ladder.
    Discovery(DiscoveryStep),
}

/// Outstanding system-endpoint queries, keyed by command sequence number.
pub struct SystemChannel {
    next_seq: u8,
    pending: HashMap<u8, PendingQuery>,
}

impl SystemChannel {
    /// Empty channel.
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            pending: HashMap::new(),
        }
    }

    /// Build a PropertyGet for `prop` and remember what it is for.
    pub fn issue(&mut self, prop: PropertyId, query: PendingQuery) -> SystemCommand {
        let seq = self.next_seq;
        // seq 0 is reserved for unsolicited notifications
        self.next_seq = self.next_seq.checked_add(1).unwrap_or(1);
        self.pending.insert(seq, query);
        SystemCommand::PropertyGet { seq, prop }
    }

    /// Claim the pending query a PropertyIs reply answers.
    pub fn take(&mut self, seq: u8) -> Option<PendingQuery> {
        self.pending.remove(&seq)
    }

    /// Drop all pending queries (link reset). Open checks resolve to false.
    pub fn clear(&mut self) {
        for (_, query) in self.pending.drain() {
            if let PendingQuery::EndpointOpenCheck { reply, .. } = query {
                let _ = reply.send(false);
            }
        }
    }
}

impl Default for SystemChannel {
    fn default() -> Self {
        Self::new()
    }
}
