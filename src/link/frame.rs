//! Frame model and encoder for the CPC link layer.
//!
//! Every frame starts with a fixed 7-byte header:
//!
//! ```text
//! +--------+---------+-------------+---------+----------------+
//! | Flag   | Address | Length      | Control | Header CRC     |
//! | 0x14   | 1 byte  | 2 bytes LE  | 1 byte  | 2 bytes LE     |
//! +--------+---------+-------------+---------+----------------+
//! ```
//!
//! When `length > 0` the header is followed by the payload and a 2-byte
//! little-endian payload CRC. Both CRCs are CRC-16-CCITT (see [`crate::link::crc`]).
//!
//! Control byte layouts:
//!
//! ```text
//! I-frame:  0 s s s p a a a    seq (3), poll, ack (3)
//! S-frame:  1 0 f f p a a a    func (2: RR=0 REJ=1), poll, ack (3)
//! U-frame:  1 1 f f f f p 0    func (4), poll, reserved
//! ```

use thiserror::Error;

use crate::core::{
    CRC_SIZE, FLAG_BYTE, HEADER_CRC_SPAN, HEADER_SIZE, MAX_PAYLOAD_SIZE, SEQ_MOD,
};
use crate::link::crc::crc16;

/// Supervisory frame functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisoryFunction {
    /// Receiver Ready: acks everything before the carried ack value.
    ReceiveReady = 0b00,
    /// Reject: asks the peer to retransmit starting at the carried ack value.
    Reject = 0b01,
}

/// Unnumbered frame functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnnumberedFunction {
    /// One-shot payload outside the ARQ. System endpoint only.
    Information = 0b0000,
    /// Solicits an immediate response from the peer.
    PollFinal = 0b0001,
    /// Requests a reset of the addressed endpoint.
    Reset = 0b0010,
    /// Acknowledges a received Reset.
    Ack = 0b0011,
}

impl UnnumberedFunction {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0000 => Some(Self::Information),
            0b0001 => Some(Self::PollFinal),
            0b0010 => Some(Self::Reset),
            0b0011 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Decoded control field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Numbered information frame carrying user payload.
    Information {
        /// TX sequence number of this frame (mod 8).
        seq: u8,
        /// Next sequence number the sender expects to receive.
        ack: u8,
        /// Poll bit: sender requests an immediate ack.
        poll: bool,
    },
    /// Supervisory frame carrying only ack information.
    Supervisory {
        /// RR or REJ.
        func: SupervisoryFunction,
        /// Next sequence number the sender expects to receive.
        ack: u8,
        /// Poll bit.
        poll: bool,
    },
    /// Unnumbered frame for session control, outside the ARQ.
    Unnumbered {
        /// Frame function.
        func: UnnumberedFunction,
        /// Poll bit.
        poll: bool,
    },
}

impl Control {
    /// Pack the control field into its wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            Control::Information { seq, ack, poll } => {
                ((seq % SEQ_MOD) << 4) | (u8::from(poll) << 3) | (ack % SEQ_MOD)
            }
            Control::Supervisory { func, ack, poll } => {
                0b1000_0000 | ((func as u8) << 4) | (u8::from(poll) << 3) | (ack % SEQ_MOD)
            }
            Control::Unnumbered { func, poll } => {
                0b1100_0000 | ((func as u8) << 2) | (u8::from(poll) << 1)
            }
        }
    }

    /// Unpack a wire control byte.
    ///
    /// Returns `None` for encodings the protocol does not define
    /// (unknown U-frame function, nonzero reserved bits).
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0b1000_0000 == 0 {
            Some(Control::Information {
                seq: (byte >> 4) & 0b111,
                ack: byte & 0b111,
                poll: byte & 0b1000 != 0,
            })
        } else if byte & 0b0100_0000 == 0 {
            let func = match (byte >> 4) & 0b11 {
                0b00 => SupervisoryFunction::ReceiveReady,
                0b01 => SupervisoryFunction::Reject,
                _ => return None,
            };
            Some(Control::Supervisory {
                func,
                ack: byte & 0b111,
                poll: byte & 0b1000 != 0,
            })
        } else {
            if byte & 0b0000_0001 != 0 {
                return None;
            }
            let func = UnnumberedFunction::from_bits((byte >> 2) & 0b1111)?;
            Some(Control::Unnumbered {
                func,
                poll: byte & 0b10 != 0,
            })
        }
    }

    /// The ack value piggybacked on this frame, if the frame type carries one.
    pub fn ack(self) -> Option<u8> {
        match self {
            Control::Information { ack, .. } | Control::Supervisory { ack, .. } => Some(ack),
            Control::Unnumbered { .. } => None,
        }
    }
}

/// Validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Endpoint address.
    pub address: u8,
    /// Payload length in bytes, including the AEAD tag on encrypted frames.
    pub length: u16,
    /// Decoded control field.
    pub control: Control,
}

impl FrameHeader {
    /// Serialize the header, computing the header CRC.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = FLAG_BYTE;
        buf[1] = self.address;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = self.control.to_byte();
        let crc = crc16(&buf[..HEADER_CRC_SPAN]);
        buf[5..7].copy_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// A complete link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Endpoint address.
    pub address: u8,
    /// Control field.
    pub control: Control,
    /// Payload bytes. Empty for pure supervisory/unnumbered frames.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build an I-frame.
    pub fn information(address: u8, seq: u8, ack: u8, poll: bool, payload: Vec<u8>) -> Self {
        Self {
            address,
            control: Control::Information { seq, ack, poll },
            payload,
        }
    }

    /// Build a supervisory frame (no payload).
    pub fn supervisory(address: u8, func: SupervisoryFunction, ack: u8) -> Self {
        Self {
            address,
            control: Control::Supervisory {
                func,
                ack,
                poll: false,
            },
            payload: Vec::new(),
        }
    }

    /// Build an unnumbered frame.
    pub fn unnumbered(address: u8, func: UnnumberedFunction, payload: Vec<u8>) -> Self {
        Self {
            address,
            control: Control::Unnumbered { func, poll: false },
            payload,
        }
    }

    /// The header this frame serializes with.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            address: self.address,
            length: self.payload.len() as u16,
            control: self.control,
        }
    }

    /// Serialize the frame into a contiguous buffer.
    ///
    /// Fails only when the payload exceeds the link MTU.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);
        buf.extend_from_slice(&self.header().to_bytes());
        if !self.payload.is_empty() {
            buf.extend_from_slice(&self.payload);
            let crc = crc16(&self.payload);
            buf.extend_from_slice(&crc.to_le_bytes());
        }
        Ok(buf)
    }
}

/// Errors raised while building frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds the link MTU.
    #[error("payload of {0} bytes exceeds the link MTU")]
    PayloadTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip_information() {
        for seq in 0..8 {
            for ack in 0..8 {
                for poll in [false, true] {
                    let c = Control::Information { seq, ack, poll };
                    assert_eq!(Control::from_byte(c.to_byte()), Some(c));
                }
            }
        }
    }

    #[test]
    fn test_control_roundtrip_supervisory() {
        for func in [SupervisoryFunction::ReceiveReady, SupervisoryFunction::Reject] {
            let c = Control::Supervisory {
                func,
                ack: 5,
                poll: true,
            };
            assert_eq!(Control::from_byte(c.to_byte()), Some(c));
        }
    }

    #[test]
    fn test_control_roundtrip_unnumbered() {
        for func in [
            UnnumberedFunction::Information,
            UnnumberedFunction::PollFinal,
            UnnumberedFunction::Reset,
            UnnumberedFunction::Ack,
        ] {
            let c = Control::Unnumbered { func, poll: false };
            assert_eq!(Control::from_byte(c.to_byte()), Some(c));
        }
    }

    #[test]
    fn test_control_rejects_reserved_bits() {
        // U-frame with reserved bit 0 set.
        assert_eq!(Control::from_byte(0b1100_0001), None);
        // U-frame with undefined function bits.
        assert_eq!(Control::from_byte(0b1111_0000), None);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::information(3, 2, 1, true, b"ping".to_vec());
        let bytes = frame.encode().unwrap();

        assert_eq!(bytes[0], FLAG_BYTE);
        assert_eq!(bytes[1], 3);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 4);
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + CRC_SIZE);

        // Header CRC validates over the first five bytes.
        let crc = u16::from_le_bytes([bytes[5], bytes[6]]);
        assert_eq!(crc, crc16(&bytes[..HEADER_CRC_SPAN]));
    }

    #[test]
    fn test_payload_crc_absent_when_empty() {
        let frame = Frame::supervisory(1, SupervisoryFunction::ReceiveReady, 0);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let frame = Frame::information(1, 0, 0, false, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert_eq!(
            frame.encode(),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }
}
