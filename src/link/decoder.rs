//! Streaming frame decoder.
//!
//! Consumes a raw byte stream from the driver and emits validated frames,
//! corrupt-payload markers (header intact, payload CRC bad, so the engine can
//! REJ instead of timing out) and garbage accounting for discarded bytes.

use bytes::{Buf, BytesMut};

use crate::core::{CRC_SIZE, FLAG_BYTE, HEADER_CRC_SPAN, HEADER_SIZE};
use crate::link::crc::crc16;
use crate::link::frame::{Control, Frame, FrameHeader};

/// One decoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A fully validated frame.
    Frame(Frame),
    /// Header CRC validated but the payload CRC did not. The payload is
    /// dropped; the header tells the engine which endpoint to REJ.
    CorruptPayload {
        /// The validated header of the corrupt frame.
        header: FrameHeader,
    },
    /// Bytes discarded while hunting for a valid header.
    Garbage {
        /// Number of bytes thrown away.
        discarded: usize,
    },
}

/// Incremental decoder over a bounded reassembly buffer.
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    discarded: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given payload MTU.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_payload,
            discarded: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        loop {
            // Resync: hunt for the flag byte.
            while !self.buf.is_empty() && self.buf[0] != FLAG_BYTE {
                self.buf.advance(1);
                self.discarded += 1;
            }

            if self.buf.len() < HEADER_SIZE {
                return self.take_garbage();
            }

            let header_crc = u16::from_le_bytes([self.buf[5], self.buf[6]]);
            if crc16(&self.buf[..HEADER_CRC_SPAN]) != header_crc {
                // Header corrupt: drop it whole and resync behind it.
                self.buf.advance(HEADER_SIZE);
                self.discarded += HEADER_SIZE;
                continue;
            }

            let length = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            if length > self.max_payload {
                self.buf.advance(HEADER_SIZE);
                self.discarded += HEADER_SIZE;
                continue;
            }

            let Some(control) = Control::from_byte(self.buf[4]) else {
                // Valid CRC over an undefined control encoding: not our frame.
                self.buf.advance(HEADER_SIZE);
                self.discarded += HEADER_SIZE;
                continue;
            };

            let total = if length > 0 {
                HEADER_SIZE + length + CRC_SIZE
            } else {
                HEADER_SIZE
            };
            if self.buf.len() < total {
                return self.take_garbage();
            }

            // Surface accumulated garbage before the frame itself.
            if self.discarded > 0 {
                return self.take_garbage();
            }

            let header = FrameHeader {
                address: self.buf[1],
                length: length as u16,
                control,
            };

            if length == 0 {
                self.buf.advance(HEADER_SIZE);
                return Some(DecodeEvent::Frame(Frame {
                    address: header.address,
                    control,
                    payload: Vec::new(),
                }));
            }

            let payload_crc = u16::from_le_bytes([
                self.buf[HEADER_SIZE + length],
                self.buf[HEADER_SIZE + length + 1],
            ]);
            let payload_ok = crc16(&self.buf[HEADER_SIZE..HEADER_SIZE + length]) == payload_crc;

            if !payload_ok {
                self.buf.advance(total);
                return Some(DecodeEvent::CorruptPayload { header });
            }

            let payload = self.buf[HEADER_SIZE..HEADER_SIZE + length].to_vec();
            self.buf.advance(total);
            return Some(DecodeEvent::Frame(Frame {
                address: header.address,
                control,
                payload,
            }));
        }
    }

    fn take_garbage(&mut self) -> Option<DecodeEvent> {
        if self.discarded > 0 {
            let discarded = std::mem::take(&mut self.discarded);
            Some(DecodeEvent::Garbage { discarded })
        } else {
            None
        }
    }
}
