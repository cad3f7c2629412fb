//! Link layer: HDLC-style framing with CRC-16.

pub mod crc;
mod decoder;
mod frame;

pub use decoder::{DecodeEvent, FrameDecoder};
pub use frame::{
    Control, Frame, FrameError, FrameHeader, SupervisoryFunction, UnnumberedFunction,
};
