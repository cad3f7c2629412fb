//! In-process duplex driver.
//!
//! Stands in for the serial device in tests and loopback tooling: one end
//! goes to the engine, the other plays the secondary.

use tokio::io::DuplexStream;

/// One end of an in-process link.
pub type PipeDriver = DuplexStream;

/// Create a connected pair of byte pipes.
pub fn pipe_driver() -> (PipeDriver, PipeDriver) {
    tokio::io::duplex(64 * 1024)
}
