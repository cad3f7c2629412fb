//! Byte transport between the engine and the physical link.
//!
//! The engine is generic over anything that can move bytes: a UART, or an
//! in-process pipe when testing. SPI would slot in at the same seam; its
//! GPIO bring-up is outside the daemon's scope.

mod pipe;
mod uart;

use tokio::io::{AsyncRead, AsyncWrite};

pub use pipe::{pipe_driver, PipeDriver};
pub use uart::open_uart;

/// A byte-oriented link transport.
///
/// Blanket-implemented for every async byte stream; the engine performs all
/// framing above this seam.
pub trait Driver: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Driver for T {}
