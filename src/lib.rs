//! # CPC daemon
//!
//! Multiplexes many logical byte-stream channels ("endpoints") between host
//! applications and a wireless co-processor (the "secondary") over a single
//! serial link. The daemon performs HDLC-style framing with CRC-16, a
//! sliding-window ARQ with retransmission and reject, endpoint
//! open/close/reset handshakes, optional authenticated encryption of
//! payloads, and the host-facing unix-socket surface.
//!
//! ## Modules
//!
//! - [`core`]: protocol constants and error types
//! - [`link`]: frame model, CRC-16, streaming decoder
//! - [`driver`]: byte transports (UART, in-process pipe)
//! - [`engine`]: endpoint state machines, ARQ, event loop
//! - [`crypto`]: session handshake, AEAD, security worker
//! - [`system`]: system endpoint property protocol
//! - [`server`]: host-facing control and data sockets
//! - [`client`]: library for host applications
//!
//! ## Daemon wiring
//!
//! ```ignore
//! let driver = driver::open_uart(&cfg.uart_device, cfg.uart_baudrate, cfg.uart_hardflow)?;
//! let security = SecurityHandle::spawn(BindingKey::load(&key_path)?);
//! let (engine, handle, notices) = Engine::new(driver, engine_cfg, Some(security));
//! tokio::spawn(server::run(handle, notices, server_cfg));
//! engine.run().await?;
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod core;
pub mod crypto;
pub mod driver;
pub mod engine;
pub mod link;
pub mod logging;
pub mod server;
pub mod system;

pub use config::{Bus, Config};
pub use core::{EngineError, Error, SecurityError};
pub use engine::{Engine, EngineConfig, EngineHandle, EngineNotice};
