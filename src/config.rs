//! Daemon configuration.

use std::path::PathBuf;

use crate::core::{Error, DEFAULT_INSTANCE_NAME, DEFAULT_SOCKET_FOLDER, DEFAULT_WINDOW, MAX_WINDOW};

/// Which physical bus carries the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    /// Serial UART.
    Uart,
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance name; namespaces the socket directory.
    pub instance: String,
    /// Directory under which per-instance sockets live.
    pub socket_dir: PathBuf,
    /// Physical bus.
    pub bus: Bus,
    /// UART device path.
    pub uart_device: String,
    /// UART baud rate.
    pub uart_baudrate: u32,
    /// UART hardware flow control.
    pub uart_hardflow: bool,
    /// Encrypt user endpoint traffic.
    pub use_encryption: bool,
    /// Path of the binding key file; required when encryption is on.
    pub binding_key_file: Option<PathBuf>,
    /// TX window applied to user endpoints.
    pub tx_window: u8,
    /// Run the reset/discovery sequence against the secondary at startup.
    pub reset_sequence: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE_NAME.into(),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_FOLDER),
            bus: Bus::Uart,
            uart_device: "/dev/ttyACM0".into(),
            uart_baudrate: 115_200,
            uart_hardflow: false,
            use_encryption: false,
            binding_key_file: None,
            tx_window: DEFAULT_WINDOW,
            reset_sequence: true,
        }
    }
}

impl Config {
    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tx_window == 0 || self.tx_window > MAX_WINDOW {
            return Err(Error::Config(format!(
                "tx window must be 1..={MAX_WINDOW}, got {}",
                self.tx_window
            )));
        }
        if self.use_encryption && self.binding_key_file.is_none() {
            return Err(Error::Config(
                "encryption requires a binding key file".into(),
            ));
        }
        if self.instance.is_empty() || self.instance.contains('/') {
            return Err(Error::Config("invalid instance name".into()));
        }
        Ok(())
    }
}
