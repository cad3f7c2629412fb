//! UART transport over tokio-serial.

use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialStream};

use crate::core::Error;

/// Open the UART device for the link.
///
/// Failure here is fatal at daemon startup: there is no link without it.
pub fn open_uart(path: &str, baudrate: u32, hardflow: bool) -> Result<SerialStream, Error> {
    let flow = if hardflow {
        FlowControl::Hardware
    } else {
        FlowControl::None
    };
    tokio_serial::new(path, baudrate)
        .flow_control(flow)
        .open_native_async()
        .map_err(|e| Error::Config(format!("failed to open uart {path}: {e}")))
}
