//! Serial transport for the USB CDC port of the appliance.

use crate::error::Result;
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort};

/// The USB CDC port ignores the baud rate, any value works.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Opens a blocking serial port usable as a [`crate::client::Client`] transport.
///
/// The port keeps the 8N1 defaults without flow control. Bytes the device
/// queued before the port was opened are discarded, so the first reply read
/// belongs to the first request.
pub fn open(device: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let port = tokio_serial::new(device, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(std::io::Error::from)?;
    port.clear(ClearBuffer::Input).map_err(std::io::Error::from)?;
    Ok(port)
}
