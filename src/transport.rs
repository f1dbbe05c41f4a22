//! Serial transport to the module.

use std::io::{Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortSettings, StopBits};

use crate::rtl8762c::DEFAULT_BAUD;
use crate::Error;

/// Deadline for a single blocking read before it fails as a timeout
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte pipe to the module plus the sideband levers the boot sequence needs.
///
/// `set_reset(true)` asserts the chip's reset pin and holds it low;
/// `set_mode(true)` selects programming mode when reset is released. The
/// transport never interprets protocol bytes.
pub trait Transport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;

    /// Reads exactly `len` bytes, failing with [`Error::Timeout`] when fewer
    /// arrive before the deadline.
    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error>;

    fn set_baud(&mut self, baud: u32) -> Result<(), Error>;
    fn set_reset(&mut self, asserted: bool) -> Result<(), Error>;
    fn set_mode(&mut self, asserted: bool) -> Result<(), Error>;
}

fn serial_settings(baud_rate: u32) -> SerialPortSettings {
    SerialPortSettings {
        baud_rate,
        data_bits: DataBits::Eight,
        flow_control: FlowControl::None,
        parity: Parity::None,
        stop_bits: StopBits::One,
        timeout: READ_TIMEOUT,
    }
}

/// A serial port configured the way the RTL8762C boot ROM expects it.
pub struct UartTransport {
    port: Box<dyn SerialPort>,
}

impl UartTransport {
    /// Opens the given `path` and configures it to 8N1 at the default baud
    /// rate with a 2 second read timeout.
    pub fn open(path: &str) -> Result<UartTransport, Error> {
        debug!("Opening serial port {}", path);

        let port = serialport::open_with_settings(&path, &serial_settings(DEFAULT_BAUD))?;

        Ok(UartTransport { port })
    }
}

impl Transport for UartTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.port.write_all(data)?;

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;

        Ok(())
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];

        self.port.read_exact(&mut buf)?;

        Ok(buf)
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        debug!("Setting baud rate to {}", baud);

        self.port.set_baud_rate(baud)?;

        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), Error> {
        self.port.write_request_to_send(asserted)?;

        Ok(())
    }

    fn set_mode(&mut self, asserted: bool) -> Result<(), Error> {
        self.port.write_data_terminal_ready(asserted)?;

        Ok(())
    }
}
