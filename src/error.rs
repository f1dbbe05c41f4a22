use std::io;

use thiserror::Error;

use crate::rtl8762c::ModuleState;

#[derive(Error, Debug)]
pub enum Error {
    /// The serial port could not be opened or reconfigured
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The byte pipe to the module is broken
    #[error("I/O error: {0}")]
    Transport(io::Error),

    /// The module did not produce the expected number of response bytes in time
    #[error("Timed out while waiting for a response")]
    Timeout,

    /// Bytes arrived but mismatched a fixed response template
    #[error("Received bytes mismatch expected bytes")]
    Expect {
        expected: Vec<u8>,
        received: Vec<u8>,
    },

    /// A framed response failed its CRC-16/ARC residue check
    #[error("Response failed the CRC check")]
    Crc,

    /// A flash operation was requested outside of flash mode
    #[error("The module is not in flash mode (current state: {0:?})")]
    State(Option<ModuleState>),

    /// An address or size failed driver-side validation
    #[error("{0}")]
    Argument(String),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Transport(error),
        }
    }
}
