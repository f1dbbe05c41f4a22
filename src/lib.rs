//! Host-side programmer for the Realtek RTL8762C Bluetooth SoC.

mod error;
pub mod protocol;
pub mod rtl8762c;
pub mod transport;

pub use error::Error;
pub use rtl8762c::{
    ModuleState, Rtl8762c, Session, DEFAULT_BAUD, FLASH_BASE, FLASH_SECTOR_SIZE, MAX_BAUD,
};
