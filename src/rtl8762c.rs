//! Module-state machine and flash operations for the RTL8762C.
//!
//! The chip is driven through three logical states: held in reset, running
//! the stage-0 helper with the flash command set unlocked, or executing its
//! application firmware. Entering flash mode is a timed choreography on the
//! reset and mode-select lines followed by the stage-0 upload and a
//! self-describe query.

use std::io::{Read, Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::protocol::{
    self, Command, EraseFlash, EraseRegion, ReadFlash, SetBaud, SystemReport, VerifyFlash,
    WriteFlash, WriteFw0, FW0_CHUNK_SIZE,
};
use crate::transport::Transport;
use crate::Error;

/// Erase unit of the on-chip SPI flash
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

/// First address of the memory-mapped flash
pub const FLASH_BASE: u32 = 0x0080_0000;

/// Baud rate the boot ROM starts out with
pub const DEFAULT_BAUD: u32 = 115_200;

/// Highest baud rate the module accepts from a `set_baud` command
pub const MAX_BAUD: u32 = 921_600;

/// Flash location of the 6-byte MAC address, stored least significant byte first
const MAC_ADDR: u32 = 0x0080_1409;
const MAC_LEN: u32 = 6;

/// Largest flash the single-shot erase command is accepted for
const WHOLE_CHIP_ERASE_LIMIT: u32 = 512 * 1024;

/// Width of the reset pulse that begins every state change
const RESET_PULSE_WIDTH: Duration = Duration::from_millis(10);

/// How long the mode-select level must be held past reset release
const BOOT_MODE_SUSTAIN: Duration = Duration::from_millis(500);

/// Settling time before the UART is usable after a mode change
const BAUD_CHANGE_DELAY: Duration = Duration::from_millis(400);

/// The module's logical state as seen from the host.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ModuleState {
    /// Held inactive with the reset line asserted
    Reset,
    /// Running the stage-0 helper, flash command set unlocked
    Flash,
    /// Executing application firmware
    Run,
}

/// A programming session against an RTL8762C module.
///
/// Owns the transport and the injected stage-0 image for its whole lifetime.
/// Flash operations are only legal in [`ModuleState::Flash`], entered through
/// [`begin_session`](Self::begin_session).
pub struct Rtl8762c<T, R> {
    transport: T,
    fw0: R,
    state: Option<ModuleState>,
    flash_size: Option<u32>,
}

impl<T: Transport, R: Read + Seek> Rtl8762c<T, R> {
    /// Takes ownership of the transport and the stage-0 image and brings the
    /// module into its inactive reset state.
    pub fn new(transport: T, fw0: R) -> Result<Rtl8762c<T, R>, Error> {
        let mut rtl = Rtl8762c {
            transport,
            fw0,
            state: None,
            flash_size: None,
        };

        rtl.assert_state(ModuleState::Reset)?;

        Ok(rtl)
    }

    /// Brings the module into flash mode and returns a guard that releases it
    /// into run mode when dropped.
    pub fn begin_session(&mut self) -> Result<Session<'_, T, R>, Error> {
        self.assert_state(ModuleState::Flash)?;

        Ok(Session { rtl: self })
    }

    /// Flash size in bytes, known once flash mode has been entered.
    pub fn flash_size(&self) -> Option<u32> {
        self.flash_size
    }

    /// Current module state, if a transition has completed.
    pub fn state(&self) -> Option<ModuleState> {
        self.state
    }

    /// Writes a request, drains its exact response and decodes it. Requests
    /// are never pipelined.
    fn exec<C: Command>(&mut self, command: &C) -> Result<C::Output, Error> {
        let request = command.request_bytes();
        debug!("tx: {}", protocol::hex(&request));

        self.transport.write_all(&request)?;
        self.transport.flush()?;

        let response = self.transport.read_exact(command.response_len())?;
        debug!("rx: {}", protocol::hex(&response));

        command.decode(&response)
    }

    /// Drives the module into `target` with the boot choreography on the
    /// reset and mode lines. A no-op when the module is already there.
    ///
    /// The sleep durations are minima the silicon needs to latch the mode
    /// levels. If the stage-0 upload or the report query fails on the way to
    /// flash mode, the recorded state stays unchanged.
    pub fn assert_state(&mut self, target: ModuleState) -> Result<(), Error> {
        if self.state == Some(target) {
            return Ok(());
        }

        debug!("Changing module state to {:?}", target);

        // Every transition starts from reset
        self.transport.set_reset(true)?;
        thread::sleep(RESET_PULSE_WIDTH);

        if target == ModuleState::Reset {
            self.state = Some(target);
            return Ok(());
        }

        // Level of the mode-select line the chip samples at reset release
        self.transport.set_mode(target == ModuleState::Flash)?;

        if target == ModuleState::Flash {
            // The boot ROM always listens at the default rate
            self.transport.set_baud(DEFAULT_BAUD)?;
        }

        self.transport.set_reset(false)?;
        thread::sleep(BOOT_MODE_SUSTAIN);

        self.transport.set_mode(false)?;
        thread::sleep(BAUD_CHANGE_DELAY);

        if target == ModuleState::Flash {
            info!("Uploading stage-0 firmware");
            self.upload_fw0()?;

            let report = self.exec(&SystemReport)?;
            info!("Flash size: {} KiB", report.flash_size / 1024);
            self.flash_size = Some(report.flash_size);
        }

        self.state = Some(target);
        debug!("Module state is now {:?}", target);

        Ok(())
    }

    /// Streams the stage-0 image in 252-byte frames with a wrapping frame
    /// counter, waiting for the echo of each before sending the next.
    fn upload_fw0(&mut self) -> Result<(), Error> {
        debug!("Starting transmission of the stage-0 image");

        // A retried session streams the image again from the start
        self.fw0.seek(SeekFrom::Start(0))?;

        let mut frame_number = 0u8;
        let mut chunk = [0u8; FW0_CHUNK_SIZE];

        loop {
            let len = read_chunk(&mut self.fw0, &mut chunk)?;
            if len == 0 {
                break;
            }

            self.exec(&WriteFw0 {
                chunk: &chunk[..len],
                frame_number,
            })?;

            frame_number = frame_number.wrapping_add(1);
        }

        debug!("Transmission of the stage-0 image finished");

        Ok(())
    }

    fn ensure_flash_mode(&self) -> Result<(), Error> {
        if self.state != Some(ModuleState::Flash) {
            return Err(Error::State(self.state));
        }

        Ok(())
    }

    /// Reads the module's 6-byte MAC address.
    ///
    /// The module stores it least significant byte first; the result is
    /// reversed into canonical transmission order.
    pub fn read_mac(&mut self) -> Result<[u8; 6], Error> {
        let raw = self.read_flash(MAC_ADDR, MAC_LEN)?;

        let mut mac = [0u8; 6];
        for (out, byte) in mac.iter_mut().zip(raw.iter().rev()) {
            *out = *byte;
        }

        Ok(mac)
    }

    /// Reads `size` bytes starting at `address`, in transfers of at most one
    /// sector. Reads carry no alignment requirement.
    pub fn read_flash(&mut self, address: u32, size: u32) -> Result<Vec<u8>, Error> {
        self.ensure_flash_mode()?;

        let mut data = Vec::with_capacity(size as usize);
        let mut offset = 0;

        while offset < size {
            let chunk_size = FLASH_SECTOR_SIZE.min(size - offset);
            let chunk = self.exec(&ReadFlash {
                address: address + offset,
                size: chunk_size,
            })?;

            data.extend_from_slice(&chunk);
            offset += chunk_size;
        }

        Ok(data)
    }

    /// Erases `size` bytes starting at `address`, one sector at a time.
    ///
    /// `address` and `size` must already be sector-aligned; the walk does not
    /// realign them.
    pub fn erase_region(&mut self, address: u32, size: u32) -> Result<(), Error> {
        self.ensure_flash_mode()?;

        let mut offset = 0;
        while offset < size {
            self.exec(&EraseRegion {
                address: address + offset,
                size: FLASH_SECTOR_SIZE,
            })?;

            offset += FLASH_SECTOR_SIZE;
        }

        Ok(())
    }

    /// Erases the entire flash.
    ///
    /// Parts larger than 512 KiB reject the single-shot erase command, so
    /// their flash is walked sector by sector instead.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.ensure_flash_mode()?;

        let flash_size = self.flash_size.ok_or(Error::State(self.state))?;

        if flash_size <= WHOLE_CHIP_ERASE_LIMIT {
            self.exec(&EraseFlash)?;
        } else {
            self.erase_region(FLASH_BASE, flash_size)?;
        }

        Ok(())
    }

    /// Writes `data` at `address` as an erase, write, verify triple per
    /// sector-sized chunk.
    ///
    /// Any failure aborts immediately and leaves the flash partially
    /// written; the caller retries the whole session.
    pub fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.ensure_flash_mode()?;

        for (index, chunk) in data.chunks(FLASH_SECTOR_SIZE as usize).enumerate() {
            let chunk_addr = address + (index as u32) * FLASH_SECTOR_SIZE;

            self.exec(&EraseRegion {
                address: chunk_addr,
                size: chunk.len() as u32,
            })?;
            self.exec(&WriteFlash {
                address: chunk_addr,
                chunk,
            })?;
            self.exec(&VerifyFlash {
                address: chunk_addr,
                chunk,
            })?;
        }

        Ok(())
    }

    /// Confirms `data` matches the flash contents at `address`, chunked the
    /// same way as [`write_flash`](Self::write_flash).
    pub fn verify_flash(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.ensure_flash_mode()?;

        for (index, chunk) in data.chunks(FLASH_SECTOR_SIZE as usize).enumerate() {
            let chunk_addr = address + (index as u32) * FLASH_SECTOR_SIZE;

            self.exec(&VerifyFlash {
                address: chunk_addr,
                chunk,
            })?;
        }

        Ok(())
    }

    /// Switches the module and then the transport to `baud_rate`.
    ///
    /// The module retunes autonomously after acknowledging, so the transport
    /// follows immediately.
    pub fn set_baud(&mut self, baud_rate: u32) -> Result<(), Error> {
        self.ensure_flash_mode()?;

        self.exec(&SetBaud { baud_rate })?;
        self.transport.set_baud(baud_rate)?;

        Ok(())
    }
}

/// Reads up to a full buffer from `reader`, stopping early only at the end of
/// the input.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    Ok(filled)
}

/// Scoped flash-mode session.
///
/// Dropping the session releases the module into run mode. A failed run
/// transition is logged and swallowed so it never masks the error that ended
/// the session body.
pub struct Session<'a, T: Transport, R: Read + Seek> {
    rtl: &'a mut Rtl8762c<T, R>,
}

impl<T: Transport, R: Read + Seek> Deref for Session<'_, T, R> {
    type Target = Rtl8762c<T, R>;

    fn deref(&self) -> &Self::Target {
        self.rtl
    }
}

impl<T: Transport, R: Read + Seek> DerefMut for Session<'_, T, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.rtl
    }
}

impl<T: Transport, R: Read + Seek> Drop for Session<'_, T, R> {
    fn drop(&mut self) {
        if let Err(error) = self.rtl.assert_state(ModuleState::Run) {
            warn!("Could not release the module into run mode: {}", error);
        }
    }
}
