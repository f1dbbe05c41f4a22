use std::num::ParseIntError;
use std::path::PathBuf;

use structopt::StructOpt;

use rtltool::{Error, FLASH_SECTOR_SIZE};

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_auto_int(value: &str) -> Result<u32, ParseIntError> {
    if let Some(digits) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(digits, 16)
    } else {
        value.parse()
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "rtltool",
    about = "Tool for programming the Realtek RTL8762C SoC"
)]
pub struct Opts {
    /// Serial port device
    #[structopt(env = "RTLTOOL_PORT", short = "p", long = "port")]
    pub port: Option<String>,

    /// Serial baud rate used while flashing and reading
    #[structopt(
        env = "RTLTOOL_BAUD",
        short = "b",
        long = "baud",
        default_value = "921600",
        parse(try_from_str = parse_auto_int)
    )]
    pub baud: u32,

    /// Number of session attempts before giving up
    #[structopt(short = "r", long = "retries", default_value = "3")]
    pub retries: usize,

    /// Stage-0 helper firmware uploaded during the boot handshake
    #[structopt(env = "RTLTOOL_FW0", long = "firmware0", parse(from_os_str))]
    pub firmware0: PathBuf,

    #[structopt(subcommand)]
    pub operation: Operation,
}

#[derive(StructOpt, Debug)]
pub enum Operation {
    /// Read the MAC address from OTP ROM
    ReadMac,
    /// Read flash contents into a file
    ReadFlash {
        #[structopt(parse(try_from_str = parse_auto_int))]
        address: u32,
        #[structopt(parse(try_from_str = parse_auto_int))]
        size: u32,
        #[structopt(parse(from_os_str))]
        filename: PathBuf,
    },
    /// Erase the entire flash
    EraseFlash,
    /// Erase a sector-aligned region of flash
    EraseRegion {
        #[structopt(parse(try_from_str = parse_auto_int))]
        address: u32,
        #[structopt(parse(try_from_str = parse_auto_int))]
        size: u32,
    },
    /// Write binary files to flash, given as <address> <filename> pairs
    WriteFlash {
        #[structopt(name = "address-filename", required = true)]
        addr_filename: Vec<String>,
    },
    /// Verify flash contents against binary files, given as <address> <filename> pairs
    VerifyFlash {
        #[structopt(name = "address-filename", required = true)]
        addr_filename: Vec<String>,
    },
}

/// An address/filename pair from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrFilePair {
    pub address: u32,
    pub filename: PathBuf,
}

/// Parses raw `<address> <filename>` arguments into pairs.
pub fn parse_addr_file_pairs(values: &[String]) -> Result<Vec<AddrFilePair>, Error> {
    if values.len() % 2 != 0 {
        return Err(Error::Argument(
            "arguments must be pairs of an address and the binary filename to write there".into(),
        ));
    }

    let mut pairs = Vec::with_capacity(values.len() / 2);

    for pair in values.chunks(2) {
        let address = parse_auto_int(&pair[0])
            .map_err(|_| Error::Argument(format!("address \"{}\" must be a number", pair[0])))?;

        pairs.push(AddrFilePair {
            address,
            filename: PathBuf::from(&pair[1]),
        });
    }

    Ok(pairs)
}

/// Rejects an erase region whose address or size is not sector-aligned.
pub fn validate_sector_aligned(address: u32, size: u32) -> Result<(), Error> {
    if address % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::Argument(format!(
            "address {:#x} is not aligned to the {:#x}-byte flash sector size",
            address, FLASH_SECTOR_SIZE
        )));
    }

    if size % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::Argument(format!(
            "size {:#x} is not a multiple of the {:#x}-byte flash sector size",
            size, FLASH_SECTOR_SIZE
        )));
    }

    Ok(())
}

/// Checks a loaded write/verify set: sector-aligned addresses, ascending
/// order, and no overlap at sector granularity.
pub fn validate_blob_set(blobs: &[(u32, Vec<u8>)]) -> Result<(), Error> {
    // First address past the sectors claimed so far
    let mut previous_end = 0u64;

    for (address, data) in blobs {
        if address % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::Argument(format!(
                "address {:#x} is not aligned to the {:#x}-byte flash sector size",
                address, FLASH_SECTOR_SIZE
            )));
        }

        if u64::from(*address) < previous_end {
            return Err(Error::Argument(format!(
                "detected overlap or unsorted input at address {:#x}",
                address
            )));
        }

        let sectors = (data.len() as u64 + u64::from(FLASH_SECTOR_SIZE) - 1)
            / u64::from(FLASH_SECTOR_SIZE);
        previous_end = u64::from(*address) + sectors * u64::from(FLASH_SECTOR_SIZE);
    }

    Ok(())
}
