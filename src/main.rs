use std::fs::{self, File};

use anyhow::Context;
use log::{info, warn};
use structopt::StructOpt;

use rtltool::transport::UartTransport;
use rtltool::{Rtl8762c, Session, DEFAULT_BAUD};

mod cli;

use cli::{Operation, Opts};

fn main() -> Result<(), anyhow::Error> {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    // Bad argument shapes are not worth a retry ladder; reject them before
    // touching the hardware.
    let blobs = load_blobs(&opts)?;
    if let Operation::EraseRegion { address, size } = opts.operation {
        cli::validate_sector_aligned(address, size)?;
    }

    let ports = match &opts.port {
        Some(port) => vec![port.clone()],
        None => {
            info!("No serial port specified, trying available ports");

            serialport::available_ports()
                .context("Could not enumerate serial ports")?
                .into_iter()
                .map(|port| port.port_name)
                .collect()
        }
    };

    anyhow::ensure!(!ports.is_empty(), "No serial ports available");

    for (index, port) in ports.iter().enumerate() {
        info!("Using port {}", port);

        for attempt in 1..=opts.retries {
            match run_session(&opts, port, &blobs) {
                Ok(()) => {
                    info!("Finished");
                    return Ok(());
                }
                Err(error) => {
                    warn!("Failed attempt {}/{}: {:#}", attempt, opts.retries, error);
                }
            }
        }

        if index + 1 < ports.len() {
            warn!("{} unsuccessful, trying next port", port);
        }
    }

    Err(anyhow::anyhow!("All attempts failed"))
}

/// Loads and validates the write/verify input files before any session opens.
fn load_blobs(opts: &Opts) -> Result<Vec<(u32, Vec<u8>)>, anyhow::Error> {
    let raw = match &opts.operation {
        Operation::WriteFlash { addr_filename } | Operation::VerifyFlash { addr_filename } => {
            addr_filename
        }
        _ => return Ok(Vec::new()),
    };

    let pairs = cli::parse_addr_file_pairs(raw)?;
    let mut blobs = Vec::with_capacity(pairs.len());

    for pair in &pairs {
        let data = fs::read(&pair.filename)
            .with_context(|| format!("Could not read {}", pair.filename.display()))?;

        blobs.push((pair.address, data));
    }

    cli::validate_blob_set(&blobs)?;

    Ok(blobs)
}

/// One full programming session: open the port, enter flash mode, run the
/// requested operation, release the module into run mode on the way out.
fn run_session(opts: &Opts, port: &str, blobs: &[(u32, Vec<u8>)]) -> Result<(), anyhow::Error> {
    let transport = UartTransport::open(port)
        .with_context(|| format!("Could not open serial port {}", port))?;
    let fw0 = File::open(&opts.firmware0).with_context(|| {
        format!(
            "Could not open stage-0 image {}",
            opts.firmware0.display()
        )
    })?;

    let mut rtl = Rtl8762c::new(transport, fw0)?;
    let mut session = rtl.begin_session()?;

    if opts.baud != DEFAULT_BAUD {
        session.set_baud(opts.baud)?;
    }

    dispatch(&mut session, &opts.operation, blobs)
}

fn dispatch(
    session: &mut Session<'_, UartTransport, File>,
    operation: &Operation,
    blobs: &[(u32, Vec<u8>)],
) -> Result<(), anyhow::Error> {
    match operation {
        Operation::ReadMac => {
            let mac = session.read_mac()?;
            let formatted: Vec<String> = mac.iter().map(|byte| format!("{:02x}", byte)).collect();

            println!("MAC: {}", formatted.join(":"));
        }
        Operation::ReadFlash {
            address,
            size,
            filename,
        } => {
            let data = session.read_flash(*address, *size)?;

            fs::write(filename, &data)
                .with_context(|| format!("Could not write {}", filename.display()))?;
            info!(
                "Read {} bytes at {:#x} into {}",
                data.len(),
                address,
                filename.display()
            );
        }
        Operation::EraseFlash => session.erase_flash()?,
        Operation::EraseRegion { address, size } => session.erase_region(*address, *size)?,
        Operation::WriteFlash { .. } => {
            for (address, data) in blobs {
                session.write_flash(*address, data)?;
            }
        }
        Operation::VerifyFlash { .. } => {
            for (address, data) in blobs {
                session.verify_flash(*address, data)?;
            }
        }
    }

    Ok(())
}
