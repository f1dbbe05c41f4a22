//! Request/response protocol spoken by the RTL8762C over UART.
//!
//! Two framing families exist. The stage-0 helper firmware is uploaded in
//! HCI vendor frames with no checksum; every command available after the
//! upload travels in a frame terminated by a little-endian CRC-16/ARC over
//! the preceding bytes, and is acknowledged with a 10-byte frame whose CRC
//! residue must be zero.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use crc_any::CRCu16;
use log::warn;

use crate::Error;

/// Maximum payload of a single stage-0 upload frame
pub const FW0_CHUNK_SIZE: usize = 252;

/// Computes the CRC-16/ARC checksum of `bytes`.
///
/// Polynomial 0x8005, reflected in and out, zero init and xorout. Appending
/// the checksum little-endian to its input leaves a zero residue, which is
/// what the response decoders check.
pub fn crc16_arc(bytes: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16();
    crc.digest(bytes);
    crc.get_crc()
}

/// Completes a framed request by appending the little-endian CRC of `body`.
fn append_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc16_arc(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

/// Fails with [`Error::Crc`] unless the CRC over `frame` leaves a zero residue.
fn check_residue(frame: &[u8]) -> Result<(), Error> {
    if crc16_arc(frame) != 0 {
        return Err(Error::Crc);
    }

    Ok(())
}

/// Byte-compares a response against the template the module echoes on success.
fn expect(expected: &[u8], received: &[u8]) -> Result<(), Error> {
    if expected != received {
        warn!("Received bytes mismatch expected bytes");
        warn!("Expected {}", hex(expected));
        warn!("Received {}", hex(received));
        warn!("Reset the device into flash mode or try a lower baud rate");

        return Err(Error::Expect {
            expected: expected.to_vec(),
            received: received.to_vec(),
        });
    }

    Ok(())
}

/// Formats bytes as contiguous lowercase hex for log output.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// A single request/response exchange with the module.
///
/// `request_bytes` yields the fully framed request (with the CRC already
/// appended where the command family carries one), `response_len` the exact
/// number of bytes the module answers with, and `decode` interprets them.
pub trait Command {
    type Output;

    fn request_bytes(&self) -> Vec<u8>;
    fn response_len(&self) -> usize;
    fn decode(&self, response: &[u8]) -> Result<Self::Output, Error>;
}

/// Uploads one chunk of the stage-0 helper firmware.
///
/// The module echoes a fixed HCI event carrying the frame number, so a lost
/// or reordered frame shows up as a mismatch.
pub struct WriteFw0<'a> {
    pub chunk: &'a [u8],
    pub frame_number: u8,
}

impl Command for WriteFw0<'_> {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut request = Vec::with_capacity(5 + self.chunk.len());

        request.extend_from_slice(&[0x01, 0x20, 0xFC]);
        request.push(self.chunk.len() as u8 + 1);
        request.push(self.frame_number);
        request.extend_from_slice(self.chunk);

        request
    }

    fn response_len(&self) -> usize {
        8
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        let expected = [0x04, 0x0E, 0x05, 0x02, 0x20, 0xFC, 0x00, self.frame_number];

        expect(&expected, response)
    }
}

/// Flash geometry reported by the stage-0 firmware.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SystemReportData {
    pub flash_addr: u32,
    pub flash_size: u32,
}

/// Self-describe query answered once the stage-0 firmware is running.
pub struct SystemReport;

impl Command for SystemReport {
    type Output = SystemReportData;

    fn request_bytes(&self) -> Vec<u8> {
        vec![
            0x01, 0x62, 0xFC, 0x09, 0x20, 0x34, 0x12, 0x20, 0x00, 0x31, 0x38, 0x20, 0x00,
        ]
    }

    fn response_len(&self) -> usize {
        77
    }

    fn decode(&self, response: &[u8]) -> Result<SystemReportData, Error> {
        // The first 7 bytes are an event header; the CRC covers the report
        // that follows it.
        let report = &response[7..];
        check_residue(report)?;

        let mut cursor = Cursor::new(&report[17..25]);
        let flash_addr = cursor.read_u32::<BigEndian>()?;
        let flash_size = cursor.read_u32::<BigEndian>()?;

        Ok(SystemReportData {
            flash_addr,
            flash_size,
        })
    }
}

const SET_BAUD_ACK: [u8; 10] = [0x87, 0x10, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x5A, 0xD7];

/// Switches the module's UART to a new baud rate.
///
/// The module retunes autonomously right after acknowledging, so the host
/// must follow suit before the next command.
pub struct SetBaud {
    pub baud_rate: u32,
}

impl Command for SetBaud {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut body = vec![0x87, 0x10, 0x10];

        body.extend_from_slice(&self.baud_rate.to_le_bytes());
        body.push(0xFF);

        append_crc(body)
    }

    fn response_len(&self) -> usize {
        SET_BAUD_ACK.len()
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        check_residue(response)?;
        expect(&SET_BAUD_ACK, response)
    }
}

/// Reads `size` bytes of flash starting at `address`.
pub struct ReadFlash {
    pub address: u32,
    pub size: u32,
}

impl Command for ReadFlash {
    type Output = Vec<u8>;

    fn request_bytes(&self) -> Vec<u8> {
        let mut body = vec![0x87, 0x33, 0x10];

        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&self.size.to_le_bytes());

        append_crc(body)
    }

    fn response_len(&self) -> usize {
        self.size as usize + 10
    }

    fn decode(&self, response: &[u8]) -> Result<Vec<u8>, Error> {
        check_residue(response)?;

        // Strip the 8-byte header and the trailing CRC
        Ok(response[8..response.len() - 2].to_vec())
    }
}

const ERASE_REGION_ACK: [u8; 10] = [0x87, 0x30, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7B, 0x15];

/// Erases `size` bytes of flash starting at `address`.
///
/// Both values must be sector-aligned; the module does not realign them.
pub struct EraseRegion {
    pub address: u32,
    pub size: u32,
}

impl Command for EraseRegion {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut body = vec![0x87, 0x30, 0x10];

        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&self.size.to_le_bytes());

        append_crc(body)
    }

    fn response_len(&self) -> usize {
        ERASE_REGION_ACK.len()
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        check_residue(response)?;
        expect(&ERASE_REGION_ACK, response)
    }
}

const ERASE_FLASH_ACK: [u8; 10] = [0x87, 0x31, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6B, 0xD5];

/// Erases the whole flash in a single command.
///
/// Only accepted by parts with at most 512 KiB of flash.
pub struct EraseFlash;

impl Command for EraseFlash {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        append_crc(vec![0x87, 0x31, 0x10])
    }

    fn response_len(&self) -> usize {
        ERASE_FLASH_ACK.len()
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        check_residue(response)?;
        expect(&ERASE_FLASH_ACK, response)
    }
}

const WRITE_FLASH_ACK: [u8; 10] = [0x87, 0x32, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x58, 0xD5];

/// Programs `chunk` into previously erased flash at `address`.
pub struct WriteFlash<'a> {
    pub address: u32,
    pub chunk: &'a [u8],
}

impl Command for WriteFlash<'_> {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(11 + self.chunk.len());

        body.extend_from_slice(&[0x87, 0x32, 0x10]);
        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&(self.chunk.len() as u32).to_le_bytes());
        body.extend_from_slice(self.chunk);

        append_crc(body)
    }

    fn response_len(&self) -> usize {
        WRITE_FLASH_ACK.len()
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        check_residue(response)?;
        expect(&WRITE_FLASH_ACK, response)
    }
}

const VERIFY_FLASH_ACK: [u8; 10] = [0x87, 0x50, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1B, 0x13];

/// Asks the module to read back `chunk.len()` bytes at `address` and compare
/// their CRC-16/ARC against the one embedded in the request.
///
/// The embedded checksum covers the chunk itself and is distinct from the
/// outer frame CRC. A read-back mismatch surfaces as a response that differs
/// from the success template.
pub struct VerifyFlash<'a> {
    pub address: u32,
    pub chunk: &'a [u8],
}

impl Command for VerifyFlash<'_> {
    type Output = ();

    fn request_bytes(&self) -> Vec<u8> {
        let mut body = vec![0x87, 0x50, 0x10];

        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&(self.chunk.len() as u32).to_le_bytes());
        body.extend_from_slice(&crc16_arc(self.chunk).to_le_bytes());

        append_crc(body)
    }

    fn response_len(&self) -> usize {
        VERIFY_FLASH_ACK.len()
    }

    fn decode(&self, response: &[u8]) -> Result<(), Error> {
        check_residue(response)?;
        expect(&VERIFY_FLASH_ACK, response)
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    #[test]
    fn it_should_compute_the_arc_check_value() {
        assert_eq!(crc16_arc(b"123456789"), 0xBB3D);
    }

    #[test]
    fn it_should_leave_zero_residue_over_an_appended_crc() {
        let samples: &[&[u8]] = &[b"", b"\x00", b"\x87\x33\x10", b"the quick brown fox"];

        for sample in samples {
            let framed = append_crc(sample.to_vec());

            assert_eq!(crc16_arc(&framed), 0, "residue for {:x?}", sample);
        }
    }

    #[test]
    fn it_should_match_the_crcs_of_the_device_acknowledgements() {
        // Templates echoed by real silicon; a zero residue over each pins the
        // checksum down to the ARC variant.
        let acks = [
            SET_BAUD_ACK,
            ERASE_REGION_ACK,
            ERASE_FLASH_ACK,
            WRITE_FLASH_ACK,
            VERIFY_FLASH_ACK,
        ];

        for ack in &acks {
            assert_eq!(crc16_arc(&ack[..]), 0, "residue for {:x?}", ack);
        }
    }

    #[test]
    fn it_should_serialize_a_stage0_frame() {
        let chunk: Vec<u8> = (0..252).map(|i| i as u8).collect();
        let cmd = WriteFw0 {
            chunk: &chunk,
            frame_number: 7,
        };

        let request = cmd.request_bytes();

        assert_eq_hex!(&request[..5], &hex!("01 20 FC FD 07"));
        assert_eq_hex!(&request[5..], &chunk[..]);
    }

    #[test]
    fn it_should_match_the_stage0_echo_against_the_frame_number() {
        let chunk = [0x42u8; 16];
        let cmd = WriteFw0 {
            chunk: &chunk,
            frame_number: 7,
        };

        cmd.decode(&hex!("04 0E 05 02 20 FC 00 07")).unwrap();

        match cmd.decode(&hex!("04 0E 05 02 20 FC 00 08")) {
            Err(Error::Expect { .. }) => {}
            other => panic!("expected an expect error, got {:?}", other),
        }
    }

    #[test]
    fn it_should_serialize_set_baud() {
        let request = SetBaud { baud_rate: 921_600 }.request_bytes();

        assert_eq_hex!(&request[..8], &hex!("87 10 10 00 10 0E 00 FF"));
        assert_eq!(request.len(), 10);
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_accept_the_set_baud_acknowledgement() {
        let cmd = SetBaud { baud_rate: 921_600 };

        cmd.decode(&SET_BAUD_ACK).unwrap();
    }

    #[test]
    fn it_should_reject_a_corrupted_acknowledgement() {
        let cmd = SetBaud { baud_rate: 921_600 };
        let mut response = SET_BAUD_ACK;
        response[4] ^= 0x01;

        match cmd.decode(&response) {
            Err(Error::Crc) => {}
            other => panic!("expected a CRC error, got {:?}", other),
        }
    }

    #[test]
    fn it_should_reject_a_well_framed_but_unexpected_acknowledgement() {
        let cmd = SetBaud { baud_rate: 921_600 };

        // A valid frame for a different command: residue passes, template fails
        match cmd.decode(&ERASE_REGION_ACK) {
            Err(Error::Expect { .. }) => {}
            other => panic!("expected an expect error, got {:?}", other),
        }
    }

    #[test]
    fn it_should_serialize_erase_region() {
        let request = EraseRegion {
            address: 0x0080_1000,
            size: 0x1000,
        }
        .request_bytes();

        assert_eq_hex!(&request[..11], &hex!("87 30 10 00 10 80 00 00 10 00 00"));
        assert_eq!(request.len(), 13);
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_serialize_erase_flash() {
        let request = EraseFlash.request_bytes();

        assert_eq_hex!(&request[..3], &hex!("87 31 10"));
        assert_eq!(request.len(), 5);
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_serialize_a_mac_sized_read() {
        let request = ReadFlash {
            address: 0x0080_1409,
            size: 6,
        }
        .request_bytes();

        assert_eq_hex!(&request[..11], &hex!("87 33 10 09 14 80 00 06 00 00 00"));
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_strip_the_read_flash_framing() {
        let cmd = ReadFlash {
            address: 0x0080_1409,
            size: 6,
        };

        let mut response = hex!("87 33 10 00 00 00 00 00 AA BB CC DD EE FF").to_vec();
        let crc = crc16_arc(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(response.len(), cmd.response_len());

        let data = cmd.decode(&response).unwrap();

        assert_eq_hex!(&data[..], &hex!("AA BB CC DD EE FF"));
    }

    #[test]
    fn it_should_serialize_write_flash() {
        let chunk = hex!("DE AD BE EF");
        let request = WriteFlash {
            address: 0x0080_2000,
            chunk: &chunk,
        }
        .request_bytes();

        assert_eq_hex!(
            &request[..15],
            &hex!("87 32 10 00 20 80 00 04 00 00 00 DE AD BE EF")
        );
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_embed_the_chunk_crc_in_verify_flash() {
        let chunk = [0u8; 16];
        let request = VerifyFlash {
            address: 0x0080_0000,
            chunk: &chunk,
        }
        .request_bytes();

        assert_eq_hex!(&request[..11], &hex!("87 50 10 00 00 80 00 10 00 00 00"));
        // CRC-16/ARC over all-zero input is zero
        assert_eq_hex!(&request[11..13], &hex!("00 00"));
        assert_eq!(request.len(), 15);
        assert_eq!(crc16_arc(&request), 0);
    }

    #[test]
    fn it_should_decode_a_system_report() {
        let mut report = vec![0u8; 68];
        report[17..21].copy_from_slice(&0x0080_0000u32.to_be_bytes());
        report[21..25].copy_from_slice(&(1024 * 1024u32).to_be_bytes());
        let report = append_crc(report);

        let mut response = hex!("04 0E 4A 02 62 FC 00").to_vec();
        response.extend_from_slice(&report);
        assert_eq!(response.len(), SystemReport.response_len());

        let data = SystemReport.decode(&response).unwrap();

        assert_eq!(data.flash_addr, 0x0080_0000);
        assert_eq!(data.flash_size, 1024 * 1024);
    }

    #[test]
    fn it_should_reject_a_system_report_with_a_bad_crc() {
        let report = append_crc(vec![0u8; 68]);
        let mut response = hex!("04 0E 4A 02 62 FC 00").to_vec();
        response.extend_from_slice(&report);
        response[30] ^= 0x01;

        match SystemReport.decode(&response) {
            Err(Error::Crc) => {}
            other => panic!("expected a CRC error, got {:?}", other),
        }
    }
}
