//! # IEEE C37.118 Frame Parsing Utilities
//!
//! Helpers shared by every frame type: CRC-CCITT calculation and validation as
//! specified in IEEE C37.118.2-2011 Appendix B, and conversion between the SOC/FRACSEC
//! pair and the crate's 100 ns tick time base.

use super::common::ParseError;
use crate::measurement::{Ticks, TICKS_PER_SECOND};

/// Calculates the CRC-CCITT checksum for a given buffer.
///
/// Initial value 0xFFFF, polynomial 0x1021, no final XOR.
pub fn calculate_crc(buffer: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in buffer {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Validates the checksum of a given buffer.
///
/// Checks if the buffer's last two bytes match the calculated CRC-CCITT checksum
/// for the preceding bytes.
///
/// # Returns
///
/// * `Ok(())` if the checksum is valid.
/// * `Err(ParseError::InvalidLength)` if the buffer is too short.
/// * `Err(ParseError::InvalidChecksum)` if the checksum does not match.
pub fn validate_checksum(buffer: &[u8]) -> Result<(), ParseError> {
    if buffer.len() < 2 {
        return Err(ParseError::InvalidLength {
            message: format!("Buffer too short: {}", buffer.len()),
        });
    }

    let calculated_crc = calculate_crc(&buffer[..buffer.len() - 2]);
    let frame_crc = u16::from_be_bytes([buffer[buffer.len() - 2], buffer[buffer.len() - 1]]);

    if calculated_crc != frame_crc {
        return Err(ParseError::InvalidChecksum {
            message: format!(
                "CRC Checksum Mismatch: Expected {:04X}, got {:04X}",
                calculated_crc, frame_crc
            ),
        });
    }
    Ok(())
}

/// Appends the CRC of everything in `buffer` to its end.
pub fn append_checksum(buffer: &mut Vec<u8>) {
    let crc = calculate_crc(buffer);
    buffer.extend_from_slice(&crc.to_be_bytes());
}

/// Splits `ticks` into second-of-century and a FRACSEC count in `time_base` units.
///
/// Pre-epoch timestamps clamp to zero.
pub fn soc_fracsec_from_ticks(ticks: Ticks, time_base: u32) -> (u32, u32) {
    if ticks <= 0 || time_base == 0 {
        return (0, 0);
    }
    let soc = (ticks / TICKS_PER_SECOND).min(u32::MAX as i64) as u32;
    let sub = (ticks % TICKS_PER_SECOND) as u64;
    let fracsec = (sub * time_base as u64 / TICKS_PER_SECOND as u64) as u32;
    (soc, fracsec.min(0x00FF_FFFF))
}

/// Rebuilds ticks from SOC and the low 24 bits of FRACSEC.
pub fn ticks_from_soc_fracsec(soc: u32, fracsec: u32, time_base: u32) -> Ticks {
    let base = soc as i64 * TICKS_PER_SECOND;
    if time_base == 0 {
        return base;
    }
    let fraction = (fracsec & 0x00FF_FFFF) as u64;
    // Round to the nearest tick so encode/decode is stable for any time base.
    let sub = (fraction * TICKS_PER_SECOND as u64 + time_base as u64 / 2) / time_base as u64;
    base + sub as i64
}
