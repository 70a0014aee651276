//! # IEEE C37.118 Common Types and Utilities
//!
//! This module defines the types shared by every IEEE C37.118 frame: the parse error
//! taxonomy, version tracking, frame type detection from the SYNC word, the 14-byte
//! common prefix and the STAT word of data cells. It covers IEEE C37.118-2005,
//! IEEE C37.118.2-2011 and IEEE C37.118.2-2024.
//!
//! ## Key Components
//!
//! - `ParseError`: Errors encountered while parsing or building frames.
//! - `Version`: Standard version derived from SYNC bits 3-0.
//! - `FrameType`: Frame type derived from SYNC bits 6-4.
//! - `PrefixFrame`: SYNC, FRAMESIZE, IDCODE, SOC and FRACSEC.
//! - `StatField`: Decoded STAT word of a data cell.

use crate::model::CellStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Leading byte of every C37.118 SYNC word.
pub const SYNC_BYTE: u8 = 0xAA;

/// Size of the common frame prefix in bytes.
pub const PREFIX_SIZE: usize = 14;

/// Size of the CRC-CCITT trailer in bytes.
pub const CHECKSUM_SIZE: usize = 2;

/// Represents errors that can occur during IEEE C37.118 frame parsing or encoding.
///
/// # Variants
///
/// * `InvalidLength`: Frame length is too short, too long, or does not match FRAMESIZE.
/// * `InvalidFrameType`: Frame type in the SYNC field is invalid or unexpected.
/// * `InvalidChecksum`: CRC checksum does not match the calculated value.
/// * `InvalidFormat`: A field value does not conform to the standard.
/// * `InvalidHeader`: Header frame content is malformed.
/// * `VersionNotSupported`: Version is recognized but not valid for this frame type.
/// * `UnknownVersion`: Version in the SYNC field is unrecognized.
/// * `InvalidPhasorType`: Phasor data type is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid length: {message}")]
    InvalidLength { message: String },
    #[error("Invalid frame type: {message}")]
    InvalidFrameType { message: String },
    #[error("Invalid checksum: {message}")]
    InvalidChecksum { message: String },
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },
    #[error("Invalid header: {message}")]
    InvalidHeader { message: String },
    #[error("Version not supported: {message}")]
    VersionNotSupported { message: String },
    #[error("Unknown version: {message}")]
    UnknownVersion { message: String },
    #[error("Invalid phasor type: {message}")]
    InvalidPhasorType { message: String },
}

/// Ensures `bytes` holds at least `needed` bytes, naming `what` in the error.
pub(crate) fn require_len(bytes: &[u8], needed: usize, what: &str) -> Result<(), ParseError> {
    if bytes.len() < needed {
        return Err(ParseError::InvalidLength {
            message: format!(
                "{}: expected at least {} bytes, got {}",
                what,
                needed,
                bytes.len()
            ),
        });
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a frame buffer.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8], offset: usize, what: &'static str) -> Self {
        Cursor {
            bytes,
            offset,
            what,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "{}: need {} bytes at offset {}, {} available",
                    self.what,
                    n,
                    self.offset,
                    self.remaining()
                ),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ParseError> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ParseError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn f32(&mut self) -> Result<f32, ParseError> {
        Ok(f32::from_bits(self.u32()?))
    }
}

/// Pads or truncates `name` to a 16-byte space-filled field.
pub(crate) fn fixed_name(name: &str) -> [u8; 16] {
    let mut field = [b' '; 16];
    for (slot, byte) in field.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    field
}

/// Reads a space or NUL padded name field.
pub(crate) fn name_from_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .trim_start()
        .to_string()
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Tracks the IEEE C37.118 standard version based on the SYNC field.
///
/// # Variants
///
/// * `V2005`: IEEE C37.118-2005 (SYNC version 0x1).
/// * `V2011`: IEEE C37.118.2-2011 (SYNC version 0x2).
/// * `V2024`: IEEE C37.118.2-2024 (SYNC version 0x3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Version {
    V2005,
    #[default]
    V2011,
    V2024,
}

impl Version {
    /// Creates a `Version` from the SYNC field's version bits.
    ///
    /// # Returns
    ///
    /// * `Ok(Version)`: The corresponding version.
    /// * `Err(ParseError::UnknownVersion)`: If the version bits are unrecognized.
    pub fn from_sync(sync: u16) -> Result<Self, ParseError> {
        match sync & 0x000F {
            0x0001 => Ok(Version::V2005),
            0x0002 => Ok(Version::V2011),
            0x0003 => Ok(Version::V2024),
            _ => Err(ParseError::UnknownVersion {
                message: format!("Unsupported version: 0x{:04X}", sync),
            }),
        }
    }

    /// Creates a `Version` from a string identifier such as "v2" or
    /// "IEEE Std C37.118.2-2011".
    pub fn from_string(s: &str) -> Result<Self, ParseError> {
        match s {
            "IEEE Std C37.118-2005" | "version1" | "v1" | "2005" => Ok(Version::V2005),
            "IEEE Std C37.118.2-2011" | "version2" | "v2" | "2011" => Ok(Version::V2011),
            "IEEE Std C37.118.2-2024" | "version3" | "v3" | "2024" => Ok(Version::V2024),
            _ => Err(ParseError::UnknownVersion {
                message: format!(
                    "{} (use v1/v2/v3, 2005/2011/2024 or the full standard name)",
                    s
                ),
            }),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Version::V2005 => 0x01,
            Version::V2011 => 0x02,
            Version::V2024 => 0x03,
        }
    }

    /// CFG-3 frames exist from the 2011 revision on.
    pub fn supports_config3(&self) -> bool {
        !matches!(self, Version::V2005)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V2005 => write!(f, "IEEE Std C37.118-2005"),
            Version::V2011 => write!(f, "IEEE Std C37.118.2-2011"),
            Version::V2024 => write!(f, "IEEE Std C37.118.2-2024"),
        }
    }
}

/// Constructs a SYNC field for an IEEE C37.118 frame.
///
/// The leading byte is 0xAA. The second byte carries the frame type in bits 6-4
/// (000 data, 001 header, 010 CFG-1, 011 CFG-2, 100 command, 101 CFG-3) and the
/// version in bits 3-0.
pub fn create_sync(version: Version, frame_type: FrameType) -> u16 {
    ((SYNC_BYTE as u16) << 8) | ((frame_type.bits() as u16) << 4) | version.bits() as u16
}

/// Represents the type of an IEEE C37.118 frame.
///
/// # Variants
///
/// * `Data`: Data frame containing synchrophasor measurements.
/// * `Header`: Header frame with descriptive information.
/// * `Config1`: Configuration frame 1 (device capabilities).
/// * `Config2`: Configuration frame 2 (current configuration).
/// * `Config3`: Configuration frame 3 (extended configuration).
/// * `Command`: Command frame for control instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Data,
    Header,
    Config1,
    Config2,
    Config3,
    Command,
}

impl FrameType {
    /// Extracts the frame type from the SYNC field.
    ///
    /// # Returns
    ///
    /// * `Ok(FrameType)`: The corresponding frame type.
    /// * `Err(ParseError::InvalidFrameType)`: If the leading byte is not 0xAA or the
    ///   frame type bits are undefined.
    pub fn from_sync(sync: u16) -> Result<FrameType, ParseError> {
        if (sync >> 8) as u8 != SYNC_BYTE {
            return Err(ParseError::InvalidFrameType {
                message: format!("Invalid first byte: 0x{:02X}, expected 0xAA", sync >> 8),
            });
        }
        let frame_type_bits = (sync >> 4) & 0x7;

        match frame_type_bits {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Header),
            2 => Ok(FrameType::Config1),
            3 => Ok(FrameType::Config2),
            4 => Ok(FrameType::Command),
            5 => Ok(FrameType::Config3),
            _ => Err(ParseError::InvalidFrameType {
                message: format!("Invalid frame type bits: {}", frame_type_bits),
            }),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Header => 1,
            FrameType::Config1 => 2,
            FrameType::Config2 => 3,
            FrameType::Command => 4,
            FrameType::Config3 => 5,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FrameType::Config1 | FrameType::Config2 | FrameType::Config3
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "IEEE Std C37.118 Data Frame"),
            FrameType::Header => write!(f, "IEEE Std C37.118 Header Frame"),
            FrameType::Config1 => write!(f, "IEEE Std C37.118 Configuration Frame 1"),
            FrameType::Config2 => write!(f, "IEEE Std C37.118 Configuration Frame 2"),
            FrameType::Config3 => write!(f, "IEEE Std C37.118 Configuration Frame 3"),
            FrameType::Command => write!(f, "IEEE Std C37.118 Command Frame"),
        }
    }
}

/// Represents the common prefix structure for IEEE C37.118 frames.
///
/// # Fields
///
/// * `sync`: 16-bit SYNC field (frame type and version).
/// * `framesize`: Total frame length in bytes, checksum included.
/// * `idcode`: Device identification code or stream identifier.
/// * `soc`: Second-of-century timestamp (Unix epoch).
/// * `leapbyte`: Time quality and leap second flags.
/// * `fracsec`: 24-bit fraction of second, in units of the configured time base.
/// * `version`: Derived IEEE C37.118 version (not serialized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixFrame {
    pub sync: u16,
    pub framesize: u16,
    pub idcode: u16,
    pub soc: u32,
    pub leapbyte: u8,
    pub fracsec: u32,
    #[serde(skip)]
    pub version: Version,
}

impl PrefixFrame {
    /// Creates a prefix for `frame_type` with zeroed timestamp fields.
    pub fn new(version: Version, frame_type: FrameType, idcode: u16) -> Self {
        PrefixFrame {
            sync: create_sync(version, frame_type),
            framesize: PREFIX_SIZE as u16,
            idcode,
            soc: 0,
            leapbyte: 0,
            fracsec: 0,
            version,
        }
    }

    pub fn with_time(mut self, soc: u32, fracsec: u32) -> Self {
        self.soc = soc;
        self.fracsec = fracsec & 0x00FF_FFFF;
        self
    }

    /// Parses a `PrefixFrame` from the first 14 bytes of `bytes`.
    ///
    /// # Returns
    ///
    /// * `Ok(PrefixFrame)`: The parsed prefix frame.
    /// * `Err(ParseError)`: If the slice is too short or the version is unknown.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, PREFIX_SIZE, "PrefixFrame")?;
        let sync = read_u16(bytes, 0);
        let version = Version::from_sync(sync)?;

        Ok(PrefixFrame {
            sync,
            framesize: read_u16(bytes, 2),
            idcode: read_u16(bytes, 4),
            soc: read_u32(bytes, 6),
            leapbyte: bytes[10],
            fracsec: u32::from_be_bytes([0, bytes[11], bytes[12], bytes[13]]),
            version,
        })
    }

    /// Converts the `PrefixFrame` to a 14-byte array.
    pub fn to_hex(&self) -> [u8; PREFIX_SIZE] {
        let mut result = [0u8; PREFIX_SIZE];
        result[0..2].copy_from_slice(&self.sync.to_be_bytes());
        result[2..4].copy_from_slice(&self.framesize.to_be_bytes());
        result[4..6].copy_from_slice(&self.idcode.to_be_bytes());
        result[6..10].copy_from_slice(&self.soc.to_be_bytes());
        result[10] = self.leapbyte;
        result[11..14].copy_from_slice(&self.fracsec.to_be_bytes()[1..]);
        result
    }

    pub fn frame_type(&self) -> Result<FrameType, ParseError> {
        FrameType::from_sync(self.sync)
    }

    /// Checks that FRAMESIZE agrees with the buffer the frame was read from.
    pub fn expect_framesize(&self, actual: usize, what: &str) -> Result<(), ParseError> {
        if self.framesize as usize != actual {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "{}: FRAMESIZE is {} bytes, buffer holds {}",
                    what, self.framesize, actual
                ),
            });
        }
        Ok(())
    }
}

/// Represents the STAT field in IEEE C37.118 data frames.
///
/// The 16-bit STAT field contains status flags for data errors, PMU synchronization,
/// time quality and triggers, with version-specific meanings.
///
/// # Fields
///
/// * `raw`: Raw 16-bit STAT value.
/// * `data_error`: 2-bit data error code.
/// * `pmu_sync`: Synchronization error flag (bit 13).
/// * `data_sorting`: Data sorted by arrival (bit 12).
/// * `pmu_trigger`: PMU trigger detected (bit 11).
/// * `config_change`: Configuration change flag (bit 10).
/// * `data_modified`: Data modified flag (2011/2024 only).
/// * `time_quality`: Time quality code (3-bit in 2011/2024, 2-bit in 2005).
/// * `unlock_time`: Unlock time code (2011/2024 only).
/// * `trigger_reason`: 4-bit trigger reason code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatField {
    pub raw: u16,
    pub data_error: u8,
    pub pmu_sync: bool,
    pub data_sorting: bool,
    pub pmu_trigger: bool,
    pub config_change: bool,
    pub data_modified: bool,
    pub time_quality: u8,
    pub unlock_time: u8,
    pub trigger_reason: u8,
}

impl StatField {
    /// Creates a `StatField` from a raw STAT value and version.
    pub fn from_raw(raw: u16, version: Version) -> Self {
        let data_error = ((raw >> 14) & 0x03) as u8;
        let pmu_sync = (raw & 0x2000) != 0;
        let data_sorting = (raw & 0x1000) != 0;
        let pmu_trigger = (raw & 0x0800) != 0;
        let config_change = (raw & 0x0400) != 0;
        let trigger_reason = (raw & 0x000F) as u8;

        match version {
            Version::V2005 => StatField {
                raw,
                data_error,
                pmu_sync,
                data_sorting,
                pmu_trigger,
                config_change,
                data_modified: false,
                time_quality: ((raw >> 8) & 0x03) as u8,
                unlock_time: 0,
                trigger_reason,
            },
            Version::V2011 | Version::V2024 => StatField {
                raw,
                data_error,
                pmu_sync,
                data_sorting,
                pmu_trigger,
                config_change,
                data_modified: (raw & 0x0200) != 0,
                time_quality: ((raw >> 6) & 0x07) as u8,
                unlock_time: ((raw >> 4) & 0x03) as u8,
                trigger_reason,
            },
        }
    }

    /// Converts the `StatField` back to a raw 16-bit STAT value.
    pub fn to_raw(&self, version: Version) -> u16 {
        let mut raw = 0;
        raw |= (self.data_error as u16 & 0x03) << 14;
        raw |= (self.pmu_sync as u16) << 13;
        raw |= (self.data_sorting as u16) << 12;
        raw |= (self.pmu_trigger as u16) << 11;
        raw |= (self.config_change as u16) << 10;
        raw |= self.trigger_reason as u16 & 0x000F;

        match version {
            Version::V2005 => {
                raw |= ((self.time_quality & 0x03) as u16) << 8;
            }
            Version::V2011 | Version::V2024 => {
                raw |= (self.data_modified as u16) << 9;
                raw |= ((self.time_quality & 0x07) as u16) << 6;
                raw |= ((self.unlock_time & 0x03) as u16) << 4;
            }
        }
        raw
    }

    pub fn from_cell_status(status: CellStatus, version: Version) -> Self {
        StatField::from_raw(status.0, version)
    }

    pub fn to_cell_status(&self, version: Version) -> CellStatus {
        CellStatus(self.to_raw(version))
    }
}
