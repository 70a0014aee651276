//! # IEEE C37.118 Measurement Units
//!
//! Wire forms of the per-channel conversion factors carried in CFG-1/CFG-2 frames
//! (PHUNIT, ANUNIT, DIGUNIT) and the FNOM field, with conversions to and from the
//! canonical channel definitions in [`crate::model`].
//!
//! ## Key Components
//!
//! - `PhasorUnits`: Voltage/current flag and 24-bit scale factor for a phasor.
//! - `AnalogUnits`: Measurement type and signed 24-bit scale for an analog.
//! - `DigitalUnits`: Normal-status and valid-inputs masks for a digital word.
//! - `NominalFrequency`: Nominal line frequency (FNOM).

use super::common::{require_len, ParseError};
use crate::model::{AnalogKind, LineFrequency, PhasorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Defines scaling factors for phasor measurements in IEEE C37.118.
///
/// # Fields
///
/// * `is_current`: Indicates if the phasor is current (`true`) or voltage (`false`).
/// * `scale_factor`: 24-bit unsigned scaling factor in 10⁻⁵ V or A per bit, ignored
///   for floating-point phasors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasorUnits {
    pub is_current: bool,
    pub scale_factor: u32,
}

impl PhasorUnits {
    /// Parses phasor units from a 4-byte slice.
    ///
    /// # Returns
    ///
    /// * `Ok(PhasorUnits)`: The parsed phasor units.
    /// * `Err(ParseError::InvalidLength)`: If the byte slice is shorter than 4 bytes.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 4, "PhasorUnits")?;
        Ok(PhasorUnits {
            is_current: bytes[0] == 1,
            scale_factor: u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]),
        })
    }

    /// Converts the phasor units to a 4-byte array.
    pub fn to_hex(&self) -> [u8; 4] {
        let mut bytes = self.scale_factor.to_be_bytes();
        bytes[0] = self.is_current as u8;
        bytes
    }

    pub fn kind(&self) -> PhasorKind {
        if self.is_current {
            PhasorKind::Current
        } else {
            PhasorKind::Voltage
        }
    }

    pub fn from_kind(kind: PhasorKind, scale_factor: u32) -> Self {
        PhasorUnits {
            is_current: kind == PhasorKind::Current,
            scale_factor: scale_factor & 0x00FF_FFFF,
        }
    }
}

/// Enumerates measurement types for analog channels in IEEE C37.118.
///
/// # Variants
///
/// * `SinglePointOnWave`: Instantaneous analog value.
/// * `RmsOfAnalogInput`: Root mean square of the analog input.
/// * `PeakOfAnalogInput`: Peak value of the analog input.
/// * `Reserved`: Reserved or unknown measurement type (with raw code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementType {
    SinglePointOnWave,
    RmsOfAnalogInput,
    PeakOfAnalogInput,
    Reserved(u8),
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MeasurementType::SinglePointOnWave => write!(f, "Single Point-On-Wave"),
            MeasurementType::RmsOfAnalogInput => write!(f, "RMS"),
            MeasurementType::PeakOfAnalogInput => write!(f, "Peak"),
            MeasurementType::Reserved(code) => write!(f, "Unknown ({})", code),
        }
    }
}

impl MeasurementType {
    // Reserved codes (5-64) are accepted on the wire and mapped to RMS canonically.
    fn from_hex(byte: u8) -> Self {
        match byte {
            0 => MeasurementType::SinglePointOnWave,
            1 => MeasurementType::RmsOfAnalogInput,
            2 => MeasurementType::PeakOfAnalogInput,
            code => MeasurementType::Reserved(code),
        }
    }

    fn to_hex(&self) -> u8 {
        match self {
            MeasurementType::SinglePointOnWave => 0,
            MeasurementType::RmsOfAnalogInput => 1,
            MeasurementType::PeakOfAnalogInput => 2,
            MeasurementType::Reserved(code) => *code,
        }
    }

    pub fn kind(&self) -> AnalogKind {
        match self {
            MeasurementType::SinglePointOnWave => AnalogKind::SinglePointOnWave,
            MeasurementType::PeakOfAnalogInput => AnalogKind::Peak,
            _ => AnalogKind::Rms,
        }
    }

    pub fn from_kind(kind: AnalogKind) -> Self {
        match kind {
            AnalogKind::SinglePointOnWave => MeasurementType::SinglePointOnWave,
            AnalogKind::Rms => MeasurementType::RmsOfAnalogInput,
            AnalogKind::Peak => MeasurementType::PeakOfAnalogInput,
        }
    }
}

/// Defines scaling and type for analog channels in IEEE C37.118.
///
/// # Fields
///
/// * `measurement_type`: Type of analog measurement (e.g., RMS, peak).
/// * `scale_factor`: 24-bit signed scaling factor (sign-extended to 32 bits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogUnits {
    pub measurement_type: MeasurementType,
    pub scale_factor: i32,
}

impl AnalogUnits {
    /// Parses analog units from a 4-byte slice.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 4, "AnalogUnits")?;
        let measurement_type = MeasurementType::from_hex(bytes[0]);
        // Sign-extend the 24-bit scale.
        let scale_factor = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], 0]) >> 8;
        Ok(AnalogUnits {
            measurement_type,
            scale_factor,
        })
    }

    /// Converts the analog units to a 4-byte array.
    pub fn to_hex(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0] = self.measurement_type.to_hex();
        bytes[1..].copy_from_slice(&self.scale_factor.to_be_bytes()[1..]);
        bytes
    }
}

/// Mask words for one digital status word.
///
/// `normal_status` XORed with the status word yields zero in the normal state;
/// `valid_inputs` has a bit set for each input currently valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalUnits {
    pub normal_status: u16,
    pub valid_inputs: u16,
}

impl DigitalUnits {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 4, "DigitalUnits")?;
        Ok(DigitalUnits {
            normal_status: u16::from_be_bytes([bytes[0], bytes[1]]),
            valid_inputs: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn to_hex(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.normal_status.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.valid_inputs.to_be_bytes());
        bytes
    }

    /// Bits that differ from the normal state among valid inputs.
    pub fn abnormal_bits(&self, status_word: u16) -> u16 {
        (status_word ^ self.normal_status) & self.valid_inputs
    }
}

/// Specifies the nominal system frequency in IEEE C37.118.
///
/// On the wire FNOM bit 0 set means 50 Hz, clear means 60 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominalFrequency {
    Hz50,
    Hz60,
}

impl NominalFrequency {
    /// Parses the nominal frequency from a 2-byte FNOM field.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 2, "NominalFrequency")?;
        let fnom = u16::from_be_bytes([bytes[0], bytes[1]]);
        if fnom & 0xFFFE != 0 {
            return Err(ParseError::InvalidFormat {
                message: format!(
                    "Invalid NominalFrequency: reserved bits set in FNOM 0x{:04X}",
                    fnom
                ),
            });
        }
        Ok(if fnom & 0x0001 != 0 {
            NominalFrequency::Hz50
        } else {
            NominalFrequency::Hz60
        })
    }

    pub fn to_hex(&self) -> [u8; 2] {
        match self {
            NominalFrequency::Hz50 => [0x00, 0x01],
            NominalFrequency::Hz60 => [0x00, 0x00],
        }
    }
}

impl From<LineFrequency> for NominalFrequency {
    fn from(value: LineFrequency) -> Self {
        match value {
            LineFrequency::Hz50 => NominalFrequency::Hz50,
            LineFrequency::Hz60 => NominalFrequency::Hz60,
        }
    }
}

impl From<NominalFrequency> for LineFrequency {
    fn from(value: NominalFrequency) -> Self {
        match value {
            NominalFrequency::Hz50 => LineFrequency::Hz50,
            NominalFrequency::Hz60 => LineFrequency::Hz60,
        }
    }
}

impl fmt::Display for NominalFrequency {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NominalFrequency::Hz50 => write!(f, "50 Hz"),
            NominalFrequency::Hz60 => write!(f, "60 Hz"),
        }
    }
}
