//! # IEEE C37.118 Configuration Frame Utilities
//!
//! Parsing and construction of CFG-1 and CFG-2 frames, which describe the channel
//! layout of every PMU in a stream: station name, FORMAT word, channel names and
//! the PHUNIT/ANUNIT/DIGUNIT conversion factors. Both frames share one layout and
//! differ only in their SYNC word. CFG-3 lives in [`super::config3`].
//!
//! ## Key Components
//!
//! - `PMUConfigurationFrame`: A single PMU's configuration block.
//! - `ConfigurationFrame`: A complete CFG-1 or CFG-2 frame.
//!
//! Both convert to and from the canonical [`crate::model::ConfigurationFrame`].

use super::common::{
    fixed_name, name_from_bytes, Cursor, FrameType, ParseError, PrefixFrame, Version,
    CHECKSUM_SIZE, PREFIX_SIZE,
};
use super::phasors::PhasorType;
use super::units::{AnalogUnits, DigitalUnits, MeasurementType, NominalFrequency, PhasorUnits};
use super::utils::{append_checksum, soc_fracsec_from_ticks, validate_checksum};
use crate::measurement::Ticks;
use crate::model::{
    AnalogDefinition, ConfigurationCell, ConfigurationFrame as CanonicalConfiguration,
    DataFormats, DigitalDefinition, PhasorDefinition,
};
use serde::{Deserialize, Serialize};

/// TIME_BASE carries flags in bits 31-24; only the low 24 bits are the base.
pub const TIME_BASE_MASK: u32 = 0x00FF_FFFF;

/// Represents a single PMU's configuration in an IEEE C37.118 configuration frame.
///
/// # Fields
///
/// * `stn`: 16-byte station name.
/// * `idcode`: PMU identification code.
/// * `format`: Data format flags (e.g., phasor format, frequency format).
/// * `phnmr`: Number of phasor channels.
/// * `annmr`: Number of analog channels.
/// * `dgnmr`: Number of digital status words.
/// * `chnam`: Channel names (16 bytes per phasor/analog, 16 × 16 bytes per digital).
/// * `phunit`: Phasor unit conversion factors.
/// * `anunit`: Analog unit conversion factors.
/// * `digunit`: Digital unit masks.
/// * `fnom`: Nominal frequency (50 Hz or 60 Hz).
/// * `cfgcnt`: Configuration change count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PMUConfigurationFrame {
    pub stn: [u8; 16],
    pub idcode: u16,
    pub format: u16,
    pub phnmr: u16,
    pub annmr: u16,
    pub dgnmr: u16,
    pub chnam: Vec<u8>,
    pub phunit: Vec<PhasorUnits>,
    pub anunit: Vec<AnalogUnits>,
    pub digunit: Vec<DigitalUnits>,
    pub fnom: NominalFrequency,
    pub cfgcnt: u16,
}

impl PMUConfigurationFrame {
    /// Parses a PMU configuration block from a byte slice.
    ///
    /// # Returns
    ///
    /// * `Ok(PMUConfigurationFrame)`: The parsed PMU configuration.
    /// * `Err(ParseError)`: If the byte slice is malformed or too short.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut cursor = Cursor::new(bytes, 0, "PMUConfigurationFrame");
        Self::read(&mut cursor)
    }

    pub(crate) fn read(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let mut stn = [0u8; 16];
        stn.copy_from_slice(cursor.take(16)?);
        let idcode = cursor.u16()?;
        let format = cursor.u16()?;
        let phnmr = cursor.u16()?;
        let annmr = cursor.u16()?;
        let dgnmr = cursor.u16()?;

        let chnam_len = 16 * (phnmr as usize + annmr as usize + 16 * dgnmr as usize);
        let chnam = cursor.take(chnam_len)?.to_vec();

        let mut phunit = Vec::with_capacity(phnmr as usize);
        for _ in 0..phnmr {
            phunit.push(PhasorUnits::from_hex(cursor.take(4)?)?);
        }

        let mut anunit = Vec::with_capacity(annmr as usize);
        for _ in 0..annmr {
            anunit.push(AnalogUnits::from_hex(cursor.take(4)?)?);
        }

        let mut digunit = Vec::with_capacity(dgnmr as usize);
        for _ in 0..dgnmr {
            digunit.push(DigitalUnits::from_hex(cursor.take(4)?)?);
        }

        let fnom = NominalFrequency::from_hex(cursor.take(2)?)?;
        let cfgcnt = cursor.u16()?;

        Ok(PMUConfigurationFrame {
            stn,
            idcode,
            format,
            phnmr,
            annmr,
            dgnmr,
            chnam,
            phunit,
            anunit,
            digunit,
            fnom,
            cfgcnt,
        })
    }

    /// Converts the PMU configuration to a byte vector.
    pub fn to_hex(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.encoded_len());
        result.extend_from_slice(&self.stn);
        result.extend_from_slice(&self.idcode.to_be_bytes());
        result.extend_from_slice(&self.format.to_be_bytes());
        result.extend_from_slice(&self.phnmr.to_be_bytes());
        result.extend_from_slice(&self.annmr.to_be_bytes());
        result.extend_from_slice(&self.dgnmr.to_be_bytes());
        result.extend_from_slice(&self.chnam);

        for ph in &self.phunit {
            result.extend_from_slice(&ph.to_hex());
        }
        for an in &self.anunit {
            result.extend_from_slice(&an.to_hex());
        }
        for dg in &self.digunit {
            result.extend_from_slice(&dg.to_hex());
        }
        result.extend_from_slice(&self.fnom.to_hex());
        result.extend_from_slice(&self.cfgcnt.to_be_bytes());
        result
    }

    pub fn encoded_len(&self) -> usize {
        26 + self.chnam.len() + 4 * (self.phunit.len() + self.anunit.len() + self.digunit.len()) + 4
    }

    /// Returns the size of the FREQ and DFREQ fields in bytes.
    pub fn freq_dfreq_size(&self) -> usize {
        if self.format & 0x0008 != 0 {
            4
        } else {
            2
        }
    }

    /// Returns the size of an analog field in bytes.
    pub fn analog_size(&self) -> usize {
        if self.format & 0x0004 != 0 {
            4
        } else {
            2
        }
    }

    /// Returns the size of a phasor field in bytes.
    pub fn phasor_size(&self) -> usize {
        self.phasor_type().size()
    }

    pub fn phasor_type(&self) -> PhasorType {
        PhasorType::from_format(&DataFormats::from_format_word(self.format))
    }

    pub fn is_phasor_polar(&self) -> bool {
        self.format & 0x0001 != 0
    }

    /// Bytes one data cell of this PMU occupies in a data frame.
    pub fn data_cell_size(&self) -> usize {
        2 + self.phasor_size() * self.phnmr as usize
            + 2 * self.freq_dfreq_size()
            + self.analog_size() * self.annmr as usize
            + 2 * self.dgnmr as usize
    }

    pub fn station_name(&self) -> String {
        name_from_bytes(&self.stn)
    }

    /// Channel names in wire order, one per 16-byte slot.
    pub fn channel_names(&self) -> Vec<String> {
        self.chnam.chunks(16).map(name_from_bytes).collect()
    }

    /// Builds the wire block for a canonical cell.
    pub fn from_canonical(cell: &ConfigurationCell, cfgcnt: u16) -> Self {
        let mut chnam = Vec::with_capacity(16 * (cell.phasors.len() + cell.analogs.len()));
        for phasor in &cell.phasors {
            chnam.extend_from_slice(&fixed_name(&phasor.label));
        }
        for analog in &cell.analogs {
            chnam.extend_from_slice(&fixed_name(&analog.label));
        }
        for digital in &cell.digitals {
            for bit in 0..16 {
                let label = digital.labels.get(bit).map(String::as_str).unwrap_or("");
                chnam.extend_from_slice(&fixed_name(label));
            }
        }

        PMUConfigurationFrame {
            stn: fixed_name(&cell.station_name),
            idcode: cell.id_code,
            format: cell.formats.to_format_word(),
            phnmr: cell.phasors.len() as u16,
            annmr: cell.analogs.len() as u16,
            dgnmr: cell.digitals.len() as u16,
            chnam,
            phunit: cell
                .phasors
                .iter()
                .map(|p| PhasorUnits::from_kind(p.kind, p.scale))
                .collect(),
            anunit: cell
                .analogs
                .iter()
                .map(|a| AnalogUnits {
                    measurement_type: MeasurementType::from_kind(a.kind),
                    scale_factor: a.scale,
                })
                .collect(),
            digunit: cell
                .digitals
                .iter()
                .map(|d| DigitalUnits {
                    normal_status: d.normal_status,
                    valid_inputs: d.valid_inputs,
                })
                .collect(),
            fnom: cell.nominal_frequency.into(),
            cfgcnt,
        }
    }

    /// Canonical cell for this block. The ID label is the trimmed station name.
    pub fn to_canonical(&self) -> ConfigurationCell {
        let names = self.channel_names();
        let phnmr = self.phnmr as usize;
        let annmr = self.annmr as usize;
        let station = self.station_name();

        let mut cell = ConfigurationCell::new(self.idcode, station.clone(), station)
            .with_formats(DataFormats::from_format_word(self.format))
            .with_nominal_frequency(self.fnom.into());

        cell.phasors = self
            .phunit
            .iter()
            .enumerate()
            .map(|(i, unit)| PhasorDefinition {
                label: names.get(i).cloned().unwrap_or_default(),
                kind: unit.kind(),
                scale: unit.scale_factor,
            })
            .collect();
        cell.analogs = self
            .anunit
            .iter()
            .enumerate()
            .map(|(i, unit)| AnalogDefinition {
                label: names.get(phnmr + i).cloned().unwrap_or_default(),
                kind: unit.measurement_type.kind(),
                scale: unit.scale_factor,
            })
            .collect();
        cell.digitals = self
            .digunit
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let start = phnmr + annmr + 16 * i;
                DigitalDefinition {
                    labels: (start..start + 16)
                        .map(|n| names.get(n).cloned().unwrap_or_default())
                        .collect(),
                    normal_status: unit.normal_status,
                    valid_inputs: unit.valid_inputs,
                }
            })
            .collect();
        cell
    }
}

/// Represents an IEEE C37.118 configuration frame (CFG-1 or CFG-2).
///
/// # Fields
///
/// * `prefix`: Common frame prefix (SYNC, frame size, ID code, timestamp).
/// * `time_base`: TIME_BASE word (flags in the top byte, base in the low 24 bits).
/// * `num_pmu`: Number of PMU configurations.
/// * `pmu_configs`: Vector of PMU configurations.
/// * `data_rate`: Frames per second if positive, seconds per frame if negative.
/// * `chk`: CRC-CCITT checksum.
/// * `cfg_type`: Configuration frame type (1 or 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationFrame {
    pub prefix: PrefixFrame,
    pub time_base: u32,
    pub num_pmu: u16,
    pub pmu_configs: Vec<PMUConfigurationFrame>,
    pub data_rate: i16,
    pub chk: u16,
    pub cfg_type: u8,
}

impl ConfigurationFrame {
    /// Parses a configuration frame and validates its checksum.
    ///
    /// # Returns
    ///
    /// * `Ok(ConfigurationFrame)`: The parsed configuration frame.
    /// * `Err(ParseError)`: If the frame is invalid, too short, or has an incorrect
    ///   checksum or frame type.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::from_hex_with(bytes, true)
    }

    pub fn from_hex_with(bytes: &[u8], verify_checksum: bool) -> Result<Self, ParseError> {
        let prefix = PrefixFrame::from_hex(bytes)?;

        let frame_type = prefix.frame_type()?;
        let cfg_type = match frame_type {
            FrameType::Config1 => 1,
            FrameType::Config2 => 2,
            _ => {
                return Err(ParseError::InvalidFrameType {
                    message: format!(
                        "ConfigurationFrame: expected CFG-1 or CFG-2, got {}",
                        frame_type
                    ),
                })
            }
        };

        prefix.expect_framesize(bytes.len(), "ConfigurationFrame")?;
        if verify_checksum {
            validate_checksum(bytes)?;
        }

        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];
        let mut cursor = Cursor::new(body, PREFIX_SIZE, "ConfigurationFrame");
        let time_base = cursor.u32()?;
        let num_pmu = cursor.u16()?;

        let mut pmu_configs = Vec::with_capacity(num_pmu as usize);
        for _ in 0..num_pmu {
            pmu_configs.push(PMUConfigurationFrame::read(&mut cursor)?);
        }

        let data_rate = cursor.i16()?;
        if cursor.remaining() != 0 {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "ConfigurationFrame: {} trailing bytes before checksum",
                    cursor.remaining()
                ),
            });
        }
        let chk = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);

        Ok(ConfigurationFrame {
            prefix,
            time_base,
            num_pmu,
            pmu_configs,
            data_rate,
            chk,
            cfg_type,
        })
    }

    /// Converts the configuration frame to bytes, filling FRAMESIZE and CHK.
    ///
    /// # Returns
    ///
    /// * `Err(ParseError::InvalidLength)`: If the frame would exceed 65535 bytes.
    pub fn to_hex(&self) -> Result<Vec<u8>, ParseError> {
        let frame_size = PREFIX_SIZE
            + 6
            + self
                .pmu_configs
                .iter()
                .map(PMUConfigurationFrame::encoded_len)
                .sum::<usize>()
            + 2
            + CHECKSUM_SIZE;
        if frame_size > u16::MAX as usize {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "ConfigurationFrame: {} bytes exceeds the 65535 byte frame limit",
                    frame_size
                ),
            });
        }

        let mut prefix = self.prefix.clone();
        prefix.framesize = frame_size as u16;

        let mut result = Vec::with_capacity(frame_size);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&self.time_base.to_be_bytes());
        result.extend_from_slice(&(self.pmu_configs.len() as u16).to_be_bytes());
        for pmu in &self.pmu_configs {
            result.extend_from_slice(&pmu.to_hex());
        }
        result.extend_from_slice(&self.data_rate.to_be_bytes());
        append_checksum(&mut result);
        Ok(result)
    }

    /// Calculates the size of a data frame produced under this configuration.
    pub fn calc_data_frame_size(&self) -> usize {
        PREFIX_SIZE
            + CHECKSUM_SIZE
            + self
                .pmu_configs
                .iter()
                .map(PMUConfigurationFrame::data_cell_size)
                .sum::<usize>()
    }

    pub fn version(&self) -> Version {
        self.prefix.version
    }

    pub fn effective_time_base(&self) -> u32 {
        self.time_base & TIME_BASE_MASK
    }

    /// Projects a canonical configuration into a CFG-1 or CFG-2 frame stamped at
    /// `timestamp`, with every PMU block carrying `cfgcnt`.
    pub fn from_canonical(
        config: &CanonicalConfiguration,
        frame_type: FrameType,
        version: Version,
        cfgcnt: u16,
        timestamp: Ticks,
    ) -> Result<Self, ParseError> {
        let cfg_type = match frame_type {
            FrameType::Config1 => 1,
            FrameType::Config2 => 2,
            other => {
                return Err(ParseError::InvalidFrameType {
                    message: format!("ConfigurationFrame: cannot build {}", other),
                })
            }
        };
        let time_base = config.time_base & TIME_BASE_MASK;
        let (soc, fracsec) = soc_fracsec_from_ticks(timestamp, time_base);

        Ok(ConfigurationFrame {
            prefix: PrefixFrame::new(version, frame_type, config.id_code).with_time(soc, fracsec),
            time_base,
            num_pmu: config.cells.len() as u16,
            pmu_configs: config
                .cells
                .iter()
                .map(|cell| PMUConfigurationFrame::from_canonical(cell, cfgcnt))
                .collect(),
            data_rate: config.frame_rate.min(i16::MAX as u16) as i16,
            chk: 0,
            cfg_type,
        })
    }

    /// Canonical configuration for this frame.
    ///
    /// Negative data rates (seconds per frame) map to one frame per second.
    pub fn to_canonical(&self) -> CanonicalConfiguration {
        CanonicalConfiguration {
            id_code: self.prefix.idcode,
            frame_rate: if self.data_rate > 0 {
                self.data_rate as u16
            } else {
                1
            },
            time_base: self.effective_time_base(),
            cells: self
                .pmu_configs
                .iter()
                .map(PMUConfigurationFrame::to_canonical)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::TICKS_PER_SECOND;
    use crate::model::{AnalogKind, LineFrequency, PhasorKind};

    fn canonical() -> CanonicalConfiguration {
        CanonicalConfiguration::new(7734, 30)
            .with_cell(
                ConfigurationCell::new(7734, "Station A", "Station A")
                    .with_nominal_frequency(LineFrequency::Hz50)
                    .with_phasor("VA", PhasorKind::Voltage, 915_527)
                    .with_phasor("I1", PhasorKind::Current, 45_776)
                    .with_analog("ANALOG1", AnalogKind::Peak, -3)
                    .with_digital(DigitalDefinition::with_prefix("BREAKER")),
            )
            .with_cell(ConfigurationCell::new(7735, "Station B", "Station B"))
    }

    #[test]
    fn test_config2_layout_matches_counts() {
        let timestamp = 1_149_577_200 * TICKS_PER_SECOND;
        let frame = ConfigurationFrame::from_canonical(
            &canonical(),
            FrameType::Config2,
            Version::V2005,
            3,
            timestamp,
        )
        .unwrap();
        let bytes = frame.to_hex().unwrap();

        assert_eq!(&bytes[0..2], &[0xAA, 0x31]);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        // STN + counts + 2 phasor + 1 analog + 16 digital names + 4 units + FNOM/CFGCNT
        let first_block = 26 + 16 * 19 + 16 + 4;
        let second_block = 26 + 4;
        assert_eq!(bytes.len(), 14 + 6 + first_block + second_block + 2 + 2);

        let parsed = ConfigurationFrame::from_hex(&bytes).unwrap();
        assert_eq!(parsed.cfg_type, 2);
        assert_eq!(parsed.prefix.soc, 1_149_577_200);
        assert_eq!(parsed.pmu_configs[0].cfgcnt, 3);
        assert_eq!(parsed.pmu_configs[0].fnom, NominalFrequency::Hz50);
        assert_eq!(parsed.to_canonical(), canonical());
    }

    #[test]
    fn test_corrupted_frames_are_rejected() {
        let frame = ConfigurationFrame::from_canonical(
            &canonical(),
            FrameType::Config1,
            Version::V2011,
            0,
            0,
        )
        .unwrap();
        let mut bytes = frame.to_hex().unwrap();

        let short = &bytes[..bytes.len() - 5];
        assert!(matches!(
            ConfigurationFrame::from_hex(short),
            Err(ParseError::InvalidLength { .. })
        ));

        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ConfigurationFrame::from_hex(&bytes),
            Err(ParseError::InvalidChecksum { .. })
        ));
        assert!(ConfigurationFrame::from_hex_with(&bytes, false).is_ok());
    }

    #[test]
    fn test_data_frame_size_follows_format() {
        let frame = ConfigurationFrame::from_canonical(
            &canonical(),
            FrameType::Config2,
            Version::V2011,
            0,
            0,
        )
        .unwrap();
        // Cell A: STAT + 2×8 phasors + 2×4 freq + 4 analog + 2 digital.
        // Cell B: STAT + 2×4 freq.
        assert_eq!(frame.calc_data_frame_size(), 16 + (2 + 16 + 8 + 4 + 2) + (2 + 8));
    }

    #[test]
    fn test_oversized_configuration_fails() {
        let mut cell = ConfigurationCell::new(1, "BIG", "BIG");
        for i in 0..3500 {
            cell = cell.with_phasor(format!("PH{}", i), PhasorKind::Voltage, 1);
        }
        let config = CanonicalConfiguration::new(1, 30).with_cell(cell);
        let frame =
            ConfigurationFrame::from_canonical(&config, FrameType::Config2, Version::V2011, 0, 0)
                .unwrap();
        assert!(matches!(
            frame.to_hex(),
            Err(ParseError::InvalidLength { .. })
        ));
    }
}
